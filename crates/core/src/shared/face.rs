//! Per-face metadata carried by compute records: bounding rect, 5-point
//! landmarks and the alignment transform from frame space to aligned-face space.

/// Landmark order: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub const LANDMARK_COUNT: usize = 5;

/// Reference 5-point layout of a frontal face, normalized to a unit square
/// the face fills.
pub const CANONICAL_LANDMARKS: [(f32, f32); LANDMARK_COUNT] = [
    (0.3419, 0.4616),
    (0.6565, 0.4598),
    (0.5002, 0.6405),
    (0.3710, 0.8247),
    (0.6315, 0.8232),
];

/// Axis-aligned face rectangle in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Scales the rect around its center.
    pub fn scaled(&self, factor: f32) -> Self {
        let (cx, cy) = self.center();
        let w = self.width * factor;
        let h = self.height * factor;
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceLandmarks {
    points: [(f32, f32); LANDMARK_COUNT],
}

impl FaceLandmarks {
    pub fn new(points: [(f32, f32); LANDMARK_COUNT]) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f32, f32); LANDMARK_COUNT] {
        &self.points
    }

    /// Mean of all points.
    pub fn centroid(&self) -> (f32, f32) {
        let n = LANDMARK_COUNT as f32;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    }
}

/// 2x3 affine transform: `[x', y'] = M * [x, y, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMatrix {
    pub m: [[f32; 3]; 2],
}

impl AffineMatrix {
    pub fn identity() -> Self {
        Self {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.m;
        (
            m[0][0] * x + m[0][1] * y + m[0][2],
            m[1][0] * x + m[1][1] * y + m[1][2],
        )
    }

    pub fn invert(&self) -> Option<Self> {
        let m = &self.m;
        let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
        if det.abs() < f32::EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = m[1][1] * inv_det;
        let b = -m[0][1] * inv_det;
        let c = -m[1][0] * inv_det;
        let d = m[0][0] * inv_det;
        let tx = -(a * m[0][2] + b * m[1][2]);
        let ty = -(c * m[0][2] + d * m[1][2]);
        Some(Self {
            m: [[a, b, tx], [c, d, ty]],
        })
    }

    /// Least-squares rotation + uniform scale + translation mapping `src` onto `dst`.
    pub fn estimate_similarity(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 2 {
            return None;
        }
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (sx, sy) = mean(src);
        let (dx, dy) = mean(dst);

        let mut num_a = 0.0;
        let mut num_b = 0.0;
        let mut den = 0.0;
        for (&(xs, ys), &(xd, yd)) in src.iter().zip(dst) {
            let (xs, ys) = (xs - sx, ys - sy);
            let (xd, yd) = (xd - dx, yd - dy);
            num_a += xs * xd + ys * yd;
            num_b += xs * yd - ys * xd;
            den += xs * xs + ys * ys;
        }
        if den < f32::EPSILON {
            return None;
        }
        let a = num_a / den;
        let b = num_b / den;
        Some(Self {
            m: [
                [a, -b, dx - (a * sx - b * sy)],
                [b, a, dy - (b * sx + a * sy)],
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rect_center_and_scale() {
        let r = FaceRect::new(10.0, 20.0, 40.0, 60.0);
        assert_eq!(r.center(), (30.0, 50.0));
        let s = r.scaled(2.0);
        assert_eq!(s.center(), (30.0, 50.0));
        assert_relative_eq!(s.width, 80.0);
        assert_relative_eq!(s.area(), 80.0 * 120.0);
    }

    #[test]
    fn test_landmark_centroid() {
        let lm = FaceLandmarks::new([(0.0, 0.0), (10.0, 0.0), (5.0, 5.0), (0.0, 10.0), (10.0, 10.0)]);
        let (cx, cy) = lm.centroid();
        assert_relative_eq!(cx, 5.0);
        assert_relative_eq!(cy, 5.0);
    }

    #[test]
    fn test_identity_transform_keeps_points() {
        assert_eq!(AffineMatrix::identity().transform_point(3.0, 4.0), (3.0, 4.0));
    }

    #[test]
    fn test_inverse_round_trips_point() {
        let mat = AffineMatrix {
            m: [[0.5, -0.2, 10.0], [0.2, 0.5, -4.0]],
        };
        let inv = mat.invert().unwrap();
        let (x, y) = mat.transform_point(17.0, 33.0);
        let (bx, by) = inv.transform_point(x, y);
        assert_relative_eq!(bx, 17.0, epsilon = 1e-3);
        assert_relative_eq!(by, 33.0, epsilon = 1e-3);
    }

    #[test]
    fn test_singular_matrix_has_no_inverse() {
        let mat = AffineMatrix {
            m: [[0.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
        };
        assert!(mat.invert().is_none());
    }

    #[test]
    fn test_similarity_recovers_scale_and_translation() {
        let src = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|(x, y)| (x * 2.0 + 5.0, y * 2.0 - 3.0)).collect();
        let mat = AffineMatrix::estimate_similarity(&src, &dst).unwrap();
        assert_relative_eq!(mat.m[0][0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(mat.m[0][1], 0.0, epsilon = 1e-4);
        assert_relative_eq!(mat.m[0][2], 5.0, epsilon = 1e-3);
        assert_relative_eq!(mat.m[1][2], -3.0, epsilon = 1e-3);
    }

    #[test]
    fn test_similarity_recovers_rotation() {
        // 90 degree rotation: (x, y) -> (-y, x)
        let src = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|(x, y)| (-y, *x)).collect();
        let mat = AffineMatrix::estimate_similarity(&src, &dst).unwrap();
        let (x, y) = mat.transform_point(2.0, 0.0);
        assert_relative_eq!(x, 0.0, epsilon = 1e-4);
        assert_relative_eq!(y, 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_similarity_rejects_degenerate_input() {
        let pts = [(1.0, 1.0), (1.0, 1.0)];
        assert!(AffineMatrix::estimate_similarity(&pts, &pts).is_none());
        assert!(AffineMatrix::estimate_similarity(&pts[..1], &pts[..1]).is_none());
    }
}
