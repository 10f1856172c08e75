use thiserror::Error;

use crate::shared::face::AffineMatrix;
use crate::shared::frame::Frame;

#[derive(Error, Debug, PartialEq)]
pub enum WarpError {
    #[error("alignment matrix is singular")]
    Singular,
    #[error("channel mismatch: frame has {frame}, face has {face}")]
    ChannelMismatch { frame: u8, face: u8 },
    #[error("mask must have one channel, got {0}")]
    MaskChannels(u8),
}

/// Resamples `src` into a `width` x `height` image, where `matrix` maps
/// source coordinates to output coordinates. Pixels that fall outside the
/// source are black.
pub fn warp_affine(
    src: &Frame,
    matrix: &AffineMatrix,
    width: u32,
    height: u32,
) -> Result<Frame, WarpError> {
    let inverse = matrix.invert().ok_or(WarpError::Singular)?;
    let channels = src.channels();
    let mut out = Frame::filled(width, height, channels, 0);
    let stride = channels as usize;
    let data = out.data_mut();
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = inverse.transform_point(x as f32, y as f32);
            let base = (y as usize * width as usize + x as usize) * stride;
            for c in 0..stride {
                if let Some(v) = src.sample_bilinear(sx, sy, c) {
                    data[base + c] = v.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
    Ok(out)
}

/// Blends `face` back into `frame` through the inverse of `matrix`
/// (frame -> face space), weighted by `mask` and `opacity`.
pub fn paste_face(
    frame: &mut Frame,
    face: &Frame,
    mask: &Frame,
    matrix: &AffineMatrix,
    opacity: f32,
) -> Result<(), WarpError> {
    if frame.channels() != face.channels() {
        return Err(WarpError::ChannelMismatch {
            frame: frame.channels(),
            face: face.channels(),
        });
    }
    if mask.channels() != 1 {
        return Err(WarpError::MaskChannels(mask.channels()));
    }
    let inverse = matrix.invert().ok_or(WarpError::Singular)?;
    if frame.width() == 0 || frame.height() == 0 {
        return Ok(());
    }

    // Bounding box of the face quad in frame space.
    let fw = face.width() as f32 - 1.0;
    let fh = face.height() as f32 - 1.0;
    let corners = [(0.0, 0.0), (fw, 0.0), (0.0, fh), (fw, fh)].map(|(x, y)| inverse.transform_point(x, y));
    let min_x = corners.iter().map(|p| p.0).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|p| p.1).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|p| p.0).fold(f32::MIN, f32::max).ceil() as i64)
        .clamp(0, frame.width() as i64 - 1) as u32;
    let max_y = (corners.iter().map(|p| p.1).fold(f32::MIN, f32::max).ceil() as i64)
        .clamp(0, frame.height() as i64 - 1) as u32;

    let opacity = opacity.clamp(0.0, 1.0);
    let width = frame.width() as usize;
    let stride = frame.channels() as usize;
    let data = frame.data_mut();
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let (fx, fy) = matrix.transform_point(x as f32, y as f32);
            let Some(m) = mask.sample_bilinear(fx, fy, 0) else {
                continue;
            };
            let alpha = m / 255.0 * opacity;
            if alpha <= 0.0 {
                continue;
            }
            let base = (y as usize * width + x as usize) * stride;
            for c in 0..stride {
                if let Some(v) = face.sample_bilinear(fx, fy, c) {
                    let dst = data[base + c] as f32;
                    data[base + c] = (dst * (1.0 - alpha) + v * alpha).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::new(data, width, height, 3, 0)
    }

    #[test]
    fn test_paste_into_empty_frame_is_noop() {
        let mut frame = Frame::filled(0, 0, 3, 0);
        let face = Frame::filled(4, 4, 3, 255);
        let mask = Frame::filled(4, 4, 1, 255);
        paste_face(&mut frame, &face, &mask, &AffineMatrix::identity(), 1.0).unwrap();
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_identity_warp_copies_pixels() {
        let src = gradient(8, 6);
        let out = warp_affine(&src, &AffineMatrix::identity(), 8, 6).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_translation_shifts_content() {
        let src = gradient(8, 8);
        let shift = AffineMatrix {
            m: [[1.0, 0.0, -2.0], [0.0, 1.0, -3.0]],
        };
        let out = warp_affine(&src, &shift, 4, 4).unwrap();
        // Output (0, 0) samples source (2, 3).
        assert_eq!(&out.data()[0..3], &[2, 3, 0]);
    }

    #[test]
    fn test_outside_source_is_black() {
        let src = Frame::filled(4, 4, 3, 200);
        let shift = AffineMatrix {
            m: [[1.0, 0.0, 10.0], [0.0, 1.0, 10.0]],
        };
        let out = warp_affine(&src, &shift, 4, 4).unwrap();
        assert!(out.data().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let src = Frame::filled(4, 4, 3, 0);
        let singular = AffineMatrix {
            m: [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
        };
        assert_eq!(warp_affine(&src, &singular, 2, 2), Err(WarpError::Singular));
    }

    #[test]
    fn test_paste_with_full_mask_replaces_region() {
        let mut frame = Frame::filled(10, 10, 3, 0);
        let face = Frame::filled(4, 4, 3, 255);
        let mask = Frame::filled(4, 4, 1, 255);
        // Frame (3, 3) maps to face (0, 0).
        let matrix = AffineMatrix {
            m: [[1.0, 0.0, -3.0], [0.0, 1.0, -3.0]],
        };

        paste_face(&mut frame, &face, &mask, &matrix, 1.0).unwrap();

        let px = |x: usize, y: usize| frame.data()[(y * 10 + x) * 3];
        assert_eq!(px(3, 3), 255);
        assert_eq!(px(6, 6), 255);
        assert_eq!(px(0, 0), 0);
        assert_eq!(px(8, 8), 0);
    }

    #[test]
    fn test_paste_respects_opacity() {
        let mut frame = Frame::filled(4, 4, 3, 0);
        let face = Frame::filled(4, 4, 3, 200);
        let mask = Frame::filled(4, 4, 1, 255);

        paste_face(&mut frame, &face, &mask, &AffineMatrix::identity(), 0.5).unwrap();

        assert_eq!(frame.data()[0], 100);
    }

    #[test]
    fn test_paste_zero_mask_leaves_frame() {
        let mut frame = Frame::filled(4, 4, 3, 10);
        let face = Frame::filled(4, 4, 3, 200);
        let mask = Frame::filled(4, 4, 1, 0);

        paste_face(&mut frame, &face, &mask, &AffineMatrix::identity(), 1.0).unwrap();

        assert!(frame.data().iter().all(|&v| v == 10));
    }

    #[test]
    fn test_paste_rejects_multichannel_mask() {
        let mut frame = Frame::filled(4, 4, 3, 0);
        let face = Frame::filled(4, 4, 3, 0);
        let mask = Frame::filled(4, 4, 3, 0);
        assert_eq!(
            paste_face(&mut frame, &face, &mask, &AffineMatrix::identity(), 1.0),
            Err(WarpError::MaskChannels(3))
        );
    }
}
