use std::fmt;

use xxhash_rust::xxh3::Xxh3;

use crate::shared::frame::Frame;

const XXH3_SEED: u64 = 0x5f3c_a2e1_9b7d_4c08;

/// 128-bit content fingerprint used as a cache key.
///
/// Collisions are not checked for; at 128 bits they are treated as impossible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut builder = FingerprintBuilder::new();
        builder.write_bytes(bytes);
        builder.finish()
    }

    /// Fingerprint of a frame's geometry and pixels. The frame index is not
    /// hashed, so identical frames at different times share an entry.
    pub fn of_frame(frame: &Frame) -> Self {
        let mut builder = FingerprintBuilder::new();
        builder.write_frame(frame);
        builder.finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Incremental fingerprint over heterogeneous inputs (pixels plus parameters).
pub struct FingerprintBuilder {
    inner: Xxh3,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            inner: Xxh3::with_seed(XXH3_SEED),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        // Length prefix keeps ("ab", "c") distinct from ("a", "bc").
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.write_u32(v.to_bits())
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.write_u64(v.to_bits())
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.inner.update(&[u8::from(v)]);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_frame(&mut self, frame: &Frame) -> &mut Self {
        self.write_u32(frame.width())
            .write_u32(frame.height())
            .write_u32(frame.channels() as u32)
            .write_bytes(frame.data())
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.inner.digest128())
    }
}
