use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Deterministic hasher for problem fingerprints used as cache keys.
pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: Hash + ?Sized>(&mut self, value: &T) {
        value.hash(&mut self.inner);
    }

    /// Floats are hashed by bit pattern.
    pub fn write_f32(&mut self, value: f32) {
        self.inner.write_u32(value.to_bits());
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}
