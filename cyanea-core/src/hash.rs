//! SHA-256 hashing for content addressing of in-memory data.
//!
//! [`ContentHasher`] feeds numeric data in a fixed little-endian layout so
//! that two values with identical content always produce the same digest,
//! independent of how they are laid out in memory.

use sha2::{Digest, Sha256};

/// Calculate the SHA-256 hash of in-memory data.
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Incremental SHA-256 over typed numeric content.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a length or count as a little-endian `u64`.
    pub fn update_usize(&mut self, value: usize) -> &mut Self {
        self.inner.update((value as u64).to_le_bytes());
        self
    }

    /// Feed a slice of floats by their IEEE-754 bit patterns.
    ///
    /// `-0.0` and `0.0` hash differently; NaN payloads are preserved.
    pub fn update_f64s(&mut self, values: &[f64]) -> &mut Self {
        self.update_usize(values.len());
        for v in values {
            self.inner.update(v.to_bits().to_le_bytes());
        }
        self
    }

    /// Consume the hasher and return the hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
