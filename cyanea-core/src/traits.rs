//! Core trait definitions for the Cyanea ecosystem.
//!
//! These traits define the contracts that domain types implement across crates.

/// A batch of tokenized observation sequences.
///
/// Each sequence is addressed by its *dimension* (index within the batch) and
/// holds integer symbols. Consumers only read lengths and symbols; ownership
/// stays with the implementor.
pub trait ObservationSet {
    /// Number of sequences in the batch.
    fn num_sequences(&self) -> usize;

    /// Length of sequence `dim`.
    fn length_of(&self, dim: usize) -> usize;

    /// Symbol at position `t` of sequence `dim`.
    fn symbol_at(&self, dim: usize, t: usize) -> usize;

    /// Length of the longest sequence (0 for an empty batch).
    fn max_length(&self) -> usize {
        (0..self.num_sequences())
            .map(|d| self.length_of(d))
            .max()
            .unwrap_or(0)
    }

    /// Total number of symbols across all sequences.
    fn total_length(&self) -> usize {
        (0..self.num_sequences()).map(|d| self.length_of(d)).sum()
    }
}

/// A type whose identity can be derived from its content via cryptographic hash.
pub trait ContentAddressable {
    /// Return the content hash as a hex string (e.g. SHA-256).
    fn content_hash(&self) -> String;
}

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}
