//! Engine configuration.
//!
//! All knobs are plain structs with [`Default`] implementations so callers can
//! override a single field with struct-update syntax:
//!
//! ```
//! use cyanea_hmm::config::{CachePolicy, HmmConfig};
//!
//! let config = HmmConfig {
//!     parallelism: 4,
//!     cache: CachePolicy::Slots(8),
//!     ..Default::default()
//! };
//! assert_eq!(config.pseudo, 1e-3);
//! ```

/// How forward/backward tables are retained between queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CachePolicy {
    /// One slot per observation sequence.
    PerSequence,
    /// A fixed pool of `k` slots; sequence `d` maps to slot `d % k`.
    Slots(usize),
    /// No tables are retained; every query recomputes in scratch rows.
    Disabled,
}

impl CachePolicy {
    /// Number of slots to allocate for `num_sequences` sequences.
    pub fn slot_count(self, num_sequences: usize) -> usize {
        match self {
            CachePolicy::PerSequence => num_sequences,
            CachePolicy::Slots(k) => k.min(num_sequences),
            CachePolicy::Disabled => 0,
        }
    }
}

/// Stopping rule for iterative training.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvergenceCriteria {
    /// Hard cap on training iterations.
    pub max_iterations: usize,
    /// Absolute log-likelihood change below which an iteration counts as stable.
    pub epsilon: f64,
    /// Consecutive stable iterations required before declaring convergence.
    pub patience: usize,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 150,
            epsilon: 1e-4,
            patience: 5,
        }
    }
}

/// Configuration for an [`Hmm`](crate::Hmm).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HmmConfig {
    /// Pseudo-count added to every estimated cell during training.
    pub pseudo: f64,
    /// Worker threads for per-sequence fan-out. `<= 1` runs sequentially.
    pub parallelism: usize,
    /// Forward/backward table retention.
    pub cache: CachePolicy,
    /// Training stopping rule.
    pub convergence: ConvergenceCriteria,
    /// Seed for random initializations.
    pub seed: u64,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            pseudo: 1e-3,
            parallelism: 1,
            cache: CachePolicy::PerSequence,
            convergence: ConvergenceCriteria::default(),
            seed: 42,
        }
    }
}
