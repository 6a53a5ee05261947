//! Forward/backward table cache with explicit invalidation.
//!
//! An [`AlphaBetaCache`] is a pool of slots, each able to hold the `alpha` and
//! `beta` tables, their sums and the decoded Viterbi path of one observation
//! sequence. Slots are addressed by `dim % slot_count`; a slot that currently
//! holds another sequence is reset before reuse.
//!
//! The cache records the [`ParameterStore`](crate::params::ParameterStore)
//! revision it was filled from. [`sync`](AlphaBetaCache::sync) with a
//! different revision empties it in place without releasing memory.

use crate::config::CachePolicy;

/// Cached results for one observation sequence.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    dimension: Option<usize>,
    pub(crate) alpha: Vec<f64>,
    pub(crate) alpha_sum: f64,
    pub(crate) alpha_updated: bool,
    pub(crate) beta: Vec<f64>,
    pub(crate) beta_sum: f64,
    pub(crate) beta_updated: bool,
    pub(crate) path: Vec<usize>,
    pub(crate) path_log_prob: f64,
    pub(crate) path_updated: bool,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            dimension: None,
            alpha: Vec::new(),
            alpha_sum: f64::NEG_INFINITY,
            alpha_updated: false,
            beta: Vec::new(),
            beta_sum: f64::NEG_INFINITY,
            beta_updated: false,
            path: Vec::new(),
            path_log_prob: f64::NEG_INFINITY,
            path_updated: false,
        }
    }

    fn reset(&mut self, dimension: Option<usize>) {
        self.dimension = dimension;
        self.alpha_updated = false;
        self.beta_updated = false;
        self.path_updated = false;
    }

    /// Sequence currently held by this slot.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Forward table and sequence log-likelihood, if computed.
    pub fn alpha(&self) -> Option<(&[f64], f64)> {
        self.alpha_updated
            .then(|| (self.alpha.as_slice(), self.alpha_sum))
    }

    /// Backward table and its total, if computed.
    pub fn beta(&self) -> Option<(&[f64], f64)> {
        self.beta_updated.then(|| (self.beta.as_slice(), self.beta_sum))
    }

    /// Best path and its log-probability, if decoded.
    pub fn path(&self) -> Option<(&[usize], f64)> {
        self.path_updated
            .then(|| (self.path.as_slice(), self.path_log_prob))
    }
}

/// Slot pool of per-sequence inference results.
#[derive(Debug, Clone)]
pub struct AlphaBetaCache {
    policy: CachePolicy,
    slots: Vec<CacheSlot>,
    revision: Option<u64>,
    mean_log_likelihood: Option<f64>,
    mean_best_path: Option<f64>,
}

impl AlphaBetaCache {
    /// Allocate `policy.slot_count(num_sequences)` empty slots.
    ///
    /// Table memory is allocated on first use of each slot.
    pub fn new(policy: CachePolicy, num_sequences: usize) -> Self {
        let count = policy.slot_count(num_sequences);
        Self {
            policy,
            slots: (0..count).map(|_| CacheSlot::empty()).collect(),
            revision: None,
            mean_log_likelihood: None,
            mean_best_path: None,
        }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self::new(CachePolicy::Disabled, 0)
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Whether any tables can be retained.
    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Parameter revision the cached values belong to.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Empty the cache unless it already belongs to `revision`.
    pub(crate) fn sync(&mut self, revision: u64) {
        if self.revision != Some(revision) {
            self.clear();
            self.revision = Some(revision);
        }
    }

    /// Re-tag the contents as belonging to `revision` without clearing.
    ///
    /// Only valid when the parameters behind `revision` are identical to the
    /// ones the cache was filled from.
    pub(crate) fn relabel(&mut self, revision: u64) {
        self.revision = Some(revision);
    }

    /// Forget every cached value.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.reset(None);
        }
        self.mean_log_likelihood = None;
        self.mean_best_path = None;
        self.revision = None;
    }

    /// The slot holding sequence `dim`, if it is resident.
    pub fn slot(&self, dim: usize) -> Option<&CacheSlot> {
        if self.slots.is_empty() {
            return None;
        }
        let slot = &self.slots[dim % self.slots.len()];
        (slot.dimension == Some(dim)).then_some(slot)
    }

    /// The slot for sequence `dim`, evicting whatever it held before.
    pub(crate) fn slot_mut(&mut self, dim: usize) -> Option<&mut CacheSlot> {
        if self.slots.is_empty() {
            return None;
        }
        let k = self.slots.len();
        let slot = &mut self.slots[dim % k];
        if slot.dimension != Some(dim) {
            slot.reset(Some(dim));
        }
        Some(slot)
    }

    pub fn mean_log_likelihood(&self) -> Option<f64> {
        self.mean_log_likelihood
    }

    pub(crate) fn set_mean_log_likelihood(&mut self, value: f64) {
        self.mean_log_likelihood = Some(value);
    }

    pub fn mean_best_path(&self) -> Option<f64> {
        self.mean_best_path
    }

    pub(crate) fn set_mean_best_path(&mut self, value: f64) {
        self.mean_best_path = Some(value);
    }
}
