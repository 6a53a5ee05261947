//! The [`Hmm`] facade: parameters, bound observations, cached inference and
//! training behind one handle.
//!
//! ```
//! use std::sync::Arc;
//! use cyanea_hmm::{Hmm, HmmConfig, ParameterStore, SequenceSet, TimeIndex};
//!
//! // 2-state left-to-right model that must end in state 1.
//! let params = ParameterStore::from_probabilities(
//!     2,
//!     2,
//!     vec![0.5, 0.5],
//!     vec![0.0, 1.0],
//!     vec![0.5, 0.5, 0.0, 1.0],
//!     vec![0.9, 0.1, 0.1, 0.9],
//! )
//! .unwrap();
//! let mut hmm = Hmm::new(params, HmmConfig::default()).unwrap();
//! hmm.bind_observations(Arc::new(SequenceSet::new(vec![vec![0, 0, 1]]))).unwrap();
//!
//! let (path, _) = hmm.best_path(0).unwrap();
//! assert_eq!(path, vec![0, 0, 1]);
//! let ll = hmm.forward(TimeIndex::Total, 0, 0).unwrap();
//! assert!((ll - 0.115875_f64.ln()).abs() < 1e-10);
//! ```
//!
//! Queries take `&mut self` because they fill the cache. Every parameter
//! mutation (through [`Hmm::params_mut`], [`Hmm::normalize`] or training)
//! bumps the parameter revision, and stale cached values are discarded the
//! next time the cache is consulted.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cyanea_core::{ContentAddressable, CyaneaError, ObservationSet, Result};
use tracing::{debug, info};

use crate::cache::{AlphaBetaCache, CacheSlot};
use crate::config::{ConvergenceCriteria, HmmConfig};
use crate::inference::{
    backward_row, backward_table, forward_likelihood, forward_row, forward_table, originate,
    viterbi_path, viterbi_row, Workspace,
};
use crate::model::Model;
use crate::observations::validate_observations;
use crate::parallel::{mean_best_path, mean_log_likelihood, Dispatcher};
use crate::params::ParameterStore;
use crate::train::{BaumWelchMode, Convergence, Trainer, TrainingReport, ViterbiMode};

/// Shared handle to a bound observation set.
pub type SharedObservations = Arc<dyn ObservationSet + Send + Sync>;

/// Position argument of [`Hmm::forward`], [`Hmm::backward`] and [`Hmm::viterbi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeIndex {
    /// A position inside the sequence. Positions at or past the end are
    /// interpreted per query.
    At(usize),
    /// The whole-sequence value (likelihood or best-path probability).
    Total,
}

impl From<usize> for TimeIndex {
    fn from(t: usize) -> Self {
        TimeIndex::At(t)
    }
}

/// Where the current cache handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOrigin {
    Owned,
    /// Shared from another [`Hmm`] whose parameters matched ours at `revision`.
    Borrowed { revision: u64 },
}

/// Which cached results a query needs.
#[derive(Debug, Clone, Copy)]
struct Need {
    alpha: bool,
    beta: bool,
    path: bool,
}

impl Need {
    const ALPHA: Need = Need {
        alpha: true,
        beta: false,
        path: false,
    };
    const BETA: Need = Need {
        alpha: false,
        beta: true,
        path: false,
    };
    const TABLES: Need = Need {
        alpha: true,
        beta: true,
        path: false,
    };
    const PATH: Need = Need {
        alpha: false,
        beta: false,
        path: true,
    };

    fn satisfied_by(self, slot: &CacheSlot) -> bool {
        (!self.alpha || slot.alpha_updated)
            && (!self.beta || slot.beta_updated)
            && (!self.path || slot.path_updated)
    }
}

// ---------------------------------------------------------------------------
// Hmm
// ---------------------------------------------------------------------------

/// A discrete hidden Markov model with bound observations.
pub struct Hmm {
    params: ParameterStore,
    config: HmmConfig,
    model: Option<Model>,
    observations: Option<SharedObservations>,
    cache: Arc<AlphaBetaCache>,
    origin: CacheOrigin,
    scratch: Workspace,
    dispatcher: Dispatcher,
    convergence: Convergence,
    stop: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Hmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hmm")
            .field("n_states", &self.params.n_states())
            .field("n_symbols", &self.params.n_symbols())
            .field(
                "sequences",
                &self.observations.as_ref().map(|o| o.num_sequences()),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl Hmm {
    /// Wrap an existing parameter store.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool for `config.parallelism` cannot be
    /// built.
    pub fn new(params: ParameterStore, config: HmmConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.parallelism)?;
        Ok(Self {
            params,
            convergence: Convergence::new(config.convergence),
            config,
            model: None,
            observations: None,
            cache: Arc::new(AlphaBetaCache::disabled()),
            origin: CacheOrigin::Owned,
            scratch: Workspace::default(),
            dispatcher,
            stop: None,
        })
    }

    /// Random row-stochastic model seeded from `config.seed`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::InvalidDimension`] if `n` or `m` is zero.
    pub fn random(n: usize, m: usize, config: HmmConfig) -> Result<Self> {
        let mut params = ParameterStore::new(n, m)?;
        params.init_random(config.seed);
        Self::new(params, config)
    }

    /// Model restricted to `model`'s definitions, randomly initialized within
    /// each learnable row group.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::InvalidDimension`] for zero dimensions and
    /// [`CyaneaError::MalformedDefinitions`] if `model` does not fit.
    pub fn from_definitions(n: usize, m: usize, model: Model, config: HmmConfig) -> Result<Self> {
        let model = model.finalize(n, m)?;
        let mut params = ParameterStore::new(n, m)?;
        params.init_defined(&model, config.seed)?;
        let mut hmm = Self::new(params, config)?;
        hmm.model = Some(model);
        Ok(hmm)
    }

    /// Attach learnable/constant definitions used by the `Defined` training modes.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::MalformedDefinitions`] if `model` does not fit.
    pub fn set_definitions(&mut self, model: Model) -> Result<()> {
        self.model = Some(model.finalize(self.params.n_states(), self.params.n_symbols())?);
        Ok(())
    }

    pub fn definitions(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn config(&self) -> &HmmConfig {
        &self.config
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// Mutable access to the parameters. Any change invalidates cached results.
    pub fn params_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    /// Replace the parameters wholesale.
    ///
    /// # Errors
    ///
    /// If observations are bound and use symbols the new alphabet lacks, the
    /// [`validate_observations`] error is returned and nothing changes.
    pub fn set_params(&mut self, params: ParameterStore) -> Result<()> {
        if let Some(obs) = &self.observations {
            validate_observations(&**obs, params.n_symbols())?;
        }
        if let Some(model) = &self.model {
            model.validate(params.n_states(), params.n_symbols())?;
        }
        self.params = params;
        Ok(())
    }

    pub fn into_params(self) -> ParameterStore {
        self.params
    }

    /// See [`ParameterStore::normalize`].
    pub fn normalize(&mut self, keep_dead_states: bool) {
        self.params.normalize(keep_dead_states);
    }

    /// See [`ParameterStore::convert_to_log`].
    ///
    /// # Errors
    ///
    /// [`CyaneaError::InvalidInput`] for negative or non-finite entries.
    pub fn convert_to_log(&mut self) -> Result<()> {
        self.params.convert_to_log()
    }

    // -----------------------------------------------------------------------
    // Observations and cache
    // -----------------------------------------------------------------------

    /// Bind an observation set and allocate the cache for it.
    ///
    /// The caller keeps its own handle; the engine never mutates the set.
    ///
    /// # Errors
    ///
    /// See [`validate_observations`].
    pub fn bind_observations(&mut self, observations: SharedObservations) -> Result<()> {
        validate_observations(&*observations, self.params.n_symbols())?;
        let cache = AlphaBetaCache::new(self.config.cache, observations.num_sequences());
        info!(
            sequences = observations.num_sequences(),
            max_length = observations.max_length(),
            slots = cache.slot_count(),
            "observations bound"
        );
        self.cache = Arc::new(cache);
        self.origin = CacheOrigin::Owned;
        self.observations = Some(observations);
        Ok(())
    }

    pub fn observations(&self) -> Option<&SharedObservations> {
        self.observations.as_ref()
    }

    /// Read-only view of the cache, or `None` while it still holds results
    /// for an earlier parameter revision.
    pub fn cache(&self) -> Option<&AlphaBetaCache> {
        self.cache_readable().then(|| &*self.cache)
    }

    /// Share `other`'s cached results.
    ///
    /// Both models must be bound to the same observation set and hold
    /// parameters with identical content. The shared cache is only read; the
    /// first write detaches into a private copy. If `other`'s cache is stale
    /// nothing is shared.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::NoObservations`] if either model has nothing bound.
    /// - [`CyaneaError::InvalidInput`] if the observation sets or parameter
    ///   contents differ.
    pub fn reuse_caches_from(&mut self, other: &Hmm) -> Result<()> {
        let (Some(mine), Some(theirs)) = (&self.observations, &other.observations) else {
            return Err(CyaneaError::NoObservations);
        };
        if Arc::as_ptr(mine) as *const () != Arc::as_ptr(theirs) as *const () {
            return Err(CyaneaError::InvalidInput(
                "cannot share caches across different observation sets".into(),
            ));
        }
        if self.params.content_hash() != other.params.content_hash() {
            return Err(CyaneaError::InvalidInput(
                "cannot share caches between models with different parameters".into(),
            ));
        }
        if !other.cache_readable() {
            debug!("source cache is stale, nothing to share");
            return Ok(());
        }
        self.cache = Arc::clone(&other.cache);
        self.origin = CacheOrigin::Borrowed {
            revision: self.params.revision(),
        };
        debug!(slots = self.cache.slot_count(), "sharing cache");
        Ok(())
    }

    /// Whether the cache holds values for the current parameters.
    fn cache_readable(&self) -> bool {
        let revision = self.params.revision();
        match self.origin {
            CacheOrigin::Owned => self.cache.revision() == Some(revision),
            CacheOrigin::Borrowed { revision: at } => at == revision,
        }
    }

    fn bound(&self) -> Result<SharedObservations> {
        self.observations
            .as_ref()
            .map(Arc::clone)
            .ok_or(CyaneaError::NoObservations)
    }

    fn check_state(&self, state: usize) -> Result<()> {
        let n = self.params.n_states();
        if state >= n {
            return Err(CyaneaError::IndexOutOfRange {
                tensor: "state",
                index: state,
                bound: n,
            });
        }
        Ok(())
    }

    /// Bound observations plus the length of sequence `dim`.
    fn sequence(&self, dim: usize) -> Result<(SharedObservations, usize)> {
        let obs = self.bound()?;
        let d = obs.num_sequences();
        if dim >= d {
            return Err(CyaneaError::IndexOutOfRange {
                tensor: "dimension",
                index: dim,
                bound: d,
            });
        }
        let len = obs.length_of(dim);
        Ok((obs, len))
    }

    /// The cache slot for `dim` holding at least `need`, filling it if
    /// necessary. `None` when caching is disabled.
    fn resident_slot(
        &mut self,
        obs: &dyn ObservationSet,
        dim: usize,
        need: Need,
    ) -> Option<&CacheSlot> {
        if !self.cache.is_enabled() {
            return None;
        }
        let hit = self.cache_readable()
            && self
                .cache
                .slot(dim)
                .map_or(false, |slot| need.satisfied_by(slot));
        if hit {
            return self.cache.slot(dim);
        }

        let cache = writable_cache(&mut self.cache, &mut self.origin, self.params.revision());
        let slot = cache.slot_mut(dim)?;
        if need.alpha && !slot.alpha_updated {
            slot.alpha_sum = forward_table(&self.params, obs, dim, &mut slot.alpha);
            slot.alpha_updated = true;
        }
        if need.beta && !slot.beta_updated {
            slot.beta_sum = backward_table(&self.params, obs, dim, &mut slot.beta);
            slot.beta_updated = true;
        }
        if need.path && !slot.path_updated {
            slot.path_log_prob =
                viterbi_path(&self.params, obs, dim, &mut self.scratch, &mut slot.path);
            slot.path_updated = true;
        }
        Some(&*slot)
    }

    // -----------------------------------------------------------------------
    // Forward / backward / Viterbi
    // -----------------------------------------------------------------------

    /// Forward variable `alpha_time(state)` of sequence `dim`.
    ///
    /// `time == 0` is answered in closed form. `TimeIndex::Total` or a time at
    /// or past the end of the sequence returns the sequence log-likelihood.
    /// With caching enabled the whole table is computed once and kept.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::NoObservations`] if nothing is bound.
    /// - [`CyaneaError::IndexOutOfRange`] for a bad `state` or `dim`.
    pub fn forward(&mut self, time: TimeIndex, state: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(state)?;
        let n = self.params.n_states();
        let t = match time {
            TimeIndex::At(t) if t < len => Some(t),
            _ => None,
        };
        if t == Some(0) {
            return Ok(self.params.p_at(state) + self.params.b_at(state, obs.symbol_at(dim, 0)));
        }
        if let Some(slot) = self.resident_slot(&*obs, dim, Need::ALPHA) {
            return Ok(match t {
                Some(t) => slot.alpha[t * n + state],
                None => slot.alpha_sum,
            });
        }
        Ok(match t {
            Some(t) => forward_row(&self.params, &*obs, dim, t, &mut self.scratch)[state],
            None => forward_likelihood(&self.params, &*obs, dim, &mut self.scratch),
        })
    }

    /// Backward variable `beta_time(state)` of sequence `dim`.
    ///
    /// `TimeIndex::Total` returns the sequence log-likelihood (running the
    /// forward pass when caching). The last position is answered in closed
    /// form as `q(state)`.
    ///
    /// # Errors
    ///
    /// As [`forward`](Self::forward), plus [`CyaneaError::IndexOutOfRange`]
    /// for `time >= T`.
    pub fn backward(&mut self, time: TimeIndex, state: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(state)?;
        let n = self.params.n_states();
        match time {
            TimeIndex::Total => {
                if let Some(slot) = self.resident_slot(&*obs, dim, Need::ALPHA) {
                    return Ok(slot.alpha_sum);
                }
                let beta0 = backward_row(&self.params, &*obs, dim, 0, &mut self.scratch);
                Ok(originate(&self.params, obs.symbol_at(dim, 0), beta0))
            }
            TimeIndex::At(t) if t >= len => Err(CyaneaError::IndexOutOfRange {
                tensor: "time",
                index: t,
                bound: len,
            }),
            TimeIndex::At(t) if t == len - 1 => Ok(self.params.q_at(state)),
            TimeIndex::At(t) => {
                if let Some(slot) = self.resident_slot(&*obs, dim, Need::BETA) {
                    return Ok(slot.beta[t * n + state]);
                }
                Ok(backward_row(&self.params, &*obs, dim, t, &mut self.scratch)[state])
            }
        }
    }

    /// Viterbi variable `delta_time(state)` of sequence `dim`.
    ///
    /// `time == 0` is answered in closed form; `TimeIndex::Total` or a time
    /// at or past the end returns the best-path log-probability.
    ///
    /// # Errors
    ///
    /// As [`forward`](Self::forward).
    pub fn viterbi(&mut self, time: TimeIndex, state: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(state)?;
        match time {
            TimeIndex::At(0) => {
                Ok(self.params.p_at(state) + self.params.b_at(state, obs.symbol_at(dim, 0)))
            }
            TimeIndex::At(t) if t < len => {
                Ok(viterbi_row(&self.params, &*obs, dim, t, &mut self.scratch)[state])
            }
            _ => self.best_path(dim).map(|(_, score)| score),
        }
    }

    /// Log-likelihood of sequence `dim`.
    ///
    /// # Errors
    ///
    /// As [`forward`](Self::forward).
    pub fn log_likelihood(&mut self, dim: usize) -> Result<f64> {
        self.forward(TimeIndex::Total, 0, dim)
    }

    /// Most probable state path of sequence `dim` and its log-probability.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::NoObservations`] or [`CyaneaError::IndexOutOfRange`].
    pub fn best_path(&mut self, dim: usize) -> Result<(Vec<usize>, f64)> {
        let (obs, _) = self.sequence(dim)?;
        if let Some(slot) = self.resident_slot(&*obs, dim, Need::PATH) {
            return Ok((slot.path.clone(), slot.path_log_prob));
        }
        let mut path = Vec::new();
        let score = viterbi_path(&self.params, &*obs, dim, &mut self.scratch, &mut path);
        Ok((path, score))
    }

    /// Mean log-likelihood over all bound sequences, evaluated in parallel
    /// and memoized until the parameters change.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::NoObservations`] if nothing is bound.
    pub fn mean_log_likelihood(&mut self) -> Result<f64> {
        let obs = self.bound()?;
        if self.cache_readable() {
            if let Some(v) = self.cache.mean_log_likelihood() {
                return Ok(v);
            }
        }
        let value = mean_log_likelihood(&self.dispatcher, &self.params, &*obs);
        writable_cache(&mut self.cache, &mut self.origin, self.params.revision())
            .set_mean_log_likelihood(value);
        Ok(value)
    }

    /// Mean best-path log-probability over all bound sequences, memoized until
    /// the parameters change.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::NoObservations`] if nothing is bound.
    pub fn mean_best_path_log_prob(&mut self) -> Result<f64> {
        let obs = self.bound()?;
        if self.cache_readable() {
            if let Some(v) = self.cache.mean_best_path() {
                return Ok(v);
            }
        }
        let value = mean_best_path(&self.dispatcher, &self.params, &*obs);
        writable_cache(&mut self.cache, &mut self.origin, self.params.revision())
            .set_mean_best_path(value);
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Posteriors and derivatives
    // -----------------------------------------------------------------------

    /// Run `f(alpha, beta, log_likelihood)` over the full tables of `dim`.
    fn with_tables<R>(
        &mut self,
        obs: &dyn ObservationSet,
        dim: usize,
        f: impl FnOnce(&[f64], &[f64], f64) -> R,
    ) -> R {
        if let Some(slot) = self.resident_slot(obs, dim, Need::TABLES) {
            return f(&slot.alpha, &slot.beta, slot.alpha_sum);
        }
        let ll = forward_table(&self.params, obs, dim, &mut self.scratch.alpha);
        backward_table(&self.params, obs, dim, &mut self.scratch.beta);
        f(&self.scratch.alpha, &self.scratch.beta, ll)
    }

    fn check_time(time: usize, bound: usize) -> Result<()> {
        if time >= bound {
            return Err(CyaneaError::IndexOutOfRange {
                tensor: "time",
                index: time,
                bound,
            });
        }
        Ok(())
    }

    /// Log posterior probability of being in `state` at `time`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad time, state or dimension.
    pub fn state_posterior(&mut self, time: usize, state: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(state)?;
        Self::check_time(time, len)?;
        let n = self.params.n_states();
        let i = time * n + state;
        Ok(self.with_tables(&*obs, dim, |alpha, beta, ll| alpha[i] + beta[i] - ll))
    }

    /// Log posterior probability of taking `from -> to` between `time` and
    /// `time + 1`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] unless `time + 1 < T` and both states
    /// are valid.
    pub fn transition_posterior(
        &mut self,
        time: usize,
        from: usize,
        to: usize,
        dim: usize,
    ) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(from)?;
        self.check_state(to)?;
        Self::check_time(time + 1, len)?;
        let n = self.params.n_states();
        let step = self.params.a_at(from, to) + self.params.b_at(to, obs.symbol_at(dim, time + 1));
        Ok(self.with_tables(&*obs, dim, |alpha, beta, ll| {
            alpha[time * n + from] + step + beta[(time + 1) * n + to] - ll
        }))
    }

    /// `ln dP(O|model) / dp(state)` for sequence `dim`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn model_derivative_p(&mut self, state: usize, dim: usize) -> Result<f64> {
        let (obs, _) = self.sequence(dim)?;
        self.check_state(state)?;
        let b = self.params.b_at(state, obs.symbol_at(dim, 0));
        self.backward(TimeIndex::At(0), state, dim).map(|beta0| beta0 + b)
    }

    /// `ln dP(O|model) / dq(state)` for sequence `dim`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn model_derivative_q(&mut self, state: usize, dim: usize) -> Result<f64> {
        let (_, len) = self.sequence(dim)?;
        self.forward(TimeIndex::At(len - 1), state, dim)
    }

    /// `ln dP(O|model) / da(from, to)` for sequence `dim`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn model_derivative_a(&mut self, from: usize, to: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(from)?;
        self.check_state(to)?;
        let n = self.params.n_states();
        let emit: Vec<f64> = (1..len)
            .map(|t| self.params.b_at(to, obs.symbol_at(dim, t)))
            .collect();
        Ok(self.with_tables(&*obs, dim, |alpha, beta, _| {
            emit.iter()
                .enumerate()
                .fold(f64::NEG_INFINITY, |acc, (t, &b)| {
                    cyanea_core::log_sum_exp(acc, alpha[t * n + from] + beta[(t + 1) * n + to] + b)
                })
        }))
    }

    /// `ln dP(O|model) / db(state, symbol)` for sequence `dim`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state, symbol or dimension.
    pub fn model_derivative_b(&mut self, state: usize, symbol: usize, dim: usize) -> Result<f64> {
        let (obs, len) = self.sequence(dim)?;
        self.check_state(state)?;
        let b = self.params.b(state, symbol)?;
        let n = self.params.n_states();
        let positions: Vec<usize> = (0..len).filter(|&t| obs.symbol_at(dim, t) == symbol).collect();
        Ok(self.with_tables(&*obs, dim, |alpha, beta, _| {
            positions.iter().fold(f64::NEG_INFINITY, |acc, &t| {
                cyanea_core::log_sum_exp(acc, alpha[t * n + state] + beta[t * n + state])
            }) - b
        }))
    }

    /// `d ln P(best path) / dp(state)`: `exp(-p(state))` if the best path of
    /// `dim` starts in `state`, else 0.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn path_derivative_p(&mut self, state: usize, dim: usize) -> Result<f64> {
        self.check_state(state)?;
        let (path, _) = self.best_path(dim)?;
        Ok(if path[0] == state {
            (-self.params.p_at(state)).exp()
        } else {
            0.0
        })
    }

    /// `d ln P(best path) / dq(state)`: `exp(-q(state))` if the best path of
    /// `dim` ends in `state`, else 0.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn path_derivative_q(&mut self, state: usize, dim: usize) -> Result<f64> {
        self.check_state(state)?;
        let (path, _) = self.best_path(dim)?;
        Ok(if path[path.len() - 1] == state {
            (-self.params.q_at(state)).exp()
        } else {
            0.0
        })
    }

    /// `d ln P(best path) / da(from, to)`: number of `from -> to` steps on the
    /// best path times `exp(-a(from, to))`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state or dimension.
    pub fn path_derivative_a(&mut self, from: usize, to: usize, dim: usize) -> Result<f64> {
        self.check_state(from)?;
        self.check_state(to)?;
        let (path, _) = self.best_path(dim)?;
        let count = path.windows(2).filter(|w| w[0] == from && w[1] == to).count();
        Ok(scaled_count(count, self.params.a_at(from, to)))
    }

    /// `d ln P(best path) / db(state, symbol)`: number of times the best path
    /// emits `symbol` from `state` times `exp(-b(state, symbol))`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] for a bad state, symbol or dimension.
    pub fn path_derivative_b(&mut self, state: usize, symbol: usize, dim: usize) -> Result<f64> {
        let b = self.params.b(state, symbol)?;
        let (obs, _) = self.sequence(dim)?;
        let (path, _) = self.best_path(dim)?;
        let count = path
            .iter()
            .enumerate()
            .filter(|&(t, &s)| s == state && obs.symbol_at(dim, t) == symbol)
            .count();
        Ok(scaled_count(count, b))
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    /// Replace the stopping rule, keeping the configured patience.
    pub fn set_convergence_criteria(&mut self, max_iterations: usize, epsilon: f64) {
        let criteria = ConvergenceCriteria {
            max_iterations,
            epsilon,
            ..self.config.convergence
        };
        self.config.convergence = criteria;
        self.convergence = Convergence::new(criteria);
    }

    /// Flag polled once per training iteration; setting it ends training
    /// after the in-flight iteration with the best model so far.
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop = Some(flag);
    }

    /// Train with Baum-Welch EM until convergence, the iteration cap or
    /// cancellation, then adopt the best-scoring parameters.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::NoObservations`] if nothing is bound.
    /// - [`CyaneaError::MalformedDefinitions`] for
    ///   [`BaumWelchMode::Defined`] without valid definitions.
    pub fn train_baum_welch(&mut self, mode: BaumWelchMode) -> Result<TrainingReport> {
        let obs = self.bound()?;
        let mut trainer = Trainer::new(&self.dispatcher, &*obs, self.config.pseudo);
        if let Some(flag) = &self.stop {
            trainer = trainer.with_stop_flag(flag);
        }
        let (params, report) =
            trainer.baum_welch(&self.params, mode, self.model.as_ref(), &mut self.convergence)?;
        self.params = params;
        Ok(report)
    }

    /// Train with Viterbi (hard-assignment) re-estimation.
    ///
    /// # Errors
    ///
    /// As [`train_baum_welch`](Self::train_baum_welch).
    pub fn train_viterbi(&mut self, mode: ViterbiMode) -> Result<TrainingReport> {
        let obs = self.bound()?;
        let mut trainer = Trainer::new(&self.dispatcher, &*obs, self.config.pseudo);
        if let Some(flag) = &self.stop {
            trainer = trainer.with_stop_flag(flag);
        }
        let (params, report) =
            trainer.viterbi(&self.params, mode, self.model.as_ref(), &mut self.convergence)?;
        self.params = params;
        Ok(report)
    }
}

/// Writable cache for parameters at `revision`, detaching a shared handle
/// into a private copy first.
fn writable_cache<'c>(
    cache: &'c mut Arc<AlphaBetaCache>,
    origin: &mut CacheOrigin,
    revision: u64,
) -> &'c mut AlphaBetaCache {
    let relabel = matches!(*origin, CacheOrigin::Borrowed { revision: at } if at == revision);
    if Arc::strong_count(cache) > 1 {
        debug!("detaching shared cache");
    }
    *origin = CacheOrigin::Owned;
    let cache = Arc::make_mut(cache);
    if relabel {
        cache.relabel(revision);
    }
    cache.sync(revision);
    cache
}

/// `count * exp(-log_value)`, zero when the count is zero.
fn scaled_count(count: usize, log_value: f64) -> f64 {
    if count == 0 {
        0.0
    } else {
        count as f64 * (-log_value).exp()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
