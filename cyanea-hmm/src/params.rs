//! The four log-space parameter tensors of a discrete HMM.
//!
//! A [`ParameterStore`] owns
//!
//! - `log_p[N]`: initial state log-probabilities,
//! - `log_q[N]`: end state log-probabilities,
//! - `log_a[N*N]`: row-major transitions, `a(i, j)` is `i -> j`,
//! - `log_b[N*M]`: row-major emissions, `b(i, k)` is symbol `k` in state `i`.
//!
//! Negative infinity encodes probability zero. Every mutation bumps the
//! store's [`revision`](ParameterStore::revision), which is how caches built
//! on top of it notice that they are stale. Revisions come from a process-wide
//! counter, so two stores only share a revision if one is an unmodified clone
//! of the other.
//!
//! The end probability `q(i)` shares the outgoing mass of state `i` with the
//! transition row `a(i, ..)`: after [`normalize`](ParameterStore::normalize),
//! `logsumexp(a(i, ..) ∪ {q(i)}) = 0` for every live row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use cyanea_core::hash::ContentHasher;
use cyanea_core::{
    log_sum_exp, log_sum_exp_slice, ContentAddressable, CyaneaError, LogProb, Result,
    Summarizable, ALMOST_NEG_INFINITY,
};
use tracing::{trace, warn};

use crate::graph::TransitionGraph;
use crate::model::Model;

/// Lower bound of the uniform draws used by random initialization.
const MIN_RAND: f64 = 23e-3;

/// Range of the random defaults given to states created by `add_states`.
const ADD_STATE_MIN: f64 = 1e-2;
const ADD_STATE_MAX: f64 = 2e-1;

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Xorshift64 PRNG
// ---------------------------------------------------------------------------

/// Minimal xorshift64 PRNG for reproducible initializations without external deps.
#[derive(Debug, Clone)]
pub(crate) struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in `[0, 1]`.
    pub(crate) fn next_f64(&mut self) -> f64 {
        self.next_u64() as f64 / u64::MAX as f64
    }

    /// Uniform in `[lo, hi)` (up to rounding at the top end).
    pub(crate) fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

// ---------------------------------------------------------------------------
// ParameterStore
// ---------------------------------------------------------------------------

/// Log-space initial, end, transition and emission tensors for `N` states and
/// `M` symbols.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    n: usize,
    m: usize,
    log_p: Vec<f64>,
    log_q: Vec<f64>,
    log_a: Vec<f64>,
    log_b: Vec<f64>,
    log_space: bool,
    revision: u64,
    graph: OnceLock<TransitionGraph>,
}

impl ParameterStore {
    /// A store with every entry at negative infinity.
    ///
    /// # Errors
    ///
    /// Returns [`CyaneaError::InvalidDimension`] if `n` or `m` is zero.
    pub fn new(n: usize, m: usize) -> Result<Self> {
        if n == 0 {
            return Err(CyaneaError::InvalidDimension { what: "N" });
        }
        if m == 0 {
            return Err(CyaneaError::InvalidDimension { what: "M" });
        }
        Ok(Self {
            n,
            m,
            log_p: vec![f64::NEG_INFINITY; n],
            log_q: vec![f64::NEG_INFINITY; n],
            log_a: vec![f64::NEG_INFINITY; n * n],
            log_b: vec![f64::NEG_INFINITY; n * m],
            log_space: true,
            revision: next_revision(),
            graph: OnceLock::new(),
        })
    }

    /// Build from probability-space tensors and convert them to log space.
    ///
    /// `a` and `b` are row-major. Values are not required to be normalized;
    /// call [`normalize`](Self::normalize) afterwards if they are not.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::InvalidDimension`] if `n` or `m` is zero.
    /// - [`CyaneaError::DimensionMismatch`] if a tensor has the wrong length.
    /// - [`CyaneaError::InvalidInput`] if any value is negative or not finite.
    pub fn from_probabilities(
        n: usize,
        m: usize,
        p: Vec<f64>,
        q: Vec<f64>,
        a: Vec<f64>,
        b: Vec<f64>,
    ) -> Result<Self> {
        let mut store = Self::with_tensors(n, m, p, q, a, b)?;
        store.log_space = false;
        store.convert_to_log()?;
        Ok(store)
    }

    /// Build from tensors that are already natural-log probabilities.
    ///
    /// # Errors
    ///
    /// Same shape checks as [`from_probabilities`](Self::from_probabilities).
    pub fn from_log_probabilities(
        n: usize,
        m: usize,
        log_p: Vec<f64>,
        log_q: Vec<f64>,
        log_a: Vec<f64>,
        log_b: Vec<f64>,
    ) -> Result<Self> {
        Self::with_tensors(n, m, log_p, log_q, log_a, log_b)
    }

    fn with_tensors(
        n: usize,
        m: usize,
        p: Vec<f64>,
        q: Vec<f64>,
        a: Vec<f64>,
        b: Vec<f64>,
    ) -> Result<Self> {
        let mut store = Self::new(n, m)?;
        check_len("p", n, p.len())?;
        check_len("q", n, q.len())?;
        check_len("a", n * n, a.len())?;
        check_len("b", n * m, b.len())?;
        store.log_p = p;
        store.log_q = q;
        store.log_a = a;
        store.log_b = b;
        Ok(store)
    }

    /// Number of hidden states `N`.
    pub fn n_states(&self) -> usize {
        self.n
    }

    /// Number of observable symbols `M`.
    pub fn n_symbols(&self) -> usize {
        self.m
    }

    /// Whether the tensors hold log-probabilities.
    pub fn is_log_space(&self) -> bool {
        self.log_space
    }

    /// Monotone change counter. Any mutation yields a new value.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // -----------------------------------------------------------------------
    // Checked accessors
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N`.
    pub fn p(&self, i: usize) -> Result<f64> {
        check_index("p", i, self.n)?;
        Ok(self.log_p[i])
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N`.
    pub fn q(&self, i: usize) -> Result<f64> {
        check_index("q", i, self.n)?;
        Ok(self.log_q[i])
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N` or `j >= N`.
    pub fn a(&self, i: usize, j: usize) -> Result<f64> {
        check_index("a", i, self.n)?;
        check_index("a", j, self.n)?;
        Ok(self.log_a[i * self.n + j])
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N` or `k >= M`.
    pub fn b(&self, i: usize, k: usize) -> Result<f64> {
        check_index("b", i, self.n)?;
        check_index("b", k, self.m)?;
        Ok(self.log_b[i * self.m + k])
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N`.
    pub fn set_p(&mut self, i: usize, value: f64) -> Result<()> {
        check_index("p", i, self.n)?;
        self.p_mut()[i] = value;
        Ok(())
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N`.
    pub fn set_q(&mut self, i: usize, value: f64) -> Result<()> {
        check_index("q", i, self.n)?;
        self.q_mut()[i] = value;
        Ok(())
    }

    /// Setting a transition drops the cached [`TransitionGraph`].
    ///
    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N` or `j >= N`.
    pub fn set_a(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        check_index("a", i, self.n)?;
        check_index("a", j, self.n)?;
        let n = self.n;
        self.a_mut()[i * n + j] = value;
        Ok(())
    }

    /// # Errors
    ///
    /// [`CyaneaError::IndexOutOfRange`] if `i >= N` or `k >= M`.
    pub fn set_b(&mut self, i: usize, k: usize, value: f64) -> Result<()> {
        check_index("b", i, self.n)?;
        check_index("b", k, self.m)?;
        let m = self.m;
        self.b_mut()[i * m + k] = value;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Slice views and kernel accessors
    // -----------------------------------------------------------------------

    pub fn log_p(&self) -> &[f64] {
        &self.log_p
    }

    pub fn log_q(&self) -> &[f64] {
        &self.log_q
    }

    /// Row-major `N x N`.
    pub fn log_a(&self) -> &[f64] {
        &self.log_a
    }

    /// Row-major `N x M`.
    pub fn log_b(&self) -> &[f64] {
        &self.log_b
    }

    #[inline]
    pub(crate) fn p_at(&self, i: usize) -> f64 {
        self.log_p[i]
    }

    #[inline]
    pub(crate) fn q_at(&self, i: usize) -> f64 {
        self.log_q[i]
    }

    #[inline]
    pub(crate) fn a_at(&self, i: usize, j: usize) -> f64 {
        self.log_a[i * self.n + j]
    }

    #[inline]
    pub(crate) fn b_at(&self, i: usize, k: usize) -> f64 {
        self.log_b[i * self.m + k]
    }

    pub(crate) fn p_mut(&mut self) -> &mut [f64] {
        self.revision = next_revision();
        &mut self.log_p
    }

    pub(crate) fn q_mut(&mut self) -> &mut [f64] {
        self.revision = next_revision();
        &mut self.log_q
    }

    pub(crate) fn a_mut(&mut self) -> &mut [f64] {
        self.revision = next_revision();
        self.graph = OnceLock::new();
        &mut self.log_a
    }

    pub(crate) fn b_mut(&mut self) -> &mut [f64] {
        self.revision = next_revision();
        &mut self.log_b
    }

    /// Sparse adjacency over the current transitions, built on first use.
    pub fn graph(&self) -> &TransitionGraph {
        self.graph
            .get_or_init(|| TransitionGraph::from_log_transitions(self.n, &self.log_a))
    }

    /// Rebuild the transition graph and bump the revision.
    ///
    /// Only needed after changing the tensors through a path that bypasses
    /// the setters; the setters already invalidate.
    pub fn invalidate(&mut self) {
        self.revision = next_revision();
        self.graph = OnceLock::new();
        self.graph();
    }

    // -----------------------------------------------------------------------
    // Normalization and conversion
    // -----------------------------------------------------------------------

    /// Log-sum-exp normalize `p`, every `a(i, ..) ∪ {q(i)}` row and every
    /// emission row.
    ///
    /// With `keep_dead_states`, a state whose outgoing mass is at or below
    /// `ALMOST_NEG_INFINITY / N` keeps its transitions untouched. Rows with no
    /// mass at all (`-inf`) are always left as they are.
    pub fn normalize(&mut self, keep_dead_states: bool) {
        let n = self.n;
        let m = self.m;
        let dead_threshold = ALMOST_NEG_INFINITY / n as f64;

        let sum_p = log_sum_exp_slice(&self.log_p);
        if sum_p > f64::NEG_INFINITY {
            self.log_p.iter_mut().for_each(|v| *v -= sum_p);
        }

        for i in 0..n {
            let row = &mut self.log_a[i * n..(i + 1) * n];
            let sum_a = log_sum_exp(self.log_q[i], log_sum_exp_slice(row));
            if keep_dead_states && sum_a <= dead_threshold {
                trace!(state = i, mass = sum_a, "keeping dead state");
            } else if sum_a > f64::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v -= sum_a);
                self.log_q[i] -= sum_a;
            }

            let row = &mut self.log_b[i * m..(i + 1) * m];
            let sum_b = log_sum_exp_slice(row);
            if sum_b > f64::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v -= sum_b);
            }
        }

        self.revision = next_revision();
        self.graph = OnceLock::new();
    }

    /// One-time probability to log-probability transform; exact zeros become
    /// negative infinity.
    ///
    /// Calling it on a store that is already in log space logs a warning and
    /// changes nothing.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::InvalidInput`] if any entry is negative or not finite.
    /// The store is left unchanged in that case.
    pub fn convert_to_log(&mut self) -> Result<()> {
        if self.log_space {
            warn!("parameters are already in log space, conversion skipped");
            return Ok(());
        }
        let log_p = to_log(&self.log_p)?;
        let log_q = to_log(&self.log_q)?;
        let log_a = to_log(&self.log_a)?;
        let log_b = to_log(&self.log_b)?;
        self.log_p = log_p;
        self.log_q = log_q;
        self.log_a = log_a;
        self.log_b = log_b;
        self.log_space = true;
        self.revision = next_revision();
        self.graph = OnceLock::new();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Replace every tensor with random row-stochastic values.
    ///
    /// Each entry is drawn from `[0.023, 1.023)` and rows are normalized, so
    /// no transition or emission is structurally zero.
    pub fn init_random(&mut self, seed: u64) {
        let mut rng = Xorshift64::new(seed);
        let n = self.n;
        let m = self.m;

        let mut draw_row = |len: usize| -> Vec<f64> {
            let row: Vec<f64> = (0..len).map(|_| MIN_RAND + rng.next_f64()).collect();
            let sum: f64 = row.iter().sum();
            row.into_iter().map(|v| (v / sum).ln()).collect()
        };

        let mut log_a = Vec::with_capacity(n * n);
        let mut log_b = Vec::with_capacity(n * m);
        for _ in 0..n {
            log_a.extend(draw_row(n));
        }
        for _ in 0..n {
            log_b.extend(draw_row(m));
        }
        self.log_p = draw_row(n);
        self.log_q = draw_row(n);
        self.log_a = log_a;
        self.log_b = log_b;
        self.log_space = true;
        self.normalize(false);
    }

    /// Random initialization restricted to the cells a [`Model`] declares.
    ///
    /// Every cell starts at probability zero. Each learnable row group of `a`
    /// and `b` receives random values normalized within the group, constants
    /// are placed verbatim and learnable `p`/`q` entries are randomized and
    /// normalized among themselves.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::MalformedDefinitions`] if `model` does not fit this
    /// store's dimensions.
    pub fn init_defined(&mut self, model: &Model, seed: u64) -> Result<()> {
        model.validate(self.n, self.m)?;
        let mut rng = Xorshift64::new(seed);
        let n = self.n;
        let m = self.m;

        let mut p = vec![0.0; n];
        let mut q = vec![0.0; n];
        let mut a = vec![0.0; n * n];
        let mut b = vec![0.0; n * m];

        for (_, cells) in model.learn_a_rows() {
            let draws: Vec<f64> = cells.iter().map(|_| rng.range(MIN_RAND, 1.0)).collect();
            let sum: f64 = draws.iter().sum();
            for (&(i, j), v) in cells.iter().zip(draws) {
                a[i * n + j] = v / sum;
            }
        }
        for (_, cells) in model.learn_b_rows() {
            let draws: Vec<f64> = cells.iter().map(|_| rng.range(MIN_RAND, 1.0)).collect();
            let sum: f64 = draws.iter().sum();
            for (&(i, k), v) in cells.iter().zip(draws) {
                b[i * m + k] = v / sum;
            }
        }

        for &(i, j, v) in model.const_a_cells() {
            a[i * n + j] = v;
        }
        for &(i, k, v) in model.const_b_cells() {
            b[i * m + k] = v;
        }
        for &(i, v) in model.const_p_states() {
            p[i] = v;
        }
        for &(i, v) in model.const_q_states() {
            q[i] = v;
        }

        randomize_subset(&mut p, model.learn_p_states(), &mut rng);
        randomize_subset(&mut q, model.learn_q_states(), &mut rng);

        self.log_p = p;
        self.log_q = q;
        self.log_a = a;
        self.log_b = b;
        self.log_space = false;
        self.convert_to_log()
    }

    /// Set every entry to `ln(pseudo)`.
    pub fn clear(&mut self, pseudo: f64) {
        let v = pseudo.ln();
        self.p_mut().fill(v);
        self.q_mut().fill(v);
        self.a_mut().fill(v);
        self.b_mut().fill(v);
    }

    /// Set only the learnable entries of `model` to `ln(pseudo)`.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::MalformedDefinitions`] if `model` does not fit.
    pub fn clear_defined(&mut self, model: &Model, pseudo: f64) -> Result<()> {
        model.validate(self.n, self.m)?;
        let v = pseudo.ln();
        let n = self.n;
        let m = self.m;
        {
            let a = self.a_mut();
            for &(i, j) in model.learn_a_cells() {
                a[i * n + j] = v;
            }
        }
        {
            let b = self.b_mut();
            for &(i, k) in model.learn_b_cells() {
                b[i * m + k] = v;
            }
        }
        {
            let p = self.p_mut();
            for &i in model.learn_p_states() {
                p[i] = v;
            }
        }
        let q = self.q_mut();
        for &i in model.learn_q_states() {
            q[i] = v;
        }
        Ok(())
    }

    /// Copy `estimate`, replacing every significant entry with `ln(pseudo)`.
    ///
    /// This is the starting point of a Baum-Welch accumulation. With
    /// `emissions == false` the emission tensor is copied verbatim.
    pub(crate) fn reset_from(&mut self, estimate: &ParameterStore, pseudo: f64, emissions: bool) {
        let floor = pseudo.ln();
        let seed = |dst: &mut [f64], src: &[f64]| {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = if s > ALMOST_NEG_INFINITY { floor } else { s };
            }
        };
        seed(self.p_mut(), &estimate.log_p);
        seed(self.q_mut(), &estimate.log_q);
        seed(self.a_mut(), &estimate.log_a);
        if emissions {
            seed(self.b_mut(), &estimate.log_b);
        } else {
            self.b_mut().copy_from_slice(&estimate.log_b);
        }
        self.log_space = true;
    }

    // -----------------------------------------------------------------------
    // Structural edits
    // -----------------------------------------------------------------------

    /// Set every entry whose probability is below `threshold` to
    /// `ALMOST_NEG_INFINITY`, then renormalize.
    pub fn chop(&mut self, threshold: f64) {
        let floor = threshold.ln();
        let chop_slice = |xs: &mut [f64]| {
            for v in xs.iter_mut() {
                if *v < floor {
                    *v = ALMOST_NEG_INFINITY;
                }
            }
        };
        chop_slice(self.p_mut());
        chop_slice(self.q_mut());
        chop_slice(self.a_mut());
        chop_slice(self.b_mut());
        self.normalize(false);
    }

    /// Grow the model by `k` states.
    ///
    /// Existing entries are preserved. Every new entry (transitions to and
    /// from the new states, their `p`, `q` and emissions) is `ln(default)`, or
    /// a random probability in `[0.01, 0.2)` when `default == 0`. The result
    /// is normalized.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::InvalidInput`] if `default` is negative or not finite.
    pub fn add_states(&mut self, k: usize, default: f64, seed: u64) -> Result<()> {
        if !default.is_finite() || default < 0.0 {
            return Err(CyaneaError::InvalidInput(format!(
                "add_states: default value must be finite and >= 0, got {default}"
            )));
        }
        if k == 0 {
            return Ok(());
        }
        let mut rng = Xorshift64::new(seed);
        let mut fresh = || -> f64 {
            if default == 0.0 {
                rng.range(ADD_STATE_MIN, ADD_STATE_MAX).ln()
            } else {
                default.ln()
            }
        };

        let n = self.n;
        let m = self.m;
        let new_n = n + k;

        let mut log_a = vec![0.0; new_n * new_n];
        for i in 0..new_n {
            for j in 0..new_n {
                log_a[i * new_n + j] = if i < n && j < n {
                    self.log_a[i * n + j]
                } else {
                    fresh()
                };
            }
        }
        let mut log_b = self.log_b.clone();
        log_b.extend((0..k * m).map(|_| fresh()));
        let mut log_p = self.log_p.clone();
        log_p.extend((0..k).map(|_| fresh()));
        let mut log_q = self.log_q.clone();
        log_q.extend((0..k).map(|_| fresh()));

        self.n = new_n;
        self.log_p = log_p;
        self.log_q = log_q;
        self.log_a = log_a;
        self.log_b = log_b;
        self.normalize(false);
        Ok(())
    }

    /// Concatenate `other` after this model.
    ///
    /// The appended states are entered only from this model's end states:
    /// `a(i, N + j) = q(i) + p'(j)`. Initial mass of the appended states and
    /// end mass of the current ones become negative infinity. The result is
    /// not renormalized.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::DimensionMismatch`] if the symbol alphabets differ.
    pub fn append(&mut self, other: &ParameterStore) -> Result<()> {
        if other.m != self.m {
            return Err(CyaneaError::DimensionMismatch {
                tensor: "b",
                expected: self.m,
                actual: other.m,
            });
        }
        let n = self.n;
        let o = other.n;
        let new_n = n + o;

        let mut log_a = vec![f64::NEG_INFINITY; new_n * new_n];
        for i in 0..n {
            log_a[i * new_n..i * new_n + n].copy_from_slice(&self.log_a[i * n..(i + 1) * n]);
            for j in 0..o {
                log_a[i * new_n + n + j] = self.log_q[i] + other.log_p[j];
            }
        }
        for i in 0..o {
            let row = (n + i) * new_n + n;
            log_a[row..row + o].copy_from_slice(&other.log_a[i * o..(i + 1) * o]);
        }

        let mut log_p = self.log_p.clone();
        log_p.extend(std::iter::repeat(f64::NEG_INFINITY).take(o));
        let mut log_q = vec![f64::NEG_INFINITY; n];
        log_q.extend_from_slice(&other.log_q);
        let mut log_b = self.log_b.clone();
        log_b.extend_from_slice(&other.log_b);

        self.n = new_n;
        self.log_p = log_p;
        self.log_q = log_q;
        self.log_a = log_a;
        self.log_b = log_b;
        self.revision = next_revision();
        self.graph = OnceLock::new();
        Ok(())
    }
}

impl ContentAddressable for ParameterStore {
    fn content_hash(&self) -> String {
        let mut hasher = ContentHasher::new();
        hasher
            .update_usize(self.n)
            .update_usize(self.m)
            .update_usize(self.log_space as usize)
            .update_f64s(&self.log_p)
            .update_f64s(&self.log_q)
            .update_f64s(&self.log_a)
            .update_f64s(&self.log_b);
        hasher.finish()
    }
}

impl Summarizable for ParameterStore {
    fn summary(&self) -> String {
        format!(
            "HMM parameters: {} states, {} symbols, {} transitions ({})",
            self.n,
            self.m,
            self.graph().edge_count(),
            if self.log_space { "log space" } else { "probability space" }
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_index(tensor: &'static str, index: usize, bound: usize) -> Result<()> {
    if index >= bound {
        return Err(CyaneaError::IndexOutOfRange {
            tensor,
            index,
            bound,
        });
    }
    Ok(())
}

fn check_len(tensor: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CyaneaError::DimensionMismatch {
            tensor,
            expected,
            actual,
        });
    }
    Ok(())
}

fn to_log(values: &[f64]) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|&v| LogProb::from_weight(v).map(|lp| lp.0))
        .collect()
}

/// Random probabilities over `indices` only, normalized among themselves.
fn randomize_subset(values: &mut [f64], indices: &[usize], rng: &mut Xorshift64) {
    if indices.is_empty() {
        return;
    }
    let draws: Vec<f64> = indices.iter().map(|_| rng.range(MIN_RAND, 1.0)).collect();
    let sum: f64 = draws.iter().sum();
    for (&i, v) in indices.iter().zip(draws) {
        values[i] = v / sum;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    fn two_state() -> ParameterStore {
        ParameterStore::from_probabilities(
            2,
            2,
            vec![0.5, 0.5],
            vec![0.0, 1.0],
            vec![0.5, 0.5, 0.0, 1.0],
            vec![0.9, 0.1, 0.1, 0.9],
        )
        .unwrap()
    }

    fn assert_normalized(s: &ParameterStore) {
        let n = s.n_states();
        let m = s.n_symbols();
        assert!(log_sum_exp_slice(s.log_p()).abs() < TOL);
        for i in 0..n {
            let row = &s.log_a()[i * n..(i + 1) * n];
            let mass = log_sum_exp(s.log_q()[i], log_sum_exp_slice(row));
            assert!(mass.abs() < TOL, "row {i} mass {mass}");
            let row = &s.log_b()[i * m..(i + 1) * m];
            assert!(log_sum_exp_slice(row).abs() < TOL);
        }
    }

    #[test]
    fn new_rejects_zero_dimensions() {
        assert!(matches!(
            ParameterStore::new(0, 2),
            Err(CyaneaError::InvalidDimension { what: "N" })
        ));
        assert!(matches!(
            ParameterStore::new(2, 0),
            Err(CyaneaError::InvalidDimension { what: "M" })
        ));
        let s = ParameterStore::new(3, 4).unwrap();
        assert!(s.log_a().iter().all(|&v| v == f64::NEG_INFINITY));
        assert_eq!(s.graph().edge_count(), 0);
    }

    #[test]
    fn from_probabilities_converts_zeros() {
        let s = two_state();
        assert!(s.is_log_space());
        assert_eq!(s.q(0).unwrap(), f64::NEG_INFINITY);
        assert!((s.b(0, 0).unwrap() - 0.9_f64.ln()).abs() < TOL);
        assert_eq!(s.a(1, 0).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn from_probabilities_shape_mismatch() {
        let err = ParameterStore::from_probabilities(
            2,
            2,
            vec![0.5, 0.5],
            vec![0.5, 0.5],
            vec![0.5; 3],
            vec![0.5; 4],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CyaneaError::DimensionMismatch {
                tensor: "a",
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn from_probabilities_rejects_negative() {
        let err = ParameterStore::from_probabilities(
            1,
            1,
            vec![-0.5],
            vec![1.0],
            vec![0.0],
            vec![1.0],
        )
        .unwrap_err();
        assert!(matches!(err, CyaneaError::InvalidInput(_)));
    }

    #[test]
    fn accessors_report_out_of_range() {
        let mut s = two_state();
        assert!(matches!(
            s.a(0, 2),
            Err(CyaneaError::IndexOutOfRange {
                tensor: "a",
                index: 2,
                bound: 2
            })
        ));
        assert!(s.b(2, 0).is_err());
        assert!(s.p(5).is_err());
        assert!(s.set_q(2, 0.0).is_err());
        assert!(s.set_b(0, 2, 0.0).is_err());
    }

    #[test]
    fn setters_bump_revision_and_rebuild_graph() {
        let mut s = two_state();
        assert_eq!(s.graph().predecessors(0), &[0]);
        let r0 = s.revision();
        s.set_a(1, 0, -2.0).unwrap();
        assert!(s.revision() > r0);
        assert_eq!(s.graph().predecessors(0), &[0, 1]);

        let r1 = s.revision();
        s.set_b(0, 1, -3.0).unwrap();
        assert!(s.revision() > r1);
    }

    #[test]
    fn clone_keeps_revision() {
        let s = two_state();
        let c = s.clone();
        assert_eq!(s.revision(), c.revision());
        assert_eq!(s.content_hash(), c.content_hash());
    }

    #[test]
    fn normalize_establishes_row_invariants() {
        let mut s = ParameterStore::from_probabilities(
            2,
            3,
            vec![2.0, 6.0],
            vec![1.0, 0.0],
            vec![1.0, 2.0, 3.0, 1.0],
            vec![1.0, 1.0, 2.0, 0.0, 5.0, 5.0],
        )
        .unwrap();
        s.normalize(false);
        assert_normalized(&s);
        assert!((s.p(1).unwrap() - 0.75_f64.ln()).abs() < TOL);
        // q(0) shares mass with a(0, ..): 1 / (1 + 1 + 2)
        assert!((s.q(0).unwrap() - 0.25_f64.ln()).abs() < TOL);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut s = ParameterStore::new(3, 2).unwrap();
        s.init_random(7);
        s.normalize(false);
        let once = s.clone();
        s.normalize(false);
        for (x, y) in once.log_a().iter().zip(s.log_a()) {
            assert!((x - y).abs() < TOL);
        }
        for (x, y) in once.log_q().iter().zip(s.log_q()) {
            assert!((x - y).abs() < TOL);
        }
    }

    #[test]
    fn normalize_leaves_empty_rows_alone() {
        let mut s = ParameterStore::new(2, 2).unwrap();
        s.set_p(0, 0.0).unwrap();
        s.set_a(0, 0, -1.0).unwrap();
        s.set_b(0, 0, -1.0).unwrap();
        s.normalize(false);
        assert!(s.log_a()[2..].iter().all(|&v| v == f64::NEG_INFINITY));
        assert!(s.log_b()[2..].iter().all(|&v| v == f64::NEG_INFINITY));
        assert!(s.log_a().iter().all(|v| !v.is_nan()));
        assert!(s.a(0, 0).unwrap().abs() < TOL);
    }

    #[test]
    fn normalize_keeps_dead_states_on_request() {
        let mut s = ParameterStore::new(2, 1).unwrap();
        s.set_p(0, 0.0).unwrap();
        s.set_a(0, 0, -0.5).unwrap();
        s.set_a(1, 1, -600.0).unwrap();
        s.set_b(0, 0, 0.0).unwrap();
        s.set_b(1, 0, 0.0).unwrap();

        let mut kept = s.clone();
        kept.normalize(true);
        assert_eq!(kept.a(1, 1).unwrap(), -600.0);
        assert!(kept.a(0, 0).unwrap().abs() < TOL);

        s.normalize(false);
        assert!(s.a(1, 1).unwrap().abs() < TOL);
    }

    #[test]
    fn convert_to_log_twice_is_noop() {
        let mut s = two_state();
        let before = s.content_hash();
        s.convert_to_log().unwrap();
        assert_eq!(s.content_hash(), before);
    }

    #[test]
    fn init_random_is_reproducible_and_normalized() {
        let mut a = ParameterStore::new(4, 3).unwrap();
        let mut b = ParameterStore::new(4, 3).unwrap();
        a.init_random(99);
        b.init_random(99);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_normalized(&a);
        assert_eq!(a.graph().edge_count(), 16);

        b.init_random(100);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn init_defined_only_fills_declared_cells() {
        let model = Model::new()
            .learn_a(0, 0)
            .learn_a(0, 1)
            .const_a(1, 1, 1.0)
            .learn_b(0, 0)
            .learn_b(0, 1)
            .const_b(1, 1, 1.0)
            .learn_p(0)
            .learn_p(1)
            .const_q(1, 0.5)
            .finalize(2, 2)
            .unwrap();
        let mut s = ParameterStore::new(2, 2).unwrap();
        s.init_defined(&model, 3).unwrap();

        assert_eq!(s.a(1, 0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(s.a(1, 1).unwrap(), 0.0);
        assert_eq!(s.b(1, 0).unwrap(), f64::NEG_INFINITY);
        assert!((s.q(1).unwrap() - 0.5_f64.ln()).abs() < TOL);
        assert_eq!(s.q(0).unwrap(), f64::NEG_INFINITY);
        let row0 = log_sum_exp(s.a(0, 0).unwrap(), s.a(0, 1).unwrap());
        assert!(row0.abs() < TOL);
        assert!(log_sum_exp_slice(s.log_p()).abs() < TOL);
    }

    #[test]
    fn clear_variants() {
        let mut s = two_state();
        s.clear(1e-3);
        assert!(s.log_a().iter().all(|&v| (v - 1e-3_f64.ln()).abs() < TOL));

        let mut s = two_state();
        let model = Model::new().learn_a(0, 1).finalize(2, 2).unwrap();
        s.clear_defined(&model, 0.5).unwrap();
        assert!((s.a(0, 1).unwrap() - 0.5_f64.ln()).abs() < TOL);
        assert!((s.a(0, 0).unwrap() - 0.5_f64.ln()).abs() < TOL);
        assert_eq!(s.a(1, 0).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn reset_from_keeps_structural_zeros() {
        let estimate = two_state();
        let mut work = estimate.clone();
        work.reset_from(&estimate, 1e-3, false);
        let floor = 1e-3_f64.ln();
        assert_eq!(work.a(1, 0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(work.q(0).unwrap(), f64::NEG_INFINITY);
        assert!((work.a(0, 1).unwrap() - floor).abs() < TOL);
        assert_eq!(work.log_b(), estimate.log_b());
    }

    #[test]
    fn chop_removes_small_entries() {
        let mut s = ParameterStore::from_probabilities(
            1,
            3,
            vec![1.0],
            vec![1.0],
            vec![0.0],
            vec![0.495, 0.01, 0.495],
        )
        .unwrap();
        s.chop(0.05);
        assert!(s.b(0, 1).unwrap() < ALMOST_NEG_INFINITY + 1.0);
        assert!((s.b(0, 0).unwrap() - 0.5_f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn add_states_grows_and_normalizes() {
        let mut s = two_state();
        s.add_states(2, 0.0, 5).unwrap();
        assert_eq!(s.n_states(), 4);
        assert_eq!(s.log_a().len(), 16);
        assert_eq!(s.log_b().len(), 8);
        assert_normalized(&s);
        // the structural zero survives
        assert_eq!(s.a(1, 0).unwrap(), f64::NEG_INFINITY);
        assert!(s.add_states(1, -1.0, 5).is_err());
    }

    #[test]
    fn append_wires_end_to_start() {
        let mut s = two_state();
        let other = ParameterStore::from_probabilities(
            1,
            2,
            vec![1.0],
            vec![1.0],
            vec![0.0],
            vec![0.5, 0.5],
        )
        .unwrap();
        s.append(&other).unwrap();
        assert_eq!(s.n_states(), 3);
        // q(1) = 0, p'(0) = 0
        assert!(s.a(1, 2).unwrap().abs() < TOL);
        assert_eq!(s.a(0, 2).unwrap(), f64::NEG_INFINITY);
        assert_eq!(s.p(2).unwrap(), f64::NEG_INFINITY);
        assert_eq!(s.q(1).unwrap(), f64::NEG_INFINITY);
        assert!(s.q(2).unwrap().abs() < TOL);
        assert_eq!(s.graph().predecessors(2), &[1]);

        let wide = ParameterStore::new(1, 3).unwrap();
        assert!(matches!(
            s.append(&wide),
            Err(CyaneaError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn summary_mentions_dimensions() {
        let s = two_state();
        let text = s.summary();
        assert!(text.contains("2 states"));
        assert!(text.contains("3 transitions"));
    }
}
