//! Parameter re-estimation: Baum-Welch EM and Viterbi training.
//!
//! Training alternates two parameter stores. The *estimate* is frozen while
//! every sequence is evaluated against it (in parallel, see
//! [`Dispatcher`]); the expected or counted sufficient statistics are merged
//! into a fresh *working* store, which becomes the next estimate. The score
//! driving convergence is the mean per-sequence forward log-likelihood of the
//! estimate under evaluation.
//!
//! Two flavours of each algorithm exist:
//!
//! - **Full** re-estimates every parameter with non-negligible mass (and, for
//!   Baum-Welch, optionally leaves emissions alone).
//! - **Defined** re-estimates only the cells a [`Model`] lists as learnable;
//!   every other cell is carried over untouched.

use std::sync::atomic::{AtomicBool, Ordering};

use cyanea_core::{log_sum_exp, CyaneaError, ObservationSet, Result};
use tracing::{debug, info, warn};

use crate::config::ConvergenceCriteria;
use crate::inference::{backward_table, forward_likelihood, forward_table, viterbi_path, Workspace};
use crate::model::Model;
use crate::observations::validate_observations;
use crate::parallel::{mean_log_likelihood, Dispatcher};
use crate::params::ParameterStore;

// ---------------------------------------------------------------------------
// Modes and outcome
// ---------------------------------------------------------------------------

/// Which parameters Baum-Welch re-estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BaumWelchMode {
    /// `p`, `q`, `a` and `b`.
    Full,
    /// `p`, `q` and `a`; emissions are copied verbatim.
    TransitionsOnly,
    /// Only the learnable cells of the bound [`Model`].
    Defined,
}

/// Which parameters Viterbi training re-estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViterbiMode {
    Full,
    Defined,
}

/// Lifecycle of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Iterating,
    /// The convergence criterion was met.
    Converged,
    /// The iteration cap was reached or the run was cancelled.
    Stopped,
}

/// Summary of a finished training run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrainingReport {
    /// Re-estimation steps performed.
    pub iterations: usize,
    /// Mean log-likelihood of the returned parameters.
    pub log_likelihood: f64,
    /// Whether the convergence criterion (rather than the cap) ended the run.
    pub converged: bool,
    /// Whether the stop flag ended the run.
    pub cancelled: bool,
    /// Score of the estimate evaluated in each iteration.
    pub history: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

/// Outcome of one [`Convergence::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Continue,
    Converged,
    IterationCapReached,
}

/// Stateful convergence detector.
///
/// Each check consumes one unit of the iteration budget. Convergence requires
/// the absolute score change to stay below `epsilon` for more than `patience`
/// consecutive checks. Both terminal outcomes reset the detector so it can be
/// reused for the next run.
#[derive(Debug, Clone)]
pub struct Convergence {
    criteria: ConvergenceCriteria,
    remaining: usize,
    patience_left: usize,
}

impl Convergence {
    pub fn new(criteria: ConvergenceCriteria) -> Self {
        Self {
            criteria,
            remaining: criteria.max_iterations,
            patience_left: criteria.patience,
        }
    }

    pub fn criteria(&self) -> ConvergenceCriteria {
        self.criteria
    }

    /// Restore the full iteration budget and patience.
    pub fn reset(&mut self) {
        self.remaining = self.criteria.max_iterations;
        self.patience_left = self.criteria.patience;
    }

    /// Compare consecutive scores.
    pub fn check(&mut self, prev: f64, curr: f64) -> ConvergenceStatus {
        let stable = (curr - prev).abs() < self.criteria.epsilon;
        if self.remaining == 0 {
            self.reset();
            return ConvergenceStatus::IterationCapReached;
        }
        if stable && self.patience_left == 0 {
            self.reset();
            return ConvergenceStatus::Converged;
        }
        self.remaining -= 1;
        if stable {
            self.patience_left -= 1;
        } else {
            self.patience_left = self.criteria.patience;
        }
        ConvergenceStatus::Continue
    }

    /// Boolean view of [`check`](Self::check): `true` once training should stop.
    pub fn converged(&mut self, prev: f64, curr: f64) -> bool {
        self.check(prev, curr) != ConvergenceStatus::Continue
    }
}

// ---------------------------------------------------------------------------
// Sufficient statistics
// ---------------------------------------------------------------------------

/// Log-space expected counts accumulated over sequences.
#[derive(Debug, Clone)]
struct SufficientStats {
    n: usize,
    m: usize,
    p: Vec<f64>,
    q: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    /// Per-state expected number of transitions out (defined mode).
    a_norm: Vec<f64>,
    /// Per-state expected number of emissions (defined mode).
    b_norm: Vec<f64>,
    log_likelihood: f64,
    impossible: usize,
}

impl SufficientStats {
    fn new(n: usize, m: usize) -> Self {
        Self {
            n,
            m,
            p: vec![f64::NEG_INFINITY; n],
            q: vec![f64::NEG_INFINITY; n],
            a: vec![f64::NEG_INFINITY; n * n],
            b: vec![f64::NEG_INFINITY; n * m],
            a_norm: vec![f64::NEG_INFINITY; n],
            b_norm: vec![f64::NEG_INFINITY; n],
            log_likelihood: 0.0,
            impossible: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        merge_log(&mut self.p, &other.p);
        merge_log(&mut self.q, &other.q);
        merge_log(&mut self.a, &other.a);
        merge_log(&mut self.b, &other.b);
        merge_log(&mut self.a_norm, &other.a_norm);
        merge_log(&mut self.b_norm, &other.b_norm);
        self.log_likelihood += other.log_likelihood;
        self.impossible += other.impossible;
        self
    }
}

fn merge_log(dst: &mut [f64], src: &[f64]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = log_sum_exp(*d, s);
    }
}

/// Integer path tallies for Viterbi training.
#[derive(Debug, Clone)]
struct ViterbiTallies {
    p: Vec<u64>,
    q: Vec<u64>,
    a: Vec<u64>,
    b: Vec<u64>,
    path_log_prob: f64,
    log_likelihood: f64,
    impossible: usize,
}

impl ViterbiTallies {
    fn new(n: usize, m: usize) -> Self {
        Self {
            p: vec![0; n],
            q: vec![0; n],
            a: vec![0; n * n],
            b: vec![0; n * m],
            path_log_prob: 0.0,
            log_likelihood: 0.0,
            impossible: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (d, s) in [
            (&mut self.p, &other.p),
            (&mut self.q, &other.q),
            (&mut self.a, &other.a),
            (&mut self.b, &other.b),
        ] {
            d.iter_mut().zip(s).for_each(|(x, y)| *x += y);
        }
        self.path_log_prob += other.path_log_prob;
        self.log_likelihood += other.log_likelihood;
        self.impossible += other.impossible;
        self
    }
}

// ---------------------------------------------------------------------------
// Per-sequence accumulation
// ---------------------------------------------------------------------------

/// `logsum_{t < T-1} alpha_t(i) + a(i, j) + b(j, o_t+1) + beta_t+1(j)`.
#[inline]
fn expected_transitions(
    est: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    alpha: &[f64],
    beta: &[f64],
    i: usize,
    j: usize,
) -> f64 {
    let n = est.n_states();
    let a_ij = est.a_at(i, j);
    let mut acc = f64::NEG_INFINITY;
    for t in 0..obs.length_of(dim) - 1 {
        let v = alpha[t * n + i] + a_ij + est.b_at(j, obs.symbol_at(dim, t + 1)) + beta[(t + 1) * n + j];
        acc = log_sum_exp(acc, v);
    }
    acc
}

/// `logsum_{t < until} alpha_t(i) + beta_t(i)`.
#[inline]
fn expected_occupancy(alpha: &[f64], beta: &[f64], n: usize, i: usize, until: usize) -> f64 {
    (0..until).fold(f64::NEG_INFINITY, |acc, t| {
        log_sum_exp(acc, alpha[t * n + i] + beta[t * n + i])
    })
}

/// Per-symbol `logsum_{t: o_t = k} alpha_t(i) + beta_t(i)` into `emit`.
fn expected_emissions(
    obs: &dyn ObservationSet,
    dim: usize,
    alpha: &[f64],
    beta: &[f64],
    n: usize,
    i: usize,
    emit: &mut [f64],
) {
    emit.fill(f64::NEG_INFINITY);
    for t in 0..obs.length_of(dim) {
        let k = obs.symbol_at(dim, t);
        emit[k] = log_sum_exp(emit[k], alpha[t * n + i] + beta[t * n + i]);
    }
}

/// Run forward and backward for `dim`; `None` if the sequence is impossible.
fn evaluate_tables(
    est: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
) -> Option<f64> {
    let ll = forward_table(est, obs, dim, &mut ws.alpha);
    if !ll.is_finite() {
        return None;
    }
    backward_table(est, obs, dim, &mut ws.beta);
    Some(ll)
}

fn accumulate_full(
    est: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
    mut stats: SufficientStats,
    emissions: bool,
) -> SufficientStats {
    let Some(ll) = evaluate_tables(est, obs, dim, ws) else {
        stats.impossible += 1;
        return stats;
    };
    stats.log_likelihood += ll;

    let n = stats.n;
    let m = stats.m;
    let len = obs.length_of(dim);
    let o0 = obs.symbol_at(dim, 0);
    let graph = est.graph();
    let (alpha, beta) = (&ws.alpha, &ws.beta);
    let mut emit = vec![f64::NEG_INFINITY; m];

    for i in 0..n {
        stats.p[i] = log_sum_exp(stats.p[i], est.p_at(i) + est.b_at(i, o0) + beta[i] - ll);
        stats.q[i] = log_sum_exp(stats.q[i], alpha[(len - 1) * n + i] + est.q_at(i) - ll);

        for &j in graph.successors(i) {
            let xi = expected_transitions(est, obs, dim, alpha, beta, i, j);
            stats.a[i * n + j] = log_sum_exp(stats.a[i * n + j], xi - ll);
        }

        if emissions {
            expected_emissions(obs, dim, alpha, beta, n, i, &mut emit);
            for (k, &e) in emit.iter().enumerate() {
                stats.b[i * m + k] = log_sum_exp(stats.b[i * m + k], e - ll);
            }
        }
    }
    stats
}

fn accumulate_defined(
    est: &ParameterStore,
    model: &Model,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
    mut stats: SufficientStats,
) -> SufficientStats {
    let Some(ll) = evaluate_tables(est, obs, dim, ws) else {
        stats.impossible += 1;
        return stats;
    };
    stats.log_likelihood += ll;

    let n = stats.n;
    let m = stats.m;
    let len = obs.length_of(dim);
    let o0 = obs.symbol_at(dim, 0);
    let (alpha, beta) = (&ws.alpha, &ws.beta);

    for &i in model.learn_p_states() {
        stats.p[i] = log_sum_exp(stats.p[i], est.p_at(i) + est.b_at(i, o0) + beta[i] - ll);
    }
    for &i in model.learn_q_states() {
        stats.q[i] = log_sum_exp(stats.q[i], alpha[(len - 1) * n + i] + est.q_at(i) - ll);
    }

    for (i, cells) in model.learn_a_rows() {
        let gamma = expected_occupancy(alpha, beta, n, i, len - 1);
        stats.a_norm[i] = log_sum_exp(stats.a_norm[i], gamma - ll);
        for &(_, j) in cells {
            let xi = expected_transitions(est, obs, dim, alpha, beta, i, j);
            stats.a[i * n + j] = log_sum_exp(stats.a[i * n + j], xi - ll);
        }
    }

    let mut emit = vec![f64::NEG_INFINITY; m];
    for (i, cells) in model.learn_b_rows() {
        let gamma = expected_occupancy(alpha, beta, n, i, len);
        stats.b_norm[i] = log_sum_exp(stats.b_norm[i], gamma - ll);
        expected_emissions(obs, dim, alpha, beta, n, i, &mut emit);
        for &(_, k) in cells {
            stats.b[i * m + k] = log_sum_exp(stats.b[i * m + k], emit[k] - ll);
        }
    }
    stats
}

fn tally_path(
    est: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
    mut tallies: ViterbiTallies,
) -> ViterbiTallies {
    let n = est.n_states();
    let m = est.n_symbols();
    tallies.log_likelihood += forward_likelihood(est, obs, dim, ws);

    let mut path = std::mem::take(&mut ws.path);
    let score = viterbi_path(est, obs, dim, ws, &mut path);
    if score.is_finite() {
        tallies.path_log_prob += score;
        let len = path.len();
        for t in 0..len {
            let s = path[t];
            tallies.b[s * m + obs.symbol_at(dim, t)] += 1;
            if t + 1 < len {
                tallies.a[s * n + path[t + 1]] += 1;
            }
        }
        tallies.p[path[0]] += 1;
        tallies.q[path[len - 1]] += 1;
    } else {
        tallies.impossible += 1;
        tallies.path_log_prob = f64::NEG_INFINITY;
    }
    ws.path = path;
    tallies
}

/// `dst[k] = ln((counts[k] + pseudo) / sum)` over `indices`.
fn counts_to_log(dst: &mut [f64], counts: &[u64], indices: impl Iterator<Item = usize> + Clone, pseudo: f64) {
    let total: f64 = indices.clone().map(|k| counts[k] as f64 + pseudo).sum();
    if total <= 0.0 {
        return;
    }
    for k in indices {
        dst[k] = ((counts[k] as f64 + pseudo) / total).ln();
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Drives iterative re-estimation over a bound observation set.
pub struct Trainer<'a> {
    dispatcher: &'a Dispatcher,
    obs: &'a (dyn ObservationSet + Send + Sync),
    pseudo: f64,
    stop: Option<&'a AtomicBool>,
    state: TrainerState,
}

impl<'a> Trainer<'a> {
    pub fn new(
        dispatcher: &'a Dispatcher,
        obs: &'a (dyn ObservationSet + Send + Sync),
        pseudo: f64,
    ) -> Self {
        Self {
            dispatcher,
            obs,
            pseudo,
            stop: None,
            state: TrainerState::Initializing,
        }
    }

    /// Poll `flag` once per iteration and stop when it is set.
    pub fn with_stop_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Baum-Welch EM starting from `initial`.
    ///
    /// Returns the best-scoring parameters seen and a report.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::MalformedDefinitions`] if `mode` is
    ///   [`BaumWelchMode::Defined`] and `model` is `None` or does not fit.
    /// - Any [`validate_observations`] error for the observation set.
    pub fn baum_welch(
        &mut self,
        initial: &ParameterStore,
        mode: BaumWelchMode,
        model: Option<&Model>,
        convergence: &mut Convergence,
    ) -> Result<(ParameterStore, TrainingReport)> {
        validate_observations(self.obs, initial.n_symbols())?;
        let model = match mode {
            BaumWelchMode::Defined => Some(require_model(model, initial)?),
            _ => None,
        };
        info!(
            ?mode,
            sequences = self.obs.num_sequences(),
            states = initial.n_states(),
            "baum-welch training started"
        );
        self.run(initial, convergence, |t, est| match &model {
            Some(model) => t.baum_welch_defined_step(est, model),
            None => Ok(t.baum_welch_step(est, mode == BaumWelchMode::Full)),
        })
    }

    /// Viterbi training starting from `initial`.
    ///
    /// # Errors
    ///
    /// As for [`baum_welch`](Self::baum_welch) with [`ViterbiMode::Defined`].
    pub fn viterbi(
        &mut self,
        initial: &ParameterStore,
        mode: ViterbiMode,
        model: Option<&Model>,
        convergence: &mut Convergence,
    ) -> Result<(ParameterStore, TrainingReport)> {
        validate_observations(self.obs, initial.n_symbols())?;
        let model = match mode {
            ViterbiMode::Defined => Some(require_model(model, initial)?),
            ViterbiMode::Full => None,
        };
        info!(
            ?mode,
            sequences = self.obs.num_sequences(),
            states = initial.n_states(),
            "viterbi training started"
        );
        self.run(initial, convergence, |t, est| Ok(t.viterbi_step(est, model.as_ref())))
    }

    fn run<S>(
        &mut self,
        initial: &ParameterStore,
        convergence: &mut Convergence,
        mut step: S,
    ) -> Result<(ParameterStore, TrainingReport)>
    where
        S: FnMut(&Self, &ParameterStore) -> Result<(ParameterStore, f64)>,
    {
        self.state = TrainerState::Iterating;
        let mut estimate = initial.clone();
        let mut best: Option<(ParameterStore, f64)> = None;
        let mut prev = f64::NEG_INFINITY;
        let mut history = Vec::new();
        let mut converged = false;
        let mut cancelled = false;

        loop {
            if self.stop.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                warn!(iterations = history.len(), "training cancelled");
                convergence.reset();
                cancelled = true;
                break;
            }

            let (next, score) = step(&*self, &estimate)?;
            history.push(score);
            debug!(
                iteration = history.len(),
                score,
                delta = score - prev,
                "training iteration"
            );

            let evaluated = std::mem::replace(&mut estimate, next);
            if best.as_ref().map_or(true, |(_, s)| score >= *s) {
                best = Some((evaluated, score));
            }

            match convergence.check(prev, score) {
                ConvergenceStatus::Continue => prev = score,
                ConvergenceStatus::Converged => {
                    converged = true;
                    break;
                }
                ConvergenceStatus::IterationCapReached => {
                    warn!(
                        cap = convergence.criteria().max_iterations,
                        "iteration cap reached before convergence"
                    );
                    break;
                }
            }
        }

        let final_score = mean_log_likelihood(self.dispatcher, &estimate, self.obs);
        let (params, log_likelihood) = match best {
            Some((params, score)) if score > final_score => (params, score),
            _ => (estimate, final_score),
        };

        self.state = if converged {
            TrainerState::Converged
        } else {
            TrainerState::Stopped
        };
        info!(
            iterations = history.len(),
            log_likelihood,
            converged,
            cancelled,
            "training finished"
        );

        Ok((
            params,
            TrainingReport {
                iterations: history.len(),
                log_likelihood,
                converged,
                cancelled,
                history,
            },
        ))
    }

    // -----------------------------------------------------------------------
    // Single steps
    // -----------------------------------------------------------------------

    fn report_impossible(&self, impossible: usize) {
        if impossible > 0 {
            warn!(
                impossible,
                "sequences have zero probability under the current parameters"
            );
        }
    }

    fn mean(&self, total: f64, impossible: usize) -> f64 {
        if impossible > 0 {
            f64::NEG_INFINITY
        } else {
            total / self.obs.num_sequences() as f64
        }
    }

    /// One Baum-Welch iteration over all parameters (or all but emissions).
    fn baum_welch_step(&self, estimate: &ParameterStore, emissions: bool) -> (ParameterStore, f64) {
        let n = estimate.n_states();
        let m = estimate.n_symbols();
        estimate.graph();
        let stats = self.dispatcher.map_reduce(
            self.obs.num_sequences(),
            n,
            || SufficientStats::new(n, m),
            |ws, stats, dim| accumulate_full(estimate, self.obs, dim, ws, stats, emissions),
            SufficientStats::merge,
        );
        self.report_impossible(stats.impossible);

        let mut work = estimate.clone();
        work.reset_from(estimate, self.pseudo, emissions);
        merge_log(work.p_mut(), &stats.p);
        merge_log(work.q_mut(), &stats.q);
        merge_log(work.a_mut(), &stats.a);
        if emissions {
            merge_log(work.b_mut(), &stats.b);
        }
        work.normalize(false);
        if !emissions {
            work.b_mut().copy_from_slice(estimate.log_b());
        }

        (work, self.mean(stats.log_likelihood, stats.impossible))
    }

    /// One Baum-Welch iteration restricted to the learnable cells of `model`.
    fn baum_welch_defined_step(
        &self,
        estimate: &ParameterStore,
        model: &Model,
    ) -> Result<(ParameterStore, f64)> {
        let n = estimate.n_states();
        let m = estimate.n_symbols();
        estimate.graph();
        let stats = self.dispatcher.map_reduce(
            self.obs.num_sequences(),
            n,
            || SufficientStats::new(n, m),
            |ws, stats, dim| accumulate_defined(estimate, model, self.obs, dim, ws, stats),
            SufficientStats::merge,
        );
        self.report_impossible(stats.impossible);

        let floor = self.pseudo.ln();
        let live = (self.obs.num_sequences() - stats.impossible) as f64;
        let start_mass = live + n as f64 * self.pseudo;
        let start_norm = if start_mass > 0.0 { start_mass.ln() } else { 0.0 };

        let mut work = estimate.clone();
        work.clear_defined(model, self.pseudo)?;
        {
            let p = work.p_mut();
            for &i in model.learn_p_states() {
                p[i] = log_sum_exp(p[i], stats.p[i]) - start_norm;
            }
        }
        {
            let q = work.q_mut();
            for &i in model.learn_q_states() {
                q[i] = log_sum_exp(q[i], stats.q[i]) - start_norm;
            }
        }
        {
            let a = work.a_mut();
            for (i, cells) in model.learn_a_rows() {
                let denom = log_sum_exp(floor, stats.a_norm[i]);
                for &(_, j) in cells {
                    a[i * n + j] = log_sum_exp(a[i * n + j], stats.a[i * n + j]) - denom;
                }
            }
        }
        {
            let b = work.b_mut();
            for (i, cells) in model.learn_b_rows() {
                let denom = log_sum_exp(floor, stats.b_norm[i]);
                for &(_, k) in cells {
                    b[i * m + k] = log_sum_exp(b[i * m + k], stats.b[i * m + k]) - denom;
                }
            }
        }

        Ok((work, self.mean(stats.log_likelihood, stats.impossible)))
    }

    /// One Viterbi-training iteration.
    fn viterbi_step(&self, estimate: &ParameterStore, model: Option<&Model>) -> (ParameterStore, f64) {
        let n = estimate.n_states();
        let m = estimate.n_symbols();
        estimate.graph();
        let tallies = self.dispatcher.map_reduce(
            self.obs.num_sequences(),
            n,
            || ViterbiTallies::new(n, m),
            |ws, tallies, dim| tally_path(estimate, self.obs, dim, ws, tallies),
            ViterbiTallies::merge,
        );
        self.report_impossible(tallies.impossible);
        debug!(
            mean_best_path = tallies.path_log_prob / self.obs.num_sequences() as f64,
            "viterbi paths decoded"
        );

        let pseudo = self.pseudo;
        let mut work = estimate.clone();
        match model {
            None => {
                {
                    let a = work.a_mut();
                    for i in 0..n {
                        counts_to_log(a, &tallies.a, i * n..(i + 1) * n, pseudo);
                    }
                }
                {
                    let b = work.b_mut();
                    for i in 0..n {
                        counts_to_log(b, &tallies.b, i * m..(i + 1) * m, pseudo);
                    }
                }
                counts_to_log(work.p_mut(), &tallies.p, 0..n, pseudo);
                counts_to_log(work.q_mut(), &tallies.q, 0..n, pseudo);
            }
            Some(model) => {
                {
                    let a = work.a_mut();
                    for (i, cells) in model.learn_a_rows() {
                        counts_to_log(a, &tallies.a, cells.iter().map(|&(_, j)| i * n + j), pseudo);
                    }
                }
                {
                    let b = work.b_mut();
                    for (i, cells) in model.learn_b_rows() {
                        counts_to_log(b, &tallies.b, cells.iter().map(|&(_, k)| i * m + k), pseudo);
                    }
                }
                counts_to_log(
                    work.p_mut(),
                    &tallies.p,
                    model.learn_p_states().iter().copied(),
                    pseudo,
                );
                counts_to_log(
                    work.q_mut(),
                    &tallies.q,
                    model.learn_q_states().iter().copied(),
                    pseudo,
                );
            }
        }

        (work, self.mean(tallies.log_likelihood, tallies.impossible))
    }
}

/// Finalized copy of `model`; row grouping relies on sorted, deduplicated cells.
fn require_model(model: Option<&Model>, params: &ParameterStore) -> Result<Model> {
    let model = model.ok_or_else(|| {
        CyaneaError::MalformedDefinitions("no parameter definitions are set".into())
    })?;
    model.clone().finalize(params.n_states(), params.n_symbols())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::SequenceSet;
    use cyanea_core::log_sum_exp_slice;

    const TOL: f64 = 1e-9;

    fn coin() -> ParameterStore {
        ParameterStore::from_probabilities(
            2,
            2,
            vec![0.6, 0.4],
            vec![0.05, 0.05],
            vec![0.65, 0.3, 0.35, 0.6],
            vec![0.6, 0.4, 0.3, 0.7],
        )
        .unwrap()
    }

    fn coin_flips() -> SequenceSet {
        SequenceSet::new(vec![
            vec![0, 0, 1, 0, 1, 1, 0, 0, 0, 1, 0, 0, 1, 1, 0],
            vec![1, 1, 1, 0, 1, 1, 1, 0, 0, 1],
            vec![0, 0, 0, 0, 1, 0, 0],
        ])
    }

    // -----------------------------------------------------------------------
    // Convergence
    // -----------------------------------------------------------------------

    #[test]
    fn convergence_requires_patience() {
        let mut c = Convergence::new(ConvergenceCriteria {
            max_iterations: 100,
            epsilon: 1e-3,
            patience: 2,
        });
        assert_eq!(c.check(-10.0, -5.0), ConvergenceStatus::Continue);
        assert_eq!(c.check(-5.0, -5.0), ConvergenceStatus::Continue);
        assert_eq!(c.check(-5.0, -5.0), ConvergenceStatus::Continue);
        assert_eq!(c.check(-5.0, -5.0), ConvergenceStatus::Converged);
        // reset after a terminal outcome
        assert_eq!(c.check(-5.0, -5.0), ConvergenceStatus::Continue);
    }

    #[test]
    fn instability_restores_patience() {
        let mut c = Convergence::new(ConvergenceCriteria {
            max_iterations: 100,
            epsilon: 1e-3,
            patience: 1,
        });
        assert!(!c.converged(-1.0, -1.0));
        assert!(!c.converged(-1.0, -0.5));
        assert!(!c.converged(-0.5, -0.5));
        assert!(c.converged(-0.5, -0.5));
    }

    #[test]
    fn cap_reports_converged_predicate() {
        let mut c = Convergence::new(ConvergenceCriteria {
            max_iterations: 3,
            epsilon: 1e-6,
            patience: 5,
        });
        assert!(!c.converged(0.0, 1.0));
        assert!(!c.converged(1.0, 2.0));
        assert!(!c.converged(2.0, 3.0));
        let mut again = c.clone();
        assert_eq!(again.check(3.0, 4.0), ConvergenceStatus::IterationCapReached);
        assert!(c.converged(3.0, 4.0));
    }

    // -----------------------------------------------------------------------
    // Baum-Welch
    // -----------------------------------------------------------------------

    #[test]
    fn baum_welch_history_is_monotone() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        // Without pseudo-counts each step is an exact EM step.
        let mut trainer = Trainer::new(&dispatcher, &obs, 0.0);
        let mut conv = Convergence::new(ConvergenceCriteria {
            max_iterations: 25,
            epsilon: 0.0,
            patience: 0,
        });
        let (trained, report) = trainer
            .baum_welch(&coin(), BaumWelchMode::Full, None, &mut conv)
            .unwrap();
        assert_eq!(trainer.state(), TrainerState::Stopped);
        assert!(!report.converged);
        assert_eq!(report.iterations, 26);
        for w in report.history.windows(2) {
            assert!(w[1] >= w[0] - TOL, "likelihood dropped: {} -> {}", w[0], w[1]);
        }
        assert!(report.log_likelihood >= report.history[0]);
        let rescored = mean_log_likelihood(&dispatcher, &trained, &obs);
        assert!((rescored - report.log_likelihood).abs() < TOL);
    }

    #[test]
    fn baum_welch_preserves_normalization_and_zeros() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        let mut params = coin();
        params.set_a(1, 0, f64::NEG_INFINITY).unwrap();
        params.normalize(false);
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let mut conv = Convergence::new(ConvergenceCriteria::default());
        let (trained, report) = trainer
            .baum_welch(&params, BaumWelchMode::Full, None, &mut conv)
            .unwrap();
        assert_eq!(trainer.state() == TrainerState::Converged, report.converged);
        assert_eq!(trained.a(1, 0).unwrap(), f64::NEG_INFINITY);
        assert!(log_sum_exp_slice(trained.log_p()).abs() < TOL);
        for i in 0..2 {
            let row = log_sum_exp(trained.q_at(i), log_sum_exp_slice(&trained.log_a()[i * 2..i * 2 + 2]));
            assert!(row.abs() < TOL);
            assert!(log_sum_exp_slice(&trained.log_b()[i * 2..i * 2 + 2]).abs() < TOL);
        }
    }

    #[test]
    fn transitions_only_keeps_emissions() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        let params = coin();
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let mut conv = Convergence::new(ConvergenceCriteria {
            max_iterations: 5,
            ..Default::default()
        });
        let (trained, _) = trainer
            .baum_welch(&params, BaumWelchMode::TransitionsOnly, None, &mut conv)
            .unwrap();
        assert_eq!(trained.log_b(), params.log_b());
        assert_ne!(trained.log_a(), params.log_a());
    }

    #[test]
    fn parallel_step_matches_sequential() {
        let obs = coin_flips();
        let seq = Dispatcher::sequential();
        let par = Dispatcher::new(3).unwrap();
        let params = coin();
        let (a, sa) = Trainer::new(&seq, &obs, 1e-3).baum_welch_step(&params, true);
        let (b, sb) = Trainer::new(&par, &obs, 1e-3).baum_welch_step(&params, true);
        assert!((sa - sb).abs() < TOL);
        for (x, y) in a.log_a().iter().zip(b.log_a()) {
            assert!((x - y).abs() < TOL);
        }
        for (x, y) in a.log_b().iter().zip(b.log_b()) {
            assert!((x - y).abs() < TOL);
        }
    }

    #[test]
    fn defined_baum_welch_touches_only_learnable_cells() {
        let params = ParameterStore::from_probabilities(
            2,
            2,
            vec![0.5, 0.5],
            vec![0.0, 1.0],
            vec![0.5, 0.5, 0.0, 1.0],
            vec![0.9, 0.1, 0.1, 0.9],
        )
        .unwrap();
        let obs = SequenceSet::new(vec![vec![0, 0, 1], vec![0, 1, 1, 1]]);
        let model = Model::new().learn_a(0, 1).learn_p(0).finalize(2, 2).unwrap();
        let dispatcher = Dispatcher::sequential();
        let trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let (next, _) = trainer.baum_welch_defined_step(&params, &model).unwrap();

        assert_ne!(next.a(0, 1).unwrap(), params.a(0, 1).unwrap());
        assert_ne!(next.p(0).unwrap(), params.p(0).unwrap());
        assert_eq!(next.a(0, 0).unwrap(), params.a(0, 0).unwrap());
        assert_eq!(next.a(1, 1).unwrap(), params.a(1, 1).unwrap());
        assert_eq!(next.p(1).unwrap(), params.p(1).unwrap());
        assert_eq!(next.log_q(), params.log_q());
        assert_eq!(next.log_b(), params.log_b());
    }

    #[test]
    fn defined_mode_requires_definitions() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let mut conv = Convergence::new(ConvergenceCriteria::default());
        let err = trainer
            .baum_welch(&coin(), BaumWelchMode::Defined, None, &mut conv)
            .unwrap_err();
        assert!(matches!(err, CyaneaError::MalformedDefinitions(_)));
    }

    #[test]
    fn unsorted_definitions_train_like_finalized() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        let raw = Model::new()
            .learn_a(1, 1)
            .learn_a(0, 1)
            .learn_a(1, 0)
            .learn_a(0, 1)
            .learn_b(1, 0)
            .learn_b(0, 1)
            .learn_b(1, 0)
            .learn_p(1)
            .learn_p(1);
        let sorted = raw.clone().finalize(2, 2).unwrap();
        let criteria = ConvergenceCriteria {
            max_iterations: 3,
            ..Default::default()
        };

        let mut conv = Convergence::new(criteria);
        let (from_raw, _) = Trainer::new(&dispatcher, &obs, 1e-3)
            .baum_welch(&coin(), BaumWelchMode::Defined, Some(&raw), &mut conv)
            .unwrap();
        let mut conv = Convergence::new(criteria);
        let (from_sorted, _) = Trainer::new(&dispatcher, &obs, 1e-3)
            .baum_welch(&coin(), BaumWelchMode::Defined, Some(&sorted), &mut conv)
            .unwrap();
        assert_eq!(from_raw.log_p(), from_sorted.log_p());
        assert_eq!(from_raw.log_a(), from_sorted.log_a());
        assert_eq!(from_raw.log_b(), from_sorted.log_b());

        let mut conv = Convergence::new(criteria);
        let (from_raw, _) = Trainer::new(&dispatcher, &obs, 1e-3)
            .viterbi(&coin(), ViterbiMode::Defined, Some(&raw), &mut conv)
            .unwrap();
        let mut conv = Convergence::new(criteria);
        let (from_sorted, _) = Trainer::new(&dispatcher, &obs, 1e-3)
            .viterbi(&coin(), ViterbiMode::Defined, Some(&sorted), &mut conv)
            .unwrap();
        assert_eq!(from_raw.log_a(), from_sorted.log_a());
        assert_eq!(from_raw.log_b(), from_sorted.log_b());
    }

    #[test]
    fn trainer_validates_observations() {
        let dispatcher = Dispatcher::sequential();
        let mut conv = Convergence::new(ConvergenceCriteria::default());

        let with_empty = SequenceSet::new(vec![vec![0, 1], vec![]]);
        let err = Trainer::new(&dispatcher, &with_empty, 1e-3)
            .baum_welch(&coin(), BaumWelchMode::Full, None, &mut conv)
            .unwrap_err();
        assert!(matches!(err, CyaneaError::InvalidInput(_)));

        let wide = SequenceSet::new(vec![vec![0, 1], vec![0, 5, 1]]);
        let err = Trainer::new(&dispatcher, &wide, 1e-3)
            .viterbi(&coin(), ViterbiMode::Full, None, &mut conv)
            .unwrap_err();
        assert!(matches!(
            err,
            CyaneaError::SymbolOutOfRange {
                dimension: 1,
                position: 1,
                symbol: 5,
                n_symbols: 2
            }
        ));

        let none = SequenceSet::new(Vec::new());
        let err = Trainer::new(&dispatcher, &none, 1e-3)
            .baum_welch(&coin(), BaumWelchMode::Full, None, &mut conv)
            .unwrap_err();
        assert!(matches!(err, CyaneaError::NoObservations));
    }

    #[test]
    fn defined_start_mass_ignores_impossible_sequences() {
        // symbol 1 cannot be emitted by any state
        let params = ParameterStore::from_probabilities(
            2,
            2,
            vec![0.5, 0.5],
            vec![0.5, 0.5],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![1.0, 0.0, 1.0, 0.0],
        )
        .unwrap();
        let obs = SequenceSet::new(vec![vec![0, 0], vec![1], vec![0]]);
        let model = Model::new().learn_p(0).learn_p(1).finalize(2, 2).unwrap();
        let dispatcher = Dispatcher::sequential();
        let trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let (next, score) = trainer.baum_welch_defined_step(&params, &model).unwrap();
        assert_eq!(score, f64::NEG_INFINITY);
        assert!(log_sum_exp_slice(next.log_p()).abs() < TOL);
    }

    #[test]
    fn stop_flag_cancels_before_first_step() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::sequential();
        let flag = AtomicBool::new(true);
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3).with_stop_flag(&flag);
        let mut conv = Convergence::new(ConvergenceCriteria::default());
        let params = coin();
        let (trained, report) = trainer
            .baum_welch(&params, BaumWelchMode::Full, None, &mut conv)
            .unwrap();
        assert!(report.cancelled);
        assert!(!report.converged);
        assert_eq!(report.iterations, 0);
        assert_eq!(trained.log_a(), params.log_a());
    }

    // -----------------------------------------------------------------------
    // Viterbi training
    // -----------------------------------------------------------------------

    #[test]
    fn viterbi_step_counts_paths() {
        let params = ParameterStore::from_probabilities(
            2,
            2,
            vec![0.5, 0.5],
            vec![0.0, 1.0],
            vec![0.5, 0.5, 0.0, 1.0],
            vec![0.9, 0.1, 0.1, 0.9],
        )
        .unwrap();
        // decoded path [0, 0, 1]
        let obs = SequenceSet::new(vec![vec![0, 0, 1]]);
        let dispatcher = Dispatcher::sequential();
        let trainer = Trainer::new(&dispatcher, &obs, 0.0);
        let (next, score) = trainer.viterbi_step(&params, None);
        assert!((score - 0.115875_f64.ln()).abs() < TOL);
        // a(0, .) counts: 0->0 once, 0->1 once
        assert!((next.a(0, 0).unwrap() - 0.5_f64.ln()).abs() < TOL);
        assert!((next.a(0, 1).unwrap() - 0.5_f64.ln()).abs() < TOL);
        // b(0, .) counts: symbol 0 twice
        assert_eq!(next.b(0, 0).unwrap(), 0.0);
        assert_eq!(next.b(0, 1).unwrap(), f64::NEG_INFINITY);
        assert_eq!(next.p(0).unwrap(), 0.0);
        assert_eq!(next.q(1).unwrap(), 0.0);
        // state 1 never transitions: its row keeps the estimate
        assert_eq!(next.a(1, 1).unwrap(), params.a(1, 1).unwrap());
    }

    #[test]
    fn viterbi_defined_normalizes_within_groups() {
        let mut params = ParameterStore::new(2, 2).unwrap();
        params.init_random(17);
        let obs = coin_flips();
        let model = Model::new()
            .learn_b(0, 0)
            .learn_b(0, 1)
            .finalize(2, 2)
            .unwrap();
        let dispatcher = Dispatcher::sequential();
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let mut conv = Convergence::new(ConvergenceCriteria {
            max_iterations: 4,
            ..Default::default()
        });
        let (trained, report) = trainer
            .viterbi(&params, ViterbiMode::Defined, Some(&model), &mut conv)
            .unwrap();
        assert!(report.iterations >= 1);
        assert_eq!(trained.log_a(), params.log_a());
        assert_eq!(&trained.log_b()[2..], &params.log_b()[2..]);
        let row = log_sum_exp(trained.b(0, 0).unwrap(), trained.b(0, 1).unwrap());
        assert!(row.abs() < TOL);
    }

    #[test]
    fn viterbi_training_runs_to_outcome() {
        let obs = coin_flips();
        let dispatcher = Dispatcher::new(2).unwrap();
        let mut trainer = Trainer::new(&dispatcher, &obs, 1e-3);
        let mut conv = Convergence::new(ConvergenceCriteria::default());
        let (trained, report) = trainer
            .viterbi(&coin(), ViterbiMode::Full, None, &mut conv)
            .unwrap();
        assert!(report.log_likelihood.is_finite());
        let best_seen = report.history.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(report.log_likelihood >= best_seen - TOL);
        assert_eq!(trained.n_states(), 2);
    }
}
