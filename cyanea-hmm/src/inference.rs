//! Log-space dynamic-programming kernels: forward, backward and Viterbi.
//!
//! Every kernel reads a frozen [`ParameterStore`] and one observation
//! sequence, and iterates only over the non-zero transitions recorded in the
//! store's [`TransitionGraph`](crate::graph::TransitionGraph). The kernels
//! never validate their inputs; the [`Hmm`](crate::Hmm) facade and the trainer
//! check states, dimensions and symbols before calling in.
//!
//! Recurrences, with `o_t` the symbol at position `t` of a length-`T` sequence:
//!
//! ```text
//! alpha_0(i)     = p(i) + b(i, o_0)
//! alpha_t+1(j)   = logsum_{i in pred(j)} (alpha_t(i) + a(i, j)) + b(j, o_t+1)
//! L              = logsum_i (alpha_T-1(i) + q(i))
//!
//! beta_T-1(i)    = q(i)
//! beta_t(i)      = logsum_{j in succ(i)} (a(i, j) + b(j, o_t+1) + beta_t+1(j))
//!
//! delta_0(i)     = p(i) + b(i, o_0)
//! delta_t+1(j)   = max_{i in pred(j)} (delta_t(i) + a(i, j)) + b(j, o_t+1)
//! ```
//!
//! Tables are flat `T x N` row-major vectors.

use cyanea_core::{log_sum_exp, ObservationSet};

use crate::graph::TransitionGraph;
use crate::params::ParameterStore;

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Per-worker scratch memory.
///
/// Holds two length-`N` rows that are flipped after every time step (the
/// double buffer used when only one column of a table is needed), full
/// `alpha`/`beta` tables for training, and the Viterbi backpointer table.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    rows: [Vec<f64>; 2],
    current: usize,
    psi: Vec<usize>,
    pub(crate) alpha: Vec<f64>,
    pub(crate) beta: Vec<f64>,
    pub(crate) path: Vec<usize>,
}

impl Workspace {
    pub fn new(n_states: usize) -> Self {
        Self {
            rows: [
                vec![f64::NEG_INFINITY; n_states],
                vec![f64::NEG_INFINITY; n_states],
            ],
            ..Self::default()
        }
    }

    /// Full forward table of the last [`forward_table`] run into this workspace.
    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    fn reset_rows(&mut self, n: usize) {
        for row in &mut self.rows {
            row.clear();
            row.resize(n, f64::NEG_INFINITY);
        }
        self.current = 0;
    }

    /// `(latest, next)` rows.
    fn split_rows(&mut self) -> (&[f64], &mut [f64]) {
        let [r0, r1] = &mut self.rows;
        if self.current == 0 {
            (r0.as_slice(), r1.as_mut_slice())
        } else {
            (r1.as_slice(), r0.as_mut_slice())
        }
    }

    fn flip(&mut self) {
        self.current ^= 1;
    }

    fn latest(&self) -> &[f64] {
        &self.rows[self.current]
    }
}

// ---------------------------------------------------------------------------
// Single steps
// ---------------------------------------------------------------------------

#[inline]
fn init_row(params: &ParameterStore, symbol: usize, row: &mut [f64]) {
    for (i, v) in row.iter_mut().enumerate() {
        *v = params.p_at(i) + params.b_at(i, symbol);
    }
}

#[inline]
fn forward_step(
    params: &ParameterStore,
    graph: &TransitionGraph,
    prev: &[f64],
    next: &mut [f64],
    symbol: usize,
) {
    for (j, out) in next.iter_mut().enumerate() {
        let mut acc = f64::NEG_INFINITY;
        for &i in graph.predecessors(j) {
            acc = log_sum_exp(acc, prev[i] + params.a_at(i, j));
        }
        *out = acc + params.b_at(j, symbol);
    }
}

#[inline]
fn backward_step(
    params: &ParameterStore,
    graph: &TransitionGraph,
    later: &[f64],
    out: &mut [f64],
    symbol: usize,
) {
    for (i, v) in out.iter_mut().enumerate() {
        let mut acc = f64::NEG_INFINITY;
        for &j in graph.successors(i) {
            acc = log_sum_exp(acc, params.a_at(i, j) + params.b_at(j, symbol) + later[j]);
        }
        *v = acc;
    }
}

/// Viterbi step. Ties keep the lowest predecessor; a state without
/// predecessors points back to state 0.
#[inline]
fn viterbi_step(
    params: &ParameterStore,
    graph: &TransitionGraph,
    prev: &[f64],
    next: &mut [f64],
    psi: &mut [usize],
    symbol: usize,
) {
    for (j, out) in next.iter_mut().enumerate() {
        let mut best = f64::NEG_INFINITY;
        let mut arg = 0;
        for &i in graph.predecessors(j) {
            let v = prev[i] + params.a_at(i, j);
            if v > best {
                best = v;
                arg = i;
            }
        }
        *out = best + params.b_at(j, symbol);
        psi[j] = arg;
    }
}

/// `logsum_i(row[i] + q(i))`.
#[inline]
pub fn terminate(params: &ParameterStore, last: &[f64]) -> f64 {
    last.iter()
        .enumerate()
        .fold(f64::NEG_INFINITY, |acc, (i, &v)| {
            log_sum_exp(acc, v + params.q_at(i))
        })
}

/// `logsum_j(p(j) + b(j, o_0) + beta_0(j))`.
#[inline]
pub fn originate(params: &ParameterStore, first_symbol: usize, beta0: &[f64]) -> f64 {
    beta0
        .iter()
        .enumerate()
        .fold(f64::NEG_INFINITY, |acc, (j, &v)| {
            log_sum_exp(acc, params.p_at(j) + params.b_at(j, first_symbol) + v)
        })
}

// ---------------------------------------------------------------------------
// Forward
// ---------------------------------------------------------------------------

/// Fill `alpha` with the full forward table of sequence `dim` and return the
/// sequence log-likelihood.
pub fn forward_table(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    alpha: &mut Vec<f64>,
) -> f64 {
    let n = params.n_states();
    let len = obs.length_of(dim);
    let graph = params.graph();
    alpha.clear();
    alpha.resize(len * n, f64::NEG_INFINITY);

    init_row(params, obs.symbol_at(dim, 0), &mut alpha[..n]);
    for t in 1..len {
        let (done, rest) = alpha.split_at_mut(t * n);
        forward_step(
            params,
            graph,
            &done[(t - 1) * n..],
            &mut rest[..n],
            obs.symbol_at(dim, t),
        );
    }
    terminate(params, &alpha[(len - 1) * n..])
}

/// Forward column at `time` (`time < T`), using only the double-buffered rows
/// of `ws`.
pub fn forward_row<'w>(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    time: usize,
    ws: &'w mut Workspace,
) -> &'w [f64] {
    let graph = params.graph();
    ws.reset_rows(params.n_states());
    {
        let (_, first) = ws.split_rows();
        init_row(params, obs.symbol_at(dim, 0), first);
    }
    ws.flip();
    for t in 1..=time {
        let (prev, next) = ws.split_rows();
        forward_step(params, graph, prev, next, obs.symbol_at(dim, t));
        ws.flip();
    }
    ws.latest()
}

/// Sequence log-likelihood without keeping a table.
pub fn forward_likelihood(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
) -> f64 {
    let last = obs.length_of(dim) - 1;
    let row = forward_row(params, obs, dim, last, ws);
    terminate(params, row)
}

// ---------------------------------------------------------------------------
// Backward
// ---------------------------------------------------------------------------

/// Fill `beta` with the full backward table of sequence `dim` and return the
/// total `logsum_j(p(j) + b(j, o_0) + beta_0(j))`.
pub fn backward_table(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    beta: &mut Vec<f64>,
) -> f64 {
    let n = params.n_states();
    let len = obs.length_of(dim);
    let graph = params.graph();
    beta.clear();
    beta.resize(len * n, f64::NEG_INFINITY);

    beta[(len - 1) * n..].copy_from_slice(params.log_q());
    for t in (0..len - 1).rev() {
        let (head, later) = beta.split_at_mut((t + 1) * n);
        backward_step(
            params,
            graph,
            &later[..n],
            &mut head[t * n..],
            obs.symbol_at(dim, t + 1),
        );
    }
    originate(params, obs.symbol_at(dim, 0), &beta[..n])
}

/// Backward column at `time` (`time < T`), using only the double-buffered
/// rows of `ws`.
pub fn backward_row<'w>(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    time: usize,
    ws: &'w mut Workspace,
) -> &'w [f64] {
    let graph = params.graph();
    let len = obs.length_of(dim);
    ws.reset_rows(params.n_states());
    {
        let (_, first) = ws.split_rows();
        first.copy_from_slice(params.log_q());
    }
    ws.flip();
    for t in (time..len - 1).rev() {
        let (later, out) = ws.split_rows();
        backward_step(params, graph, later, out, obs.symbol_at(dim, t + 1));
        ws.flip();
    }
    ws.latest()
}

// ---------------------------------------------------------------------------
// Viterbi
// ---------------------------------------------------------------------------

/// Most probable state path of sequence `dim`, written into `path`.
///
/// Returns the log-probability of that path. For an impossible sequence the
/// result is `-inf` and `path` is all zeros.
pub fn viterbi_path(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    ws: &mut Workspace,
    path: &mut Vec<usize>,
) -> f64 {
    let n = params.n_states();
    let len = obs.length_of(dim);
    let graph = params.graph();

    ws.reset_rows(n);
    let mut psi = std::mem::take(&mut ws.psi);
    psi.clear();
    psi.resize(len * n, 0);

    {
        let (_, first) = ws.split_rows();
        init_row(params, obs.symbol_at(dim, 0), first);
    }
    ws.flip();
    for t in 1..len {
        let (prev, next) = ws.split_rows();
        viterbi_step(
            params,
            graph,
            prev,
            next,
            &mut psi[t * n..(t + 1) * n],
            obs.symbol_at(dim, t),
        );
        ws.flip();
    }

    let mut best = f64::NEG_INFINITY;
    let mut arg = 0;
    for (i, &v) in ws.latest().iter().enumerate() {
        let v = v + params.q_at(i);
        if v > best {
            best = v;
            arg = i;
        }
    }

    path.clear();
    path.resize(len, 0);
    path[len - 1] = arg;
    for t in (0..len - 1).rev() {
        path[t] = psi[(t + 1) * n + path[t + 1]];
    }

    ws.psi = psi;
    best
}

/// Viterbi column `delta_time` (`time < T`) without backpointers.
pub fn viterbi_row<'w>(
    params: &ParameterStore,
    obs: &dyn ObservationSet,
    dim: usize,
    time: usize,
    ws: &'w mut Workspace,
) -> &'w [f64] {
    let n = params.n_states();
    let graph = params.graph();
    ws.reset_rows(n);
    let mut psi = std::mem::take(&mut ws.psi);
    psi.clear();
    psi.resize(n, 0);

    {
        let (_, first) = ws.split_rows();
        init_row(params, obs.symbol_at(dim, 0), first);
    }
    ws.flip();
    for t in 1..=time {
        let (prev, next) = ws.split_rows();
        viterbi_step(params, graph, prev, next, &mut psi, obs.symbol_at(dim, t));
        ws.flip();
    }
    ws.psi = psi;
    ws.latest()
}

// ===========================================================================
// Tests
// ===========================================================================
