//! Sparse adjacency over the transition matrix.
//!
//! Dynamic-programming kernels iterate only over transitions with non-zero
//! probability. For models with many structural zeros (left-to-right gene
//! models, profile-like topologies) this turns the `O(N^2)` inner loop into
//! `O(edges)`.

/// Forward and backward adjacency lists derived from `log_a`.
///
/// An edge `i -> j` exists iff `log_a[i * n + j] > -inf`. Both lists are in
/// ascending state order, which keeps Viterbi tie-breaking identical to a
/// dense scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGraph {
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
}

impl TransitionGraph {
    /// Build from a row-major `n x n` log transition matrix.
    pub fn from_log_transitions(n: usize, log_a: &[f64]) -> Self {
        debug_assert_eq!(log_a.len(), n * n);
        let mut predecessors = vec![Vec::new(); n];
        let mut successors = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if log_a[i * n + j] > f64::NEG_INFINITY {
                    successors[i].push(j);
                    predecessors[j].push(i);
                }
            }
        }
        Self {
            predecessors,
            successors,
        }
    }

    /// States `i` with a transition into `j`.
    #[inline]
    pub fn predecessors(&self, j: usize) -> &[usize] {
        &self.predecessors[j]
    }

    /// States `j` reachable from `i` in one step.
    #[inline]
    pub fn successors(&self, i: usize) -> &[usize] {
        &self.successors[i]
    }

    pub fn n_states(&self) -> usize {
        self.successors.len()
    }

    /// Total number of non-zero transitions.
    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }
}
