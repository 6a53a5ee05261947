//! Parameter definitions: which cells are learnable and which are constant.
//!
//! A [`Model`] restricts training to an explicit subset of the parameter
//! tensors. Learnable transition and emission cells are kept sorted by row so
//! that per-row quantities (denominators, normalization sums) can be computed
//! once per row group, see [`Model::learn_a_rows`].
//!
//! Constant values are given in probability space, in `[0, 1]`.
//!
//! ```
//! use cyanea_hmm::model::Model;
//!
//! let model = Model::new()
//!     .learn_a(0, 1)
//!     .learn_a(0, 0)
//!     .learn_p(0)
//!     .const_q(1, 1.0)
//!     .finalize(2, 2)
//!     .unwrap();
//! assert_eq!(model.learn_a_cells(), &[(0, 0), (0, 1)]);
//! ```

use cyanea_core::{CyaneaError, Result};

/// Learnable and constant parameter definitions for an `N`-state, `M`-symbol HMM.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Model {
    learn_a: Vec<(usize, usize)>,
    learn_b: Vec<(usize, usize)>,
    learn_p: Vec<usize>,
    learn_q: Vec<usize>,
    const_a: Vec<(usize, usize, f64)>,
    const_b: Vec<(usize, usize, f64)>,
    const_p: Vec<(usize, f64)>,
    const_q: Vec<(usize, f64)>,
}

impl Model {
    /// An empty definition set: nothing learnable, nothing constant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark transition `i -> j` as learnable.
    pub fn learn_a(mut self, i: usize, j: usize) -> Self {
        self.learn_a.push((i, j));
        self
    }

    /// Mark emission of symbol `k` in state `i` as learnable.
    pub fn learn_b(mut self, i: usize, k: usize) -> Self {
        self.learn_b.push((i, k));
        self
    }

    /// Mark the initial probability of state `i` as learnable.
    pub fn learn_p(mut self, i: usize) -> Self {
        self.learn_p.push(i);
        self
    }

    /// Mark the end probability of state `i` as learnable.
    pub fn learn_q(mut self, i: usize) -> Self {
        self.learn_q.push(i);
        self
    }

    /// Fix transition `i -> j` to probability `value`.
    pub fn const_a(mut self, i: usize, j: usize, value: f64) -> Self {
        self.const_a.push((i, j, value));
        self
    }

    /// Fix emission of symbol `k` in state `i` to probability `value`.
    pub fn const_b(mut self, i: usize, k: usize, value: f64) -> Self {
        self.const_b.push((i, k, value));
        self
    }

    /// Fix the initial probability of state `i`.
    pub fn const_p(mut self, i: usize, value: f64) -> Self {
        self.const_p.push((i, value));
        self
    }

    /// Fix the end probability of state `i`.
    pub fn const_q(mut self, i: usize, value: f64) -> Self {
        self.const_q.push((i, value));
        self
    }

    /// Validate all indices against `n_states`/`n_symbols`, then sort and
    /// deduplicate the learnable lists.
    ///
    /// # Errors
    ///
    /// Returns [`CyaneaError::MalformedDefinitions`] naming the offending list
    /// and entry when an index is out of range or a constant is not a
    /// probability.
    pub fn finalize(mut self, n_states: usize, n_symbols: usize) -> Result<Self> {
        self.validate(n_states, n_symbols)?;
        self.learn_a.sort_unstable();
        self.learn_a.dedup();
        self.learn_b.sort_unstable();
        self.learn_b.dedup();
        self.learn_p.sort_unstable();
        self.learn_p.dedup();
        self.learn_q.sort_unstable();
        self.learn_q.dedup();
        Ok(self)
    }

    /// Check every index and constant without reordering anything.
    ///
    /// # Errors
    ///
    /// See [`finalize`](Self::finalize).
    pub fn validate(&self, n_states: usize, n_symbols: usize) -> Result<()> {
        check_pairs("learn_a", self.learn_a.iter().copied(), n_states, n_states)?;
        check_pairs("learn_b", self.learn_b.iter().copied(), n_states, n_symbols)?;
        check_indices("learn_p", self.learn_p.iter().copied(), n_states)?;
        check_indices("learn_q", self.learn_q.iter().copied(), n_states)?;

        check_pairs(
            "const_a",
            self.const_a.iter().map(|&(i, j, _)| (i, j)),
            n_states,
            n_states,
        )?;
        check_pairs(
            "const_b",
            self.const_b.iter().map(|&(i, k, _)| (i, k)),
            n_states,
            n_symbols,
        )?;
        check_indices("const_p", self.const_p.iter().map(|&(i, _)| i), n_states)?;
        check_indices("const_q", self.const_q.iter().map(|&(i, _)| i), n_states)?;

        let values = self
            .const_a
            .iter()
            .map(|c| ("const_a", c.2))
            .chain(self.const_b.iter().map(|c| ("const_b", c.2)))
            .chain(self.const_p.iter().map(|c| ("const_p", c.1)))
            .chain(self.const_q.iter().map(|c| ("const_q", c.1)));
        for (k, (list, v)) in values.enumerate() {
            if !(0.0..=1.0).contains(&v) {
                return Err(CyaneaError::MalformedDefinitions(format!(
                    "{list} value {v} (entry {k}) is not a probability"
                )));
            }
        }
        Ok(())
    }

    /// Learnable transition cells, sorted by `(row, column)` after [`finalize`](Self::finalize).
    pub fn learn_a_cells(&self) -> &[(usize, usize)] {
        &self.learn_a
    }

    /// Learnable emission cells, sorted by `(state, symbol)` after [`finalize`](Self::finalize).
    pub fn learn_b_cells(&self) -> &[(usize, usize)] {
        &self.learn_b
    }

    pub fn learn_p_states(&self) -> &[usize] {
        &self.learn_p
    }

    pub fn learn_q_states(&self) -> &[usize] {
        &self.learn_q
    }

    pub fn const_a_cells(&self) -> &[(usize, usize, f64)] {
        &self.const_a
    }

    pub fn const_b_cells(&self) -> &[(usize, usize, f64)] {
        &self.const_b
    }

    pub fn const_p_states(&self) -> &[(usize, f64)] {
        &self.const_p
    }

    pub fn const_q_states(&self) -> &[(usize, f64)] {
        &self.const_q
    }

    /// Learnable transitions grouped by source state.
    pub fn learn_a_rows(&self) -> RowGroups<'_> {
        RowGroups {
            cells: &self.learn_a,
        }
    }

    /// Learnable emissions grouped by state.
    pub fn learn_b_rows(&self) -> RowGroups<'_> {
        RowGroups {
            cells: &self.learn_b,
        }
    }

    pub fn is_learnable_a(&self, i: usize, j: usize) -> bool {
        self.learn_a.contains(&(i, j))
    }

    pub fn is_learnable_b(&self, i: usize, k: usize) -> bool {
        self.learn_b.contains(&(i, k))
    }

    /// Whether nothing at all is learnable.
    pub fn is_frozen(&self) -> bool {
        self.learn_a.is_empty()
            && self.learn_b.is_empty()
            && self.learn_p.is_empty()
            && self.learn_q.is_empty()
    }
}

/// Iterator over `(row, cells)` groups of a row-sorted cell list.
#[derive(Debug, Clone)]
pub struct RowGroups<'a> {
    cells: &'a [(usize, usize)],
}

impl<'a> Iterator for RowGroups<'a> {
    type Item = (usize, &'a [(usize, usize)]);

    fn next(&mut self) -> Option<Self::Item> {
        let &(row, _) = self.cells.first()?;
        let end = self
            .cells
            .iter()
            .position(|&(r, _)| r != row)
            .unwrap_or(self.cells.len());
        let (group, rest) = self.cells.split_at(end);
        self.cells = rest;
        Some((row, group))
    }
}

fn check_indices(
    list: &str,
    indices: impl Iterator<Item = usize>,
    bound: usize,
) -> Result<()> {
    for (k, i) in indices.enumerate() {
        if i >= bound {
            return Err(CyaneaError::MalformedDefinitions(format!(
                "{list}({k}) = {i} is out of range (bound {bound})"
            )));
        }
    }
    Ok(())
}

fn check_pairs(
    list: &str,
    pairs: impl Iterator<Item = (usize, usize)>,
    rows: usize,
    cols: usize,
) -> Result<()> {
    for (k, (i, j)) in pairs.enumerate() {
        if i >= rows {
            return Err(CyaneaError::MalformedDefinitions(format!(
                "{list}({k},0) = {i} is out of range (bound {rows})"
            )));
        }
        if j >= cols {
            return Err(CyaneaError::MalformedDefinitions(format!(
                "{list}({k},1) = {j} is out of range (bound {cols})"
            )));
        }
    }
    Ok(())
}
