//! Discrete hidden Markov models for the Cyanea bioinformatics ecosystem.
//!
//! An `N`-state model over an `M`-symbol alphabet with initial (`p`),
//! terminal (`q`), transition (`a`) and emission (`b`) probabilities, all
//! held as natural logarithms.
//!
//! - **Parameters**: [`ParameterStore`] with normalization, random or
//!   constrained initialization, pruning and model composition
//! - **Definitions**: [`Model`] marks which cells training may change and
//!   which are held constant
//! - **Inference**: forward, backward and Viterbi recurrences over a sparse
//!   [`TransitionGraph`], with an [`AlphaBetaCache`] of per-sequence tables
//! - **Training**: Baum-Welch (full, transitions-only, constrained) and
//!   Viterbi training with [`Convergence`] detection and cancellation
//! - **Parallelism**: per-sequence map-reduce on a rayon worker pool
//!   (`parallel` feature, on by default)
//! - **Persistence**: JSON model documents (`serde` feature)
//!
//! Most callers work through [`Hmm`], which binds an observation set and
//! answers queries from the cache.

pub mod cache;
pub mod config;
pub mod graph;
pub mod hmm;
pub mod inference;
pub mod model;
pub mod observations;
pub mod parallel;
pub mod params;
#[cfg(feature = "serde")]
pub mod persist;
pub mod train;

pub use cache::{AlphaBetaCache, CacheSlot};
pub use config::{CachePolicy, ConvergenceCriteria, HmmConfig};
pub use graph::TransitionGraph;
pub use hmm::{Hmm, SharedObservations, TimeIndex};
pub use inference::Workspace;
pub use model::Model;
pub use observations::{validate_observations, SequenceSet};
pub use parallel::Dispatcher;
pub use params::ParameterStore;
pub use train::{
    BaumWelchMode, Convergence, ConvergenceStatus, Trainer, TrainerState, TrainingReport,
    ViterbiMode,
};
