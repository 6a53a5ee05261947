//! Per-sequence fan-out over a fixed-size worker pool.
//!
//! Observation sequences are independent given a frozen parameter snapshot,
//! so every E-step and every batch evaluation is a map-reduce over sequence
//! indices. Each worker folds into its own [`Workspace`] and its own partial
//! accumulator; partials are merged only after every task has finished.
//!
//! With the `parallel` feature disabled, or `parallelism <= 1`, the same fold
//! runs sequentially on the calling thread.

#[cfg(feature = "parallel")]
use cyanea_core::CyaneaError;
use cyanea_core::{ObservationSet, Result};
use tracing::debug;

use crate::inference::{forward_likelihood, viterbi_path, Workspace};
use crate::params::ParameterStore;

/// Fan-out executor sized by `HmmConfig::parallelism`.
pub struct Dispatcher {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threads", &self.threads)
            .finish()
    }
}

impl Dispatcher {
    /// Build a dispatcher with `parallelism` workers.
    ///
    /// # Errors
    ///
    /// [`CyaneaError::Other`](cyanea_core::CyaneaError::Other) if the thread
    /// pool cannot be created.
    pub fn new(parallelism: usize) -> Result<Self> {
        let threads = parallelism.max(1);

        #[cfg(feature = "parallel")]
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("cyanea-hmm-{i}"))
                .build()
                .map_err(|e| CyaneaError::Other(format!("failed to build worker pool: {e}")))?;
            debug!(threads, "worker pool created");
            Some(pool)
        } else {
            None
        };

        #[cfg(not(feature = "parallel"))]
        if threads > 1 {
            debug!(
                threads,
                "parallel feature disabled, running sequentially"
            );
        }

        Ok(Self {
            threads,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    /// A dispatcher that always runs on the calling thread.
    pub fn sequential() -> Self {
        Self {
            threads: 1,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Configured worker count.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Fold every task index in `0..tasks` into an accumulator and merge the
    /// per-worker partials.
    ///
    /// `fold` receives the worker's scratch [`Workspace`], its running
    /// accumulator and the task index. The result is independent of the
    /// number of workers up to floating-point reassociation in `merge`.
    pub fn map_reduce<A, I, F, M>(
        &self,
        tasks: usize,
        n_states: usize,
        identity: I,
        fold: F,
        merge: M,
    ) -> A
    where
        A: Send,
        I: Fn() -> A + Sync + Send,
        F: Fn(&mut Workspace, A, usize) -> A + Sync + Send,
        M: Fn(A, A) -> A + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            use rayon::prelude::*;
            return pool.install(|| {
                (0..tasks)
                    .into_par_iter()
                    .fold(
                        || (Workspace::new(n_states), identity()),
                        |(mut ws, acc), d| {
                            let acc = fold(&mut ws, acc, d);
                            (ws, acc)
                        },
                    )
                    .map(|(_, acc)| acc)
                    .reduce(&identity, &merge)
            });
        }

        let mut ws = Workspace::new(n_states);
        let acc = (0..tasks).fold(identity(), |acc, d| fold(&mut ws, acc, d));
        merge(identity(), acc)
    }
}

// ---------------------------------------------------------------------------
// Batch evaluation
// ---------------------------------------------------------------------------

/// Mean per-sequence forward log-likelihood of `obs` under `params`.
///
/// A single impossible sequence makes the mean negative infinity. `obs`
/// must already have passed [`validate_observations`](crate::observations::validate_observations).
pub(crate) fn mean_log_likelihood(
    dispatcher: &Dispatcher,
    params: &ParameterStore,
    obs: &(dyn ObservationSet + Send + Sync),
) -> f64 {
    let d = obs.num_sequences();
    if d == 0 {
        return f64::NEG_INFINITY;
    }
    params.graph();
    let total = dispatcher.map_reduce(
        d,
        params.n_states(),
        || 0.0,
        |ws, acc, dim| acc + forward_likelihood(params, obs, dim, ws),
        |a, b| a + b,
    );
    total / d as f64
}

/// Mean per-sequence best-path log-probability of `obs` under `params`.
pub(crate) fn mean_best_path(
    dispatcher: &Dispatcher,
    params: &ParameterStore,
    obs: &(dyn ObservationSet + Send + Sync),
) -> f64 {
    let d = obs.num_sequences();
    if d == 0 {
        return f64::NEG_INFINITY;
    }
    params.graph();
    let total = dispatcher.map_reduce(
        d,
        params.n_states(),
        || 0.0,
        |ws, acc, dim| {
            let mut path = std::mem::take(&mut ws.path);
            let score = viterbi_path(params, obs, dim, ws, &mut path);
            ws.path = path;
            acc + score
        },
        |a, b| a + b,
    );
    total / d as f64
}
