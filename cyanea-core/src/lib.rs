//! Shared primitives, traits, and utilities for the Cyanea bioinformatics ecosystem.
//!
//! `cyanea-core` provides the foundation that all other Cyanea crates build on:
//!
//! - **Error types**: [`CyaneaError`] and [`Result`] for structured error handling
//! - **Traits**: Core abstractions like [`ObservationSet`], [`ContentAddressable`], [`Summarizable`]
//! - **Log-space probabilities**: [`LogProb`] and log-sum-exp helpers
//! - **Hashing**: SHA-256 content addressing for data integrity

pub mod error;
pub mod hash;
pub mod prob;
pub mod traits;

pub use error::{CyaneaError, Result};
pub use prob::{log_sum_exp, log_sum_exp_slice, LogProb, ALMOST_NEG_INFINITY};
pub use traits::*;
