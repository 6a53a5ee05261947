//! Log-space probability arithmetic for numerically stable computation.
//!
//! [`LogProb`] represents probabilities as natural logarithms. The free
//! functions [`log_sum_exp`] and [`log_sum_exp_slice`] are the log-space
//! equivalent of addition and are what dynamic-programming kernels use in
//! their inner loops.

use crate::{CyaneaError, Result};

/// Log value treated as "effectively impossible" when deciding whether a
/// parameter carries mass. Anything at or below it is negligible.
pub const ALMOST_NEG_INFINITY: f64 = -1000.0;

/// Numerically stable `ln(exp(a) + exp(b))`.
///
/// Either argument may be negative infinity.
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (max, min) = if a >= b { (a, b) } else { (b, a) };
    max + (min - max).exp().ln_1p()
}

/// Log-sum-exp over a slice. Empty slices and all-`-inf` slices yield `-inf`.
pub fn log_sum_exp_slice(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// A probability stored as its natural logarithm: `ln(p)`.
///
/// Negative infinity represents impossibility (p = 0) and 0.0 certainty.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LogProb(pub f64);

impl LogProb {
    /// Create a [`LogProb`] from a raw probability in `[0, 1]`.
    ///
    /// Exact zero maps to negative infinity.
    ///
    /// # Errors
    ///
    /// Returns an error if `p` is not in `[0, 1]`.
    pub fn from_prob(p: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(CyaneaError::InvalidInput(format!(
                "LogProb::from_prob: p must be in [0, 1], got {p}"
            )));
        }
        Self::from_weight(p)
    }

    /// Create a [`LogProb`] from a non-negative, possibly unnormalized weight.
    ///
    /// # Errors
    ///
    /// Returns an error if `w` is negative, NaN or infinite.
    pub fn from_weight(w: f64) -> Result<Self> {
        if !w.is_finite() || w < 0.0 {
            return Err(CyaneaError::InvalidInput(format!(
                "LogProb::from_weight: weight must be finite and >= 0, got {w}"
            )));
        }
        if w == 0.0 {
            Ok(Self::impossible())
        } else {
            Ok(Self(w.ln()))
        }
    }

    /// Convert back to a raw probability.
    pub fn to_prob(self) -> f64 {
        self.0.exp()
    }

    /// Log-space addition: `ln(exp(self) + exp(other))`.
    pub fn ln_add(self, other: Self) -> Self {
        Self(log_sum_exp(self.0, other.0))
    }

    /// Log-space multiplication (addition of log values).
    pub fn ln_mul(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }

    /// Whether this value carries more than negligible mass.
    pub fn is_significant(self) -> bool {
        self.0 > ALMOST_NEG_INFINITY
    }

    /// Certain event: `ln(1) = 0`.
    pub const fn certain() -> Self {
        Self(0.0)
    }

    /// Impossible event: `ln(0) = -∞`.
    pub const fn impossible() -> Self {
        Self(f64::NEG_INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn logprob_from_prob_half() {
        let lp = LogProb::from_prob(0.5).unwrap();
        assert!((lp.0 - 0.5_f64.ln()).abs() < TOL);
    }

    #[test]
    fn logprob_zero_is_impossible() {
        let lp = LogProb::from_prob(0.0).unwrap();
        assert_eq!(lp.0, f64::NEG_INFINITY);
        assert_eq!(lp.to_prob(), 0.0);
        assert!(!lp.is_significant());
    }

    #[test]
    fn logprob_invalid() {
        assert!(LogProb::from_prob(-0.5).is_err());
        assert!(LogProb::from_prob(1.5).is_err());
        assert!(LogProb::from_weight(f64::NAN).is_err());
        assert!(LogProb::from_weight(-1.0).is_err());
    }

    #[test]
    fn logprob_weight_above_one() {
        let lp = LogProb::from_weight(3.0).unwrap();
        assert!((lp.0 - 3.0_f64.ln()).abs() < TOL);
    }

    #[test]
    fn logprob_ln_add_and_mul() {
        let a = LogProb::from_prob(0.3).unwrap();
        let b = LogProb::from_prob(0.2).unwrap();
        assert!((a.ln_add(b).to_prob() - 0.5).abs() < TOL);
        assert!((a.ln_mul(b).to_prob() - 0.06).abs() < TOL);
        assert!((a.ln_add(LogProb::impossible()).to_prob() - 0.3).abs() < TOL);
    }

    #[test]
    fn log_sum_exp_numerical_stability() {
        let result = log_sum_exp(-1000.0, -1001.0);
        assert!(result.is_finite());
        assert!(result >= -1000.0);
        assert!(result < -999.0);

        let r2 = log_sum_exp(0.0, 0.0);
        assert!((r2 - 2.0_f64.ln()).abs() < 1e-12);

        assert_eq!(log_sum_exp(f64::NEG_INFINITY, 5.0), 5.0);
        assert_eq!(log_sum_exp(5.0, f64::NEG_INFINITY), 5.0);
        assert_eq!(
            log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );

        let big = log_sum_exp(700.0, 700.0);
        assert!((big - (700.0 + 2.0_f64.ln())).abs() < 1e-10);
    }

    #[test]
    fn log_sum_exp_slice_matches_pairwise() {
        let xs = [-1.0, -2.5, -0.3, f64::NEG_INFINITY];
        let pairwise = xs.iter().fold(f64::NEG_INFINITY, |acc, &x| log_sum_exp(acc, x));
        assert!((log_sum_exp_slice(&xs) - pairwise).abs() < 1e-12);
        assert_eq!(log_sum_exp_slice(&[]), f64::NEG_INFINITY);
        assert_eq!(
            log_sum_exp_slice(&[f64::NEG_INFINITY; 3]),
            f64::NEG_INFINITY
        );
    }
}
