//! Structured error types for the Cyanea ecosystem.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error)]
pub enum CyaneaError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A model dimension (number of states or symbols) is zero.
    #[error("invalid dimension: {what} must be > 0")]
    InvalidDimension {
        /// Which dimension was rejected, `"N"` (states) or `"M"` (symbols).
        what: &'static str,
    },

    /// An index into a parameter tensor or observation set is out of range.
    #[error("index out of range: {tensor}[{index}] (bound {bound})")]
    IndexOutOfRange {
        /// The tensor or collection being indexed (`"a"`, `"b"`, `"dimension"`, ...).
        tensor: &'static str,
        /// The offending index.
        index: usize,
        /// The exclusive upper bound.
        bound: usize,
    },

    /// Inference was requested before any observations were bound.
    #[error("no observations bound")]
    NoObservations,

    /// An observation symbol does not fit the model alphabet.
    #[error(
        "symbol {symbol} at sequence {dimension}, position {position} is out of range (n_symbols = {n_symbols})"
    )]
    SymbolOutOfRange {
        dimension: usize,
        position: usize,
        symbol: usize,
        n_symbols: usize,
    },

    /// A parameter tensor has a shape inconsistent with the declared dimensions.
    #[error("dimension mismatch for {tensor}: expected {expected}, got {actual}")]
    DimensionMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Parameter definitions reference states or symbols outside the model.
    #[error("malformed definitions: {0}")]
    MalformedDefinitions(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_names_tensor() {
        let err = CyaneaError::IndexOutOfRange {
            tensor: "b",
            index: 7,
            bound: 4,
        };
        assert_eq!(err.to_string(), "index out of range: b[7] (bound 4)");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CyaneaError = io.into();
        assert!(matches!(err, CyaneaError::Io(_)));
    }
}
