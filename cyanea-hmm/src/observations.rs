//! Observation sequences and bind-time validation.
//!
//! The engine reads observations only through the
//! [`ObservationSet`] trait. [`SequenceSet`] is the owned, in-memory
//! implementation most callers will use.

use cyanea_core::{CyaneaError, ObservationSet, Result};

/// A batch of integer-symbol sequences, one per dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequenceSet {
    sequences: Vec<Vec<u16>>,
}

impl SequenceSet {
    pub fn new(sequences: Vec<Vec<u16>>) -> Self {
        Self { sequences }
    }

    /// Tokenize text sequences against an alphabet, one symbol per byte.
    ///
    /// ```
    /// use cyanea_hmm::observations::SequenceSet;
    /// use cyanea_core::ObservationSet;
    ///
    /// let set = SequenceSet::from_text(b"ACGT", &["ACGA", "TT"]).unwrap();
    /// assert_eq!(set.symbol_at(0, 3), 0);
    /// assert_eq!(set.length_of(1), 2);
    /// ```
    ///
    /// # Errors
    ///
    /// [`CyaneaError::Parse`] if a byte is not in `alphabet`.
    pub fn from_text<S: AsRef<[u8]>>(alphabet: &[u8], texts: &[S]) -> Result<Self> {
        let mut sequences = Vec::with_capacity(texts.len());
        for (dim, text) in texts.iter().enumerate() {
            let seq = text
                .as_ref()
                .iter()
                .enumerate()
                .map(|(t, byte)| {
                    alphabet
                        .iter()
                        .position(|a| a == byte)
                        .map(|k| k as u16)
                        .ok_or_else(|| {
                            CyaneaError::Parse(format!(
                                "sequence {dim}, position {t}: byte {:?} not in alphabet",
                                *byte as char
                            ))
                        })
                })
                .collect::<Result<Vec<u16>>>()?;
            sequences.push(seq);
        }
        Ok(Self { sequences })
    }

    pub fn push(&mut self, sequence: Vec<u16>) {
        self.sequences.push(sequence);
    }

    pub fn sequence(&self, dim: usize) -> &[u16] {
        &self.sequences[dim]
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl FromIterator<Vec<u16>> for SequenceSet {
    fn from_iter<I: IntoIterator<Item = Vec<u16>>>(iter: I) -> Self {
        Self {
            sequences: iter.into_iter().collect(),
        }
    }
}

impl ObservationSet for SequenceSet {
    fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    fn length_of(&self, dim: usize) -> usize {
        self.sequences[dim].len()
    }

    #[inline]
    fn symbol_at(&self, dim: usize, t: usize) -> usize {
        self.sequences[dim][t] as usize
    }
}

/// Check that `obs` can be evaluated by a model with `n_symbols` symbols.
///
/// # Errors
///
/// - [`CyaneaError::NoObservations`] if the set holds no sequences.
/// - [`CyaneaError::InvalidInput`] if any sequence is empty.
/// - [`CyaneaError::SymbolOutOfRange`] for the first symbol `>= n_symbols`.
pub fn validate_observations(obs: &dyn ObservationSet, n_symbols: usize) -> Result<()> {
    if obs.num_sequences() == 0 {
        return Err(CyaneaError::NoObservations);
    }
    for dim in 0..obs.num_sequences() {
        let len = obs.length_of(dim);
        if len == 0 {
            return Err(CyaneaError::InvalidInput(format!(
                "observation sequence {dim} is empty"
            )));
        }
        for t in 0..len {
            let symbol = obs.symbol_at(dim, t);
            if symbol >= n_symbols {
                return Err(CyaneaError::SymbolOutOfRange {
                    dimension: dim,
                    position: t,
                    symbol,
                    n_symbols,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_set_passes() {
        let set = SequenceSet::new(vec![vec![0, 1, 1], vec![1]]);
        assert!(validate_observations(&set, 2).is_ok());
        assert_eq!(set.max_length(), 3);
        assert_eq!(set.total_length(), 4);
    }

    #[test]
    fn empty_set_is_no_observations() {
        let set = SequenceSet::default();
        assert!(matches!(
            validate_observations(&set, 2),
            Err(CyaneaError::NoObservations)
        ));
    }

    #[test]
    fn empty_sequence_is_invalid() {
        let set: SequenceSet = vec![vec![0], vec![]].into_iter().collect();
        assert!(matches!(
            validate_observations(&set, 2),
            Err(CyaneaError::InvalidInput(_))
        ));
    }

    #[test]
    fn symbol_out_of_range_reports_position() {
        let set = SequenceSet::new(vec![vec![0, 1], vec![1, 0, 4]]);
        match validate_observations(&set, 2) {
            Err(CyaneaError::SymbolOutOfRange {
                dimension,
                position,
                symbol,
                n_symbols,
            }) => {
                assert_eq!((dimension, position, symbol, n_symbols), (1, 2, 4, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn from_text_rejects_unknown_bytes() {
        let err = SequenceSet::from_text(b"01", &["0110", "012"]).unwrap_err();
        assert!(err.to_string().contains("sequence 1, position 2"));
    }
}
