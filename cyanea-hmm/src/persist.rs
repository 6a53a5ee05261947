//! JSON model documents.
//!
//! Parameters are stored as plain probabilities with `a` and `b` as nested
//! rows, so documents are easy to edit by hand. Definitions travel alongside
//! when present.

use std::path::Path;

use cyanea_core::{CyaneaError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::HmmConfig;
use crate::hmm::Hmm;
use crate::model::Model;
use crate::params::ParameterStore;

/// Serialized form of a parameter store and its optional definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub n_states: usize,
    pub n_symbols: usize,
    pub initial: Vec<f64>,
    pub terminal: Vec<f64>,
    pub transitions: Vec<Vec<f64>>,
    pub emissions: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions: Option<Model>,
}

impl ModelDocument {
    /// Snapshot `params` in probability space.
    pub fn from_params(params: &ParameterStore, definitions: Option<&Model>) -> Self {
        let n = params.n_states();
        let m = params.n_symbols();
        let prob = |v: &f64| if params.is_log_space() { v.exp() } else { *v };
        Self {
            n_states: n,
            n_symbols: m,
            initial: params.log_p().iter().map(prob).collect(),
            terminal: params.log_q().iter().map(prob).collect(),
            transitions: params
                .log_a()
                .chunks(n)
                .map(|row| row.iter().map(prob).collect())
                .collect(),
            emissions: params
                .log_b()
                .chunks(m)
                .map(|row| row.iter().map(prob).collect())
                .collect(),
            definitions: definitions.cloned(),
        }
    }

    /// Rebuild the parameter store and validate the definitions against it.
    ///
    /// # Errors
    ///
    /// - [`CyaneaError::DimensionMismatch`] if a row count or row length does
    ///   not match the declared dimensions.
    /// - Any error of [`ParameterStore::from_probabilities`] or
    ///   [`Model::finalize`].
    pub fn into_params(self) -> Result<(ParameterStore, Option<Model>)> {
        let n = self.n_states;
        let m = self.n_symbols;
        let a = flatten("a", self.transitions, n, n)?;
        let b = flatten("b", self.emissions, n, m)?;
        let params = ParameterStore::from_probabilities(n, m, self.initial, self.terminal, a, b)?;
        let definitions = self.definitions.map(|d| d.finalize(n, m)).transpose()?;
        Ok((params, definitions))
    }
}

fn flatten(tensor: &'static str, rows: Vec<Vec<f64>>, n_rows: usize, width: usize) -> Result<Vec<f64>> {
    if rows.len() != n_rows {
        return Err(CyaneaError::DimensionMismatch {
            tensor,
            expected: n_rows,
            actual: rows.len(),
        });
    }
    let mut flat = Vec::with_capacity(n_rows * width);
    for row in rows {
        if row.len() != width {
            return Err(CyaneaError::DimensionMismatch {
                tensor,
                expected: width,
                actual: row.len(),
            });
        }
        flat.extend(row);
    }
    Ok(flat)
}

/// Serialize parameters and definitions to pretty-printed JSON.
///
/// # Errors
///
/// [`CyaneaError::Other`] if serialization fails.
pub fn to_json(params: &ParameterStore, definitions: Option<&Model>) -> Result<String> {
    serde_json::to_string_pretty(&ModelDocument::from_params(params, definitions))
        .map_err(|e| CyaneaError::Other(format!("failed to serialize model: {e}")))
}

/// Parse a JSON model document.
///
/// # Errors
///
/// [`CyaneaError::Parse`] for malformed JSON, otherwise see
/// [`ModelDocument::into_params`].
pub fn from_json(json: &str) -> Result<(ParameterStore, Option<Model>)> {
    let doc: ModelDocument =
        serde_json::from_str(json).map_err(|e| CyaneaError::Parse(format!("model document: {e}")))?;
    doc.into_params()
}

/// Write a model document to `path`.
///
/// # Errors
///
/// [`CyaneaError::Io`] if the file cannot be written.
pub fn save(path: impl AsRef<Path>, params: &ParameterStore, definitions: Option<&Model>) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, to_json(params, definitions)?)?;
    info!(path = %path.display(), states = params.n_states(), "model saved");
    Ok(())
}

/// Read a model document from `path`.
///
/// # Errors
///
/// [`CyaneaError::Io`] if the file cannot be read, otherwise see
/// [`from_json`].
pub fn load(path: impl AsRef<Path>) -> Result<(ParameterStore, Option<Model>)> {
    let path = path.as_ref();
    let loaded = from_json(&std::fs::read_to_string(path)?)?;
    info!(path = %path.display(), states = loaded.0.n_states(), "model loaded");
    Ok(loaded)
}

impl Hmm {
    /// Save parameters and definitions as JSON.
    ///
    /// # Errors
    ///
    /// See [`save`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save(path, self.params(), self.definitions())
    }

    /// Load a model saved with [`Hmm::save`].
    ///
    /// # Errors
    ///
    /// See [`load`] and [`Hmm::new`].
    pub fn load(path: impl AsRef<Path>, config: HmmConfig) -> Result<Self> {
        let (params, definitions) = load(path)?;
        let mut hmm = Hmm::new(params, config)?;
        if let Some(model) = definitions {
            hmm.set_definitions(model)?;
        }
        Ok(hmm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParameterStore {
        ParameterStore::from_probabilities(
            2,
            3,
            vec![0.25, 0.75],
            vec![0.1, 0.0],
            vec![0.6, 0.3, 0.0, 1.0],
            vec![0.2, 0.3, 0.5, 0.0, 0.5, 0.5],
        )
        .unwrap()
    }

    #[test]
    fn document_is_in_probability_space() {
        let doc = ModelDocument::from_params(&sample(), None);
        assert_eq!(doc.transitions.len(), 2);
        assert_eq!(doc.emissions[1].len(), 3);
        assert!((doc.initial[1] - 0.75).abs() < 1e-12);
        assert_eq!(doc.transitions[1][0], 0.0);
        assert!(doc.definitions.is_none());
    }

    #[test]
    fn json_preserves_parameters_and_definitions() {
        let params = sample();
        let model = Model::new().learn_a(0, 1).learn_a(0, 0).const_q(1, 0.0);
        let json = to_json(&params, Some(&model)).unwrap();
        let (back, defs) = from_json(&json).unwrap();
        for (x, y) in params.log_b().iter().zip(back.log_b()) {
            assert!(x == y || (x - y).abs() < 1e-12);
        }
        assert_eq!(back.a(1, 0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(defs.unwrap().learn_a_cells(), &[(0, 0), (0, 1)]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let mut doc = ModelDocument::from_params(&sample(), None);
        doc.emissions[0].pop();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(matches!(
            from_json(&json),
            Err(CyaneaError::DimensionMismatch { tensor: "b", expected: 3, actual: 2 })
        ));
        assert!(matches!(from_json("{ not json"), Err(CyaneaError::Parse(_))));
    }

    #[test]
    fn definitions_are_validated_on_load() {
        let mut doc = ModelDocument::from_params(&sample(), None);
        doc.definitions = Some(Model::new().learn_b(0, 7));
        assert!(matches!(
            doc.into_params(),
            Err(CyaneaError::MalformedDefinitions(_))
        ));
    }

    #[test]
    fn hmm_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut hmm = Hmm::new(sample(), HmmConfig::default()).unwrap();
        hmm.set_definitions(Model::new().learn_p(0).learn_p(1)).unwrap();
        hmm.save(&path).unwrap();

        let loaded = Hmm::load(&path, HmmConfig::default()).unwrap();
        assert_eq!(loaded.params().n_symbols(), 3);
        assert_eq!(loaded.definitions().unwrap().learn_p_states(), &[0, 1]);
        assert!((loaded.params().p(0).unwrap() - 0.25_f64.ln()).abs() < 1e-12);

        assert!(matches!(
            Hmm::load(dir.path().join("missing.json"), HmmConfig::default()),
            Err(CyaneaError::Io(_))
        ));
    }
}
