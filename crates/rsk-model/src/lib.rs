//! Pluggable risk scoring.
//!
//! Two implementations coexist: a parametric logistic model loaded from an
//! artifact directory, and a deterministic fallback used when no artifact
//! resolves. Both return a score in [0,1], a band, and up to three feature
//! contributions sorted by magnitude.

use std::path::Path;
use std::sync::Arc;

use rsk_features::Features;
use rsk_schemas::{EventType, RiskBand};
use tracing::{info, warn};

mod fallback;
mod parametric;

pub use fallback::{FallbackScorer, FALLBACK_MODEL_VERSION};
pub use parametric::{
    BandThresholds, ModelMetadata, ModelWeights, ParametricModel, METADATA_FILE, WEIGHTS_FILE,
};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub score: f64,
    pub band: RiskBand,
    /// Up to three `(feature, contribution)` pairs, |contribution|
    /// descending, rounded to 4 decimals.
    pub top_features: Vec<(String, f64)>,
    pub model_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub user_id: &'a str,
    pub event_type: EventType,
    pub features: &'a Features,
}

/// Scoring failure, classified for the worker's retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScoreError {
    #[error("scorer io failure: {0}")]
    Io(String),
    #[error("invalid scorer state: {0}")]
    Invalid(String),
}

impl ScoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScoreError::Io(_))
    }
}

pub trait Scorer: Send + Sync {
    fn predict(&self, input: &ScoringInput<'_>) -> Result<Prediction, ScoreError>;
    fn model_version(&self) -> &str;
}

/// Artifact loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model artifact unreadable: {0}")]
    Artifact(String),
    #[error("model metadata invalid: {0}")]
    Metadata(String),
    #[error("metadata feature_order does not match the pipeline contract: expected {expected:?}, found {found:?}")]
    FeatureOrderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("params_hash mismatch: metadata says {expected}, weights hash to {computed}")]
    ParamsHashMismatch { expected: String, computed: String },
}

/// Resolve the scorer for this process: the parametric model when the
/// artifact directory loads, otherwise the deterministic fallback. Returns
/// the parametric metadata so the worker can register the model version.
pub fn load_scorer(model_dir: &Path) -> (Arc<dyn Scorer>, Option<ModelMetadata>) {
    match ParametricModel::load(model_dir) {
        Ok(model) => {
            let metadata = model.metadata().clone();
            info!(
                model_version = %metadata.model_version,
                params_hash = %metadata.params_hash,
                "loaded parametric model"
            );
            (Arc::new(model), Some(metadata))
        }
        Err(err) => {
            warn!(
                model_dir = %model_dir.display(),
                error = %err,
                "no usable model artifact; using deterministic fallback scorer"
            );
            (Arc::new(FallbackScorer::default()), None)
        }
    }
}

/// Round to 4 decimals, the precision contributions are reported at.
pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Keep the top `k` contributions by magnitude, rounded.
pub(crate) fn top_k_contributions(
    mut contributions: Vec<(String, f64)>,
    k: usize,
) -> Vec<(String, f64)> {
    contributions.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    contributions.truncate(k);
    contributions
        .into_iter()
        .map(|(name, v)| (name, round4(v)))
        .collect()
}
