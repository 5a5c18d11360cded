//! Parametric model artifact: JSON-encoded logistic-regression weights next
//! to a metadata file.
//!
//! Layout of the artifact directory:
//!   weights.json   — coefficients, intercept, scaler mean/scale
//!   metadata.json  — model_version, feature_order, feature_defaults,
//!                    band_thresholds, params_hash, training metrics
//!
//! The loader refuses artifacts whose `feature_order` differs from the
//! pipeline contract or whose `params_hash` does not match the canonical
//! hash of weights.json.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rsk_features::{Features, FEATURE_ORDER};
use rsk_schemas::{payload_hash, RiskBand};

use crate::{top_k_contributions, ModelError, Prediction, ScoreError, Scorer, ScoringInput};

pub const WEIGHTS_FILE: &str = "weights.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    pub coefficients: BTreeMap<String, f64>,
    pub intercept: f64,
    pub scaler_mean: BTreeMap<String, f64>,
    pub scaler_scale: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandThresholds {
    pub low: f64,
    pub med: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_version: String,
    pub created_at: String,
    pub feature_order: Vec<String>,
    pub feature_defaults: BTreeMap<String, f64>,
    pub band_thresholds: BandThresholds,
    pub params_hash: String,
    pub coefficients: BTreeMap<String, f64>,
    pub intercept: f64,
    pub scaler_mean: BTreeMap<String, f64>,
    pub scaler_scale: BTreeMap<String, f64>,
    #[serde(default)]
    pub metrics: Value,
}

#[derive(Debug)]
pub struct ParametricModel {
    metadata: ModelMetadata,
    weights: ModelWeights,
}

impl ParametricModel {
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let weights_path = dir.join(WEIGHTS_FILE);
        let metadata_path = dir.join(METADATA_FILE);

        let weights_raw = fs::read_to_string(&weights_path).map_err(|e| {
            ModelError::Artifact(format!("read {} failed: {e}", weights_path.display()))
        })?;
        let metadata_raw = fs::read_to_string(&metadata_path).map_err(|e| {
            ModelError::Artifact(format!("read {} failed: {e}", metadata_path.display()))
        })?;

        let weights_value: Value = serde_json::from_str(&weights_raw)
            .map_err(|e| ModelError::Metadata(format!("weights.json: {e}")))?;
        let weights: ModelWeights = serde_json::from_value(weights_value.clone())
            .map_err(|e| ModelError::Metadata(format!("weights.json: {e}")))?;
        let metadata: ModelMetadata = serde_json::from_str(&metadata_raw)
            .map_err(|e| ModelError::Metadata(format!("metadata.json: {e}")))?;

        let computed = payload_hash(&weights_value);
        if computed != metadata.params_hash {
            return Err(ModelError::ParamsHashMismatch {
                expected: metadata.params_hash,
                computed,
            });
        }

        if metadata.feature_order != FEATURE_ORDER {
            return Err(ModelError::FeatureOrderMismatch {
                expected: FEATURE_ORDER.iter().map(|s| s.to_string()).collect(),
                found: metadata.feature_order,
            });
        }

        Ok(Self { metadata, weights })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Feature vector in metadata order, falling back to the artifact's
    /// defaults for anything the extractor did not produce.
    fn prepare(&self, features: &Features) -> Vec<f64> {
        self.metadata
            .feature_order
            .iter()
            .map(|name| {
                features.get(name).unwrap_or_else(|| {
                    self.metadata
                        .feature_defaults
                        .get(name)
                        .copied()
                        .unwrap_or(0.0)
                })
            })
            .collect()
    }

    fn standardize(&self, name: &str, value: f64) -> f64 {
        let mean = self.weights.scaler_mean.get(name).copied().unwrap_or(0.0);
        let scale = self.weights.scaler_scale.get(name).copied().unwrap_or(1.0);
        let scale = if scale == 0.0 { 1.0 } else { scale };
        (value - mean) / scale
    }

    fn band_of(&self, score: f64) -> RiskBand {
        let t = self.metadata.band_thresholds;
        if score < t.low {
            RiskBand::Low
        } else if score < t.med {
            RiskBand::Med
        } else {
            RiskBand::High
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl Scorer for ParametricModel {
    fn predict(&self, input: &ScoringInput<'_>) -> Result<Prediction, ScoreError> {
        let vector = self.prepare(input.features);

        let mut z = self.weights.intercept;
        let mut contributions = Vec::with_capacity(vector.len());
        for (name, value) in self.metadata.feature_order.iter().zip(vector) {
            let coef = self.weights.coefficients.get(name).copied().ok_or_else(|| {
                ScoreError::Invalid(format!("no coefficient for feature {name}"))
            })?;
            let scaled = self.standardize(name, value);
            z += coef * scaled;
            contributions.push((name.clone(), coef * scaled));
        }

        let score = sigmoid(z);
        Ok(Prediction {
            score,
            band: self.band_of(score),
            top_features: top_k_contributions(contributions, 3),
            model_version: self.metadata.model_version.clone(),
        })
    }

    fn model_version(&self) -> &str {
        &self.metadata.model_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsk_schemas::payload_hash;
    use serde_json::json;
    use std::path::PathBuf;

    fn feature_map(v: f64) -> BTreeMap<String, f64> {
        FEATURE_ORDER.iter().map(|n| (n.to_string(), v)).collect()
    }

    fn write_artifact(
        dir: &Path,
        coefficients: BTreeMap<String, f64>,
        intercept: f64,
        tamper_hash: bool,
        feature_order: Vec<String>,
    ) -> PathBuf {
        let weights = json!({
            "coefficients": coefficients,
            "intercept": intercept,
            "scaler_mean": feature_map(0.0),
            "scaler_scale": feature_map(1.0),
        });
        let params_hash = if tamper_hash {
            "0".repeat(64)
        } else {
            payload_hash(&weights)
        };
        let metadata = json!({
            "model_version": "risk-lr-1",
            "created_at": "2024-01-15T00:00:00Z",
            "feature_order": feature_order,
            "feature_defaults": feature_map(0.0),
            "band_thresholds": {"low": 0.33, "med": 0.66},
            "params_hash": params_hash,
            "coefficients": weights["coefficients"],
            "intercept": intercept,
            "scaler_mean": weights["scaler_mean"],
            "scaler_scale": weights["scaler_scale"],
            "metrics": {"auc": 0.9},
        });
        std::fs::write(
            dir.join(WEIGHTS_FILE),
            serde_json::to_string_pretty(&weights).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata).unwrap(),
        )
        .unwrap();
        dir.to_path_buf()
    }

    fn contract_order() -> Vec<String> {
        FEATURE_ORDER.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn zero_weights_score_one_half() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), feature_map(0.0), 0.0, false, contract_order());
        let model = ParametricModel::load(dir.path()).unwrap();

        let features = Features::default();
        let p = model
            .predict(&ScoringInput {
                user_id: "u1",
                event_type: rsk_schemas::EventType::Signup,
                features: &features,
            })
            .unwrap();
        assert!((p.score - 0.5).abs() < 1e-12);
        assert_eq!(p.band, RiskBand::Med);
        assert_eq!(p.model_version, "risk-lr-1");
    }

    #[test]
    fn logistic_math_matches_hand_computation() {
        let dir = tempfile::tempdir().unwrap();
        let mut coefficients = feature_map(0.0);
        coefficients.insert("txn_count_24h".to_string(), 2.0);
        write_artifact(dir.path(), coefficients, -1.0, false, contract_order());
        let model = ParametricModel::load(dir.path()).unwrap();

        let features = Features {
            txn_count_24h: 3.0,
            ..Features::default()
        };
        let p = model
            .predict(&ScoringInput {
                user_id: "u1",
                event_type: rsk_schemas::EventType::Transaction,
                features: &features,
            })
            .unwrap();

        // z = 2.0 * 3.0 - 1.0 = 5.0
        let expected = 1.0 / (1.0 + (-5.0_f64).exp());
        assert!((p.score - expected).abs() < 1e-12);
        assert_eq!(p.band, RiskBand::High);
        assert_eq!(p.top_features[0].0, "txn_count_24h");
        assert_eq!(p.top_features[0].1, 6.0);
    }

    #[test]
    fn rejects_params_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), feature_map(0.1), 0.0, true, contract_order());
        match ParametricModel::load(dir.path()) {
            Err(ModelError::ParamsHashMismatch { .. }) => {}
            other => panic!("expected ParamsHashMismatch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_foreign_feature_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut order = contract_order();
        order.swap(0, 1);
        write_artifact(dir.path(), feature_map(0.1), 0.0, false, order);
        match ParametricModel::load(dir.path()) {
            Err(ModelError::FeatureOrderMismatch { .. }) => {}
            other => panic!("expected FeatureOrderMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_artifact_reports_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        match ParametricModel::load(dir.path()) {
            Err(ModelError::Artifact(_)) => {}
            other => panic!("expected Artifact error, got {other:?}"),
        }
    }

    #[test]
    fn zero_scale_does_not_divide_by_zero() {
        let dir = tempfile::tempdir().unwrap();
        let weights = json!({
            "coefficients": feature_map(1.0),
            "intercept": 0.0,
            "scaler_mean": feature_map(0.0),
            "scaler_scale": feature_map(0.0),
        });
        let metadata = json!({
            "model_version": "risk-lr-1",
            "created_at": "2024-01-15T00:00:00Z",
            "feature_order": contract_order(),
            "feature_defaults": feature_map(0.0),
            "band_thresholds": {"low": 0.33, "med": 0.66},
            "params_hash": payload_hash(&weights),
            "coefficients": weights["coefficients"],
            "intercept": 0.0,
            "scaler_mean": weights["scaler_mean"],
            "scaler_scale": weights["scaler_scale"],
        });
        std::fs::write(
            dir.path().join(WEIGHTS_FILE),
            serde_json::to_string(&weights).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        let model = ParametricModel::load(dir.path()).unwrap();
        let features = Features {
            txn_count_24h: 2.0,
            ..Features::default()
        };
        let p = model
            .predict(&ScoringInput {
                user_id: "u1",
                event_type: rsk_schemas::EventType::Signup,
                features: &features,
            })
            .unwrap();
        assert!(p.score.is_finite());
    }

    #[test]
    fn metadata_band_thresholds_govern_banding() {
        let dir = tempfile::tempdir().unwrap();
        let weights = json!({
            "coefficients": feature_map(0.0),
            "intercept": 0.0,
            "scaler_mean": feature_map(0.0),
            "scaler_scale": feature_map(1.0),
        });
        let metadata = json!({
            "model_version": "risk-lr-1",
            "created_at": "2024-01-15T00:00:00Z",
            "feature_order": contract_order(),
            "feature_defaults": feature_map(0.0),
            // Custom thresholds push 0.5 into the low band.
            "band_thresholds": {"low": 0.6, "med": 0.8},
            "params_hash": payload_hash(&weights),
            "coefficients": weights["coefficients"],
            "intercept": 0.0,
            "scaler_mean": weights["scaler_mean"],
            "scaler_scale": weights["scaler_scale"],
        });
        std::fs::write(
            dir.path().join(WEIGHTS_FILE),
            serde_json::to_string(&weights).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        let model = ParametricModel::load(dir.path()).unwrap();
        let features = Features::default();
        let p = model
            .predict(&ScoringInput {
                user_id: "u1",
                event_type: rsk_schemas::EventType::Signup,
                features: &features,
            })
            .unwrap();
        assert_eq!(p.band, RiskBand::Low);
    }
}
