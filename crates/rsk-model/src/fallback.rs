//! Deterministic fallback scorer.
//!
//! Seeded from a SHA-256 of the user id so the same user always receives the
//! same score for a given event type; the event type nudges the base score
//! upward for riskier activity. Used whenever no model artifact resolves.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use rsk_features::FEATURE_ORDER;
use rsk_schemas::{score_to_band, EventType};

use crate::{top_k_contributions, Prediction, ScoreError, Scorer, ScoringInput};

pub const FALLBACK_MODEL_VERSION: &str = "fallback-deterministic";

#[derive(Debug, Default)]
pub struct FallbackScorer;

fn seeded_rng(user_id: &str) -> ChaCha8Rng {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    ChaCha8Rng::from_seed(seed)
}

impl Scorer for FallbackScorer {
    fn predict(&self, input: &ScoringInput<'_>) -> Result<Prediction, ScoreError> {
        let mut rng = seeded_rng(input.user_id);

        let mut score: f64 = rng.gen_range(0.1..0.5);
        match input.event_type {
            EventType::Transaction => score += rng.gen_range(0.0..0.3),
            EventType::Login => score += rng.gen_range(0.0..0.1),
            EventType::Signup => {}
        }
        let score = score.clamp(0.0, 1.0);

        let contributions: Vec<(String, f64)> = FEATURE_ORDER
            .iter()
            .map(|name| (name.to_string(), rng.gen_range(-0.1..0.2)))
            .collect();

        Ok(Prediction {
            score,
            band: score_to_band(score),
            top_features: top_k_contributions(contributions, 3),
            model_version: FALLBACK_MODEL_VERSION.to_string(),
        })
    }

    fn model_version(&self) -> &str {
        FALLBACK_MODEL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsk_features::Features;

    fn input<'a>(user_id: &'a str, event_type: EventType, features: &'a Features) -> ScoringInput<'a> {
        ScoringInput {
            user_id,
            event_type,
            features,
        }
    }

    #[test]
    fn same_user_and_type_reproduce_the_same_prediction() {
        let features = Features::default();
        let scorer = FallbackScorer;
        let a = scorer
            .predict(&input("u-123", EventType::Transaction, &features))
            .unwrap();
        let b = scorer
            .predict(&input("u-123", EventType::Transaction, &features))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn score_is_bounded_and_band_consistent() {
        let features = Features::default();
        let scorer = FallbackScorer;
        for user in ["u1", "u2", "user-with-long-name", "другой"] {
            for et in [EventType::Signup, EventType::Login, EventType::Transaction] {
                let p = scorer.predict(&input(user, et, &features)).unwrap();
                assert!((0.0..=1.0).contains(&p.score), "score out of range: {}", p.score);
                assert_eq!(p.band, score_to_band(p.score));
                assert!(p.top_features.len() <= 3);
            }
        }
    }

    #[test]
    fn transaction_scores_at_least_the_signup_base() {
        let features = Features::default();
        let scorer = FallbackScorer;
        let signup = scorer
            .predict(&input("u-42", EventType::Signup, &features))
            .unwrap();
        let txn = scorer
            .predict(&input("u-42", EventType::Transaction, &features))
            .unwrap();
        assert!(txn.score >= signup.score);
    }

    #[test]
    fn top_features_are_sorted_by_magnitude_and_rounded() {
        let features = Features::default();
        let p = FallbackScorer
            .predict(&input("u-7", EventType::Login, &features))
            .unwrap();
        for pair in p.top_features.windows(2) {
            assert!(pair[0].1.abs() >= pair[1].1.abs());
        }
        for (_, v) in &p.top_features {
            assert_eq!(*v, crate::round4(*v), "contribution not rounded: {v}");
        }
    }

    #[test]
    fn different_users_diverge() {
        let features = Features::default();
        let scorer = FallbackScorer;
        let a = scorer
            .predict(&input("u-a", EventType::Signup, &features))
            .unwrap();
        let b = scorer
            .predict(&input("u-b", EventType::Signup, &features))
            .unwrap();
        assert_ne!(a.score, b.score);
    }
}
