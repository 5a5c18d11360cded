//! Per-message processing: decode, dedup, score, and classify failures.
//!
//! Every message reaches exactly one terminal state — scored, skipped as a
//! duplicate, or dead-lettered — before its offset is committed. Errors are
//! split into non-retryable (straight to DLQ) and retryable (backoff, then
//! DLQ after the budget is spent). A terminal state must be durable before
//! the caller may commit; when even the DLQ write fails the message is left
//! uncommitted for redelivery.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use rsk_db::{NewDlqEntry, NewRiskScore};
use rsk_features::compute_features;
use rsk_metrics::Metrics;
use rsk_model::{Prediction, Scorer, ScoringInput};
use rsk_schemas::{parse_event_bytes, Event, ProcessingStatus};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Outcomes and classification
// ---------------------------------------------------------------------------

/// Terminal disposition of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Skipped,
    DeadLettered,
}

/// Outcome of a single processing attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Terminal(Disposition),
    Retry(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{0}")]
    NonRetryable(String),
    #[error("{0}")]
    Retryable(String),
}

/// Classification for store failures: transient DB trouble retries,
/// non-idempotent constraint violations do not, and anything unexpected is
/// given the benefit of a retry.
pub fn classify_db_error(err: &anyhow::Error) -> ProcessError {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        if rsk_db::is_transient(sqlx_err) {
            return ProcessError::Retryable(format!("transient db failure: {err:#}"));
        }
        if rsk_db::is_unique_violation(sqlx_err) {
            return ProcessError::NonRetryable(format!("constraint violation: {err:#}"));
        }
    }
    ProcessError::Retryable(format!("unexpected failure: {err:#}"))
}

// ---------------------------------------------------------------------------
// Worker context
// ---------------------------------------------------------------------------

pub struct WorkerContext {
    pub pool: sqlx::PgPool,
    pub scorer: Arc<dyn Scorer>,
    pub metrics: Arc<Metrics>,
    pub policy: RetryPolicy,
}

impl WorkerContext {
    pub fn new(
        pool: sqlx::PgPool,
        scorer: Arc<dyn Scorer>,
        metrics: Arc<Metrics>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            scorer,
            metrics,
            policy,
        }
    }

    /// One processing attempt. Decode failures and schema rejections are
    /// terminal immediately; everything else either finishes or asks for a
    /// retry.
    pub async fn process_message(&self, raw: &[u8], retry_count: u32) -> AttemptOutcome {
        let event = match parse_event_bytes(raw) {
            Ok(event) => event,
            Err(err) => {
                let reason = format!("Schema validation failed: {err}");
                return match self
                    .dead_letter(None, raw, &reason, retry_count, "schema_validation")
                    .await
                {
                    Ok(()) => {
                        self.metrics
                            .events_processed_total
                            .with_label_values(&["unknown", "dlq"])
                            .inc();
                        AttemptOutcome::Terminal(Disposition::DeadLettered)
                    }
                    Err(err) => AttemptOutcome::Retry(format!("dlq write failed: {err:#}")),
                };
            }
        };

        let event_type = event.event_type().as_str();

        // Cheap skip; the atomic insert inside the scoring transaction stays
        // authoritative.
        match rsk_db::is_processed(&self.pool, event.event_id).await {
            Ok(true) => {
                info!(event_id = %event.event_id, "event already processed, skipping");
                self.metrics
                    .events_processed_total
                    .with_label_values(&[event_type, "skipped"])
                    .inc();
                return AttemptOutcome::Terminal(Disposition::Skipped);
            }
            Ok(false) => {}
            Err(err) => return self.retry_or_terminal(classify_db_error(&err), &event, raw, retry_count).await,
        }

        info!(event_id = %event.event_id, user_id = %event.user_id, "processing event");

        match self.score_event(&event).await {
            Ok(true) => {
                self.metrics
                    .events_processed_total
                    .with_label_values(&[event_type, "success"])
                    .inc();
                AttemptOutcome::Terminal(Disposition::Success)
            }
            Ok(false) => {
                warn!(event_id = %event.event_id, "another worker won the scoring race");
                self.metrics
                    .events_processed_total
                    .with_label_values(&[event_type, "skipped"])
                    .inc();
                AttemptOutcome::Terminal(Disposition::Skipped)
            }
            Err(err) => self.retry_or_terminal(err, &event, raw, retry_count).await,
        }
    }

    async fn retry_or_terminal(
        &self,
        err: ProcessError,
        event: &Event,
        raw: &[u8],
        retry_count: u32,
    ) -> AttemptOutcome {
        match err {
            ProcessError::Retryable(reason) => AttemptOutcome::Retry(reason),
            ProcessError::NonRetryable(reason) => {
                error!(event_id = %event.event_id, reason = %reason, "non-retryable failure");
                match self
                    .dead_letter(Some(event.event_id), raw, &reason, retry_count, "non_retryable")
                    .await
                {
                    Ok(()) => {
                        // Terminal responsibility is recorded even for
                        // failures so the event is never scored later.
                        if let Err(err) = rsk_db::insert_processed_if_absent(
                            &self.pool,
                            event.event_id,
                            ProcessingStatus::Failed,
                        )
                        .await
                        {
                            error!(event_id = %event.event_id, error = ?err, "failed marker write failed");
                        }
                        self.metrics
                            .events_processed_total
                            .with_label_values(&[event.event_type().as_str(), "dlq"])
                            .inc();
                        AttemptOutcome::Terminal(Disposition::DeadLettered)
                    }
                    Err(err) => AttemptOutcome::Retry(format!("dlq write failed: {err:#}")),
                }
            }
        }
    }

    /// Score inside one transaction: features, prediction, score append,
    /// processed marker. Returns Ok(false) when another worker already owns
    /// the marker — the score append is rolled back.
    async fn score_event(&self, event: &Event) -> Result<bool, ProcessError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_db_error(&anyhow::Error::new(e)))?;

        let as_of = Utc::now();
        let features = compute_features(&mut *tx, &event.user_id, as_of)
            .await
            .map_err(|e| classify_db_error(&e))?;

        let start = Instant::now();
        let prediction = self
            .scorer
            .predict(&ScoringInput {
                user_id: &event.user_id,
                event_type: event.event_type(),
                features: &features,
            })
            .map_err(|e| {
                if e.is_retryable() {
                    ProcessError::Retryable(format!("scorer failure: {e}"))
                } else {
                    ProcessError::NonRetryable(format!("scorer failure: {e}"))
                }
            })?;
        self.metrics
            .scoring_duration
            .with_label_values(&[&prediction.model_version])
            .observe(start.elapsed().as_secs_f64());

        rsk_db::append_score(&mut *tx, &new_risk_score(event, &prediction, as_of))
            .await
            .map_err(|e| classify_db_error(&e))?;

        let won =
            rsk_db::insert_processed_if_absent(&mut *tx, event.event_id, ProcessingStatus::Success)
                .await
                .map_err(|e| classify_db_error(&e))?;

        if !won {
            tx.rollback()
                .await
                .map_err(|e| classify_db_error(&anyhow::Error::new(e)))?;
            return Ok(false);
        }

        tx.commit()
            .await
            .map_err(|e| classify_db_error(&anyhow::Error::new(e)))?;

        info!(
            event_id = %event.event_id,
            user_id = %event.user_id,
            score = prediction.score,
            band = %prediction.band,
            "event scored"
        );
        Ok(true)
    }

    async fn dead_letter(
        &self,
        event_id: Option<Uuid>,
        raw: &[u8],
        reason: &str,
        retry_count: u32,
        reason_label: &str,
    ) -> anyhow::Result<()> {
        rsk_db::append_dlq(
            &self.pool,
            &NewDlqEntry {
                event_id,
                raw_payload: String::from_utf8_lossy(raw).into_owned(),
                failure_reason: reason.to_string(),
                retry_count: retry_count as i32,
            },
        )
        .await?;
        self.metrics
            .dlq_events_total
            .with_label_values(&[reason_label])
            .inc();
        warn!(?event_id, reason, retry_count, "event sent to DLQ");
        Ok(())
    }

    /// Drive one message to a terminal state, retrying with backoff.
    /// Returns `None` when shutdown interrupts before a terminal state is
    /// durable; the caller must then leave the offset uncommitted.
    pub async fn process_with_retries(
        &self,
        raw: &[u8],
        shutdown: &watch::Receiver<bool>,
    ) -> Option<Disposition> {
        let mut retry_count: u32 = 0;

        loop {
            match self.process_message(raw, retry_count).await {
                AttemptOutcome::Terminal(disposition) => return Some(disposition),
                AttemptOutcome::Retry(reason) => {
                    if !self.policy.should_retry(retry_count) {
                        error!(
                            max_retries = self.policy.max_retries,
                            reason = %reason,
                            "max retries exceeded, transferring to DLQ"
                        );
                        // Best-effort identification for the DLQ row.
                        let event_id = parse_event_bytes(raw).ok().map(|e| e.event_id);
                        let dlq_reason =
                            format!("Max retries ({}) exceeded: {reason}", self.policy.max_retries);
                        return match self
                            .dead_letter(event_id, raw, &dlq_reason, retry_count, "max_retries")
                            .await
                        {
                            Ok(()) => {
                                self.metrics
                                    .events_processed_total
                                    .with_label_values(&[
                                        event_label_from_bytes(raw),
                                        "dlq",
                                    ])
                                    .inc();
                                Some(Disposition::DeadLettered)
                            }
                            Err(err) => {
                                // No durable terminal state; redelivery will
                                // try again from the last committed offset.
                                error!(error = ?err, "dlq transfer failed; leaving message uncommitted");
                                None
                            }
                        };
                    }

                    retry_count += 1;
                    self.metrics
                        .retry_attempts_total
                        .with_label_values(&[&retry_count.to_string()])
                        .inc();
                    let delay = self.policy.delay(retry_count - 1);
                    warn!(
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "retryable failure, backing off"
                    );

                    if *shutdown.borrow() {
                        return None;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = crate::wait_for_shutdown(shutdown.clone()) => return None,
                    }
                }
            }
        }
    }
}

fn event_label_from_bytes(raw: &[u8]) -> &'static str {
    match parse_event_bytes(raw) {
        Ok(event) => event.event_type().as_str(),
        Err(_) => "unknown",
    }
}

fn new_risk_score(
    event: &Event,
    prediction: &Prediction,
    computed_at: chrono::DateTime<Utc>,
) -> NewRiskScore {
    let top_features: serde_json::Map<String, Value> = prediction
        .top_features
        .iter()
        .map(|(name, v)| (name.clone(), Value::from(*v)))
        .collect();
    NewRiskScore {
        user_id: event.user_id.clone(),
        score: prediction.score,
        band: prediction.band.as_str().to_string(),
        computed_at,
        top_features_json: Some(Value::Object(top_features)),
        model_version: Some(prediction.model_version.clone()),
    }
}
