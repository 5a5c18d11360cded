//! Postgres store for the risk pipeline.
//!
//! Free async functions over a `PgPool` (or, where a caller owns the
//! transaction, any `PgExecutor`). Each function is one logical operation;
//! the scoring path shares a single transaction across the score append and
//! the processed-marker insert, driven by the worker.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use rsk_schemas::{Event, ProcessingStatus};

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Connect to Postgres with the pipeline's pool defaults.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper used by scenario tests:
/// - connect using DATABASE_URL
/// - ensure migrations are applied
pub async fn testkit_pool() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = connect(&url).await?;
    migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// SQLSTATE 23505: unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        db_err.code().as_deref() == Some("23505")
    } else {
        false
    }
}

/// Failures worth retrying: connection/pool trouble, serialization
/// conflicts, deadlocks. Everything else is treated as fatal by callers.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P01") | Some("08000") | Some("08003")
                | Some("08006")
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub schema_version: i32,
    pub payload_json: Value,
    pub raw_payload_hash: String,
    pub accepted_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn from_event(event: &Event, raw_payload_hash: String, accepted_at: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id,
            user_id: event.user_id.clone(),
            event_type: event.event_type().as_str().to_string(),
            ts: event.ts,
            schema_version: event.schema_version,
            payload_json: event.payload.to_value(),
            raw_payload_hash,
            accepted_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub event_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub schema_version: i32,
    pub payload_json: Value,
    pub raw_payload_hash: String,
    pub accepted_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Outcome of the idempotent event insert. `AlreadyExists` carries the
/// stored row so the caller can inspect `published_at`.
#[derive(Debug, Clone)]
pub enum EventInsert {
    Inserted,
    AlreadyExists(EventRow),
}

const SELECT_EVENT: &str = r#"
    select event_id, user_id, event_type, ts, schema_version, payload_json,
           raw_payload_hash, accepted_at, published_at
    from events
    where event_id = $1
"#;

/// Atomic insert keyed on `event_id`. On conflict no row is modified and the
/// existing row is returned for inspection. First-writer-wins under
/// concurrent inserts of the same event_id.
pub async fn insert_event_if_absent(pool: &PgPool, event: &NewEvent) -> Result<EventInsert> {
    let result = sqlx::query(
        r#"
        insert into events (
          event_id, user_id, event_type, ts, schema_version, payload_json,
          raw_payload_hash, accepted_at, published_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, null
        )
        on conflict (event_id) do nothing
        "#,
    )
    .bind(event.event_id)
    .bind(&event.user_id)
    .bind(&event.event_type)
    .bind(event.ts)
    .bind(event.schema_version)
    .bind(&event.payload_json)
    .bind(&event.raw_payload_hash)
    .bind(event.accepted_at)
    .execute(pool)
    .await
    .context("insert_event_if_absent failed")?;

    if result.rows_affected() == 1 {
        return Ok(EventInsert::Inserted);
    }

    let existing = get_event(pool, event.event_id)
        .await?
        .ok_or_else(|| anyhow!("event {} conflicted but is not readable", event.event_id))?;
    Ok(EventInsert::AlreadyExists(existing))
}

pub async fn get_event(pool: &PgPool, event_id: Uuid) -> Result<Option<EventRow>> {
    let row = sqlx::query_as::<_, EventRow>(SELECT_EVENT)
        .bind(event_id)
        .fetch_optional(pool)
        .await
        .context("get_event failed")?;
    Ok(row)
}

/// Idempotent publication flag update: a no-op when `published_at` is
/// already set.
pub async fn mark_published(
    pool: &PgPool,
    event_id: Uuid,
    published_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update events
        set published_at = $2
        where event_id = $1 and published_at is null
        "#,
    )
    .bind(event_id)
    .bind(published_at)
    .execute(pool)
    .await
    .context("mark_published failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Processed-set
// ---------------------------------------------------------------------------

/// Probe for an existing processed marker. Cheap skip only; the atomic
/// insert below is the authoritative decision.
pub async fn is_processed(pool: &PgPool, event_id: Uuid) -> Result<bool> {
    let row = sqlx::query(
        r#"
        select exists (select 1 from processed_events where event_id = $1) as found
        "#,
    )
    .bind(event_id)
    .fetch_one(pool)
    .await
    .context("is_processed failed")?;
    let found: bool = row.try_get("found")?;
    Ok(found)
}

/// Atomic processed-marker insert. Returns `true` when this call inserted
/// the row — the winner of concurrent processing. Runs on any executor so
/// the worker can place it inside the scoring transaction.
pub async fn insert_processed_if_absent<'e, E>(
    executor: E,
    event_id: Uuid,
    status: ProcessingStatus,
) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        insert into processed_events (event_id, processed_at, status)
        values ($1, $2, $3)
        on conflict (event_id) do nothing
        "#,
    )
    .bind(event_id)
    .bind(Utc::now())
    .bind(status.as_str())
    .execute(executor)
    .await
    .context("insert_processed_if_absent failed")?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Risk scores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewRiskScore {
    pub user_id: String,
    pub score: f64,
    pub band: String,
    pub computed_at: DateTime<Utc>,
    pub top_features_json: Option<Value>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RiskScoreRow {
    pub id: i32,
    pub user_id: String,
    pub score: f64,
    pub band: String,
    pub computed_at: DateTime<Utc>,
    pub top_features_json: Option<Value>,
    pub model_version: Option<String>,
}

/// Append-only score history; runs on any executor so the worker can place
/// it inside the scoring transaction.
pub async fn append_score<'e, E>(executor: E, score: &NewRiskScore) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        insert into risk_scores (
          user_id, score, band, computed_at, top_features_json, model_version
        ) values (
          $1, $2, $3, $4, $5, $6
        )
        "#,
    )
    .bind(&score.user_id)
    .bind(score.score)
    .bind(&score.band)
    .bind(score.computed_at)
    .bind(&score.top_features_json)
    .bind(&score.model_version)
    .execute(executor)
    .await
    .context("append_score failed")?;
    Ok(())
}

pub async fn latest_score(pool: &PgPool, user_id: &str) -> Result<Option<RiskScoreRow>> {
    let row = sqlx::query_as::<_, RiskScoreRow>(
        r#"
        select id, user_id, score, band, computed_at, top_features_json, model_version
        from risk_scores
        where user_id = $1
        order by computed_at desc, id desc
        limit 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("latest_score failed")?;
    Ok(row)
}

pub async fn score_history(pool: &PgPool, user_id: &str, limit: i64) -> Result<Vec<RiskScoreRow>> {
    let rows = sqlx::query_as::<_, RiskScoreRow>(
        r#"
        select id, user_id, score, band, computed_at, top_features_json, model_version
        from risk_scores
        where user_id = $1
        order by computed_at desc, id desc
        limit $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("score_history failed")?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// DLQ
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub event_id: Option<Uuid>,
    pub raw_payload: String,
    pub failure_reason: String,
    pub retry_count: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DlqRow {
    pub id: i32,
    pub event_id: Option<Uuid>,
    pub raw_payload: String,
    pub failure_reason: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
}

pub async fn append_dlq(pool: &PgPool, entry: &NewDlqEntry) -> Result<i32> {
    let row = sqlx::query(
        r#"
        insert into dlq_events (event_id, raw_payload, failure_reason, created_at, retry_count)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(entry.event_id)
    .bind(&entry.raw_payload)
    .bind(&entry.failure_reason)
    .bind(Utc::now())
    .bind(entry.retry_count)
    .fetch_one(pool)
    .await
    .context("append_dlq failed")?;
    let id: i32 = row.try_get("id")?;
    Ok(id)
}

/// Newest-first DLQ page plus the total row count.
pub async fn dlq_list(pool: &PgPool, limit: i64, offset: i64) -> Result<(Vec<DlqRow>, i64)> {
    let (total,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*)::bigint from dlq_events")
        .fetch_one(pool)
        .await
        .context("dlq_list count failed")?;

    let rows = sqlx::query_as::<_, DlqRow>(
        r#"
        select id, event_id, raw_payload, failure_reason, created_at, retry_count
        from dlq_events
        order by created_at desc, id desc
        limit $1 offset $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("dlq_list failed")?;

    Ok((rows, total))
}

pub async fn dlq_get(pool: &PgPool, id: i32) -> Result<Option<DlqRow>> {
    let row = sqlx::query_as::<_, DlqRow>(
        r#"
        select id, event_id, raw_payload, failure_reason, created_at, retry_count
        from dlq_events
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("dlq_get failed")?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Model versions
// ---------------------------------------------------------------------------

/// Record a loaded model version; a no-op when already registered.
pub async fn register_model_version(
    pool: &PgPool,
    model_version: &str,
    params_hash: &str,
    metadata_json: Option<Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into model_versions (model_version, created_at, params_hash, metadata_json)
        values ($1, $2, $3, $4)
        on conflict (model_version) do nothing
        "#,
    )
    .bind(model_version)
    .bind(Utc::now())
    .bind(params_hash)
    .bind(metadata_json)
    .execute(pool)
    .await
    .context("register_model_version failed")?;
    Ok(())
}
