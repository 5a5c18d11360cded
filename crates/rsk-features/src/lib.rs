//! Rolling-window feature extraction over the events table.
//!
//! The feature vector order is a contract shared with model training:
//! changing it is a breaking change that requires retraining. Windows are
//! `[as_of - W, as_of]` inclusive on event `ts` (UTC). Aggregation over the
//! fetched rows is pure so the window rules are unit-testable without a
//! database.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use std::collections::HashSet;

/// Contract order of the feature vector.
pub const FEATURE_ORDER: [&str; 6] = [
    "txn_count_24h",
    "txn_amount_sum_24h",
    "failed_logins_1h",
    "account_age_days",
    "unique_countries_7d",
    "avg_txn_amount_30d",
];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Features {
    pub txn_count_24h: f64,
    pub txn_amount_sum_24h: f64,
    pub failed_logins_1h: f64,
    pub account_age_days: f64,
    pub unique_countries_7d: f64,
    pub avg_txn_amount_30d: f64,
}

impl Features {
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "txn_count_24h" => Some(self.txn_count_24h),
            "txn_amount_sum_24h" => Some(self.txn_amount_sum_24h),
            "failed_logins_1h" => Some(self.failed_logins_1h),
            "account_age_days" => Some(self.account_age_days),
            "unique_countries_7d" => Some(self.unique_countries_7d),
            "avg_txn_amount_30d" => Some(self.avg_txn_amount_30d),
            _ => None,
        }
    }

    /// Values in `FEATURE_ORDER`.
    pub fn to_vec(&self) -> [f64; 6] {
        [
            self.txn_count_24h,
            self.txn_amount_sum_24h,
            self.failed_logins_1h,
            self.account_age_days,
            self.unique_countries_7d,
            self.avg_txn_amount_30d,
        ]
    }
}

/// One event row inside a lookback window; only the fields aggregation needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WindowEventRow {
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub payload_json: Value,
}

/// Compute the full feature vector for `user_id` at `as_of`, on the caller's
/// connection so the worker's scoring transaction owns the reads.
pub async fn compute_features(
    conn: &mut PgConnection,
    user_id: &str,
    as_of: DateTime<Utc>,
) -> Result<Features> {
    let txns_30d = fetch_window(
        conn,
        user_id,
        &["transaction"],
        as_of - Duration::days(30),
        as_of,
    )
    .await?;
    let logins_1h = fetch_window(
        conn,
        user_id,
        &["login"],
        as_of - Duration::hours(1),
        as_of,
    )
    .await?;
    let countries_7d = fetch_window(
        conn,
        user_id,
        &["transaction", "signup"],
        as_of - Duration::days(7),
        as_of,
    )
    .await?;
    let first_ts = first_event_ts(conn, user_id).await?;

    let cutoff_24h = as_of - Duration::hours(24);
    let txns_24h: Vec<&WindowEventRow> =
        txns_30d.iter().filter(|r| r.ts >= cutoff_24h).collect();

    Ok(Features {
        txn_count_24h: txns_24h.len() as f64,
        txn_amount_sum_24h: amount_sum(txns_24h.iter().copied()),
        failed_logins_1h: failed_login_count(&logins_1h),
        account_age_days: account_age_days(first_ts, as_of),
        unique_countries_7d: unique_countries(&countries_7d),
        avg_txn_amount_30d: amount_avg(&txns_30d),
    })
}

async fn fetch_window(
    conn: &mut PgConnection,
    user_id: &str,
    event_types: &[&str],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<WindowEventRow>> {
    let types: Vec<String> = event_types.iter().map(|s| s.to_string()).collect();
    let rows = sqlx::query_as::<_, WindowEventRow>(
        r#"
        select event_type, ts, payload_json
        from events
        where user_id = $1
          and event_type = any($2)
          and ts >= $3
          and ts <= $4
        order by ts asc
        "#,
    )
    .bind(user_id)
    .bind(&types)
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await
    .context("feature window query failed")?;
    Ok(rows)
}

async fn first_event_ts(
    conn: &mut PgConnection,
    user_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        select ts from events
        where user_id = $1
        order by ts asc
        limit 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .context("first event query failed")?;
    Ok(row.map(|(ts,)| ts))
}

// ---------------------------------------------------------------------------
// Pure aggregation
// ---------------------------------------------------------------------------

fn payload_amount(row: &WindowEventRow) -> Option<f64> {
    row.payload_json.get("amount").and_then(Value::as_f64)
}

fn amount_sum<'a>(rows: impl Iterator<Item = &'a WindowEventRow>) -> f64 {
    rows.filter_map(payload_amount).sum()
}

fn amount_avg(rows: &[WindowEventRow]) -> f64 {
    let amounts: Vec<f64> = rows.iter().filter_map(payload_amount).collect();
    if amounts.is_empty() {
        return 0.0;
    }
    amounts.iter().sum::<f64>() / amounts.len() as f64
}

fn failed_login_count(rows: &[WindowEventRow]) -> f64 {
    rows.iter()
        .filter(|r| r.payload_json.get("success").and_then(Value::as_bool) == Some(false))
        .count() as f64
}

fn unique_countries(rows: &[WindowEventRow]) -> f64 {
    let countries: HashSet<&str> = rows
        .iter()
        .filter_map(|r| r.payload_json.get("country").and_then(Value::as_str))
        .collect();
    countries.len() as f64
}

/// Whole days since the user's first event, clamped at zero; zero for users
/// with no history.
fn account_age_days(first_ts: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> f64 {
    match first_ts {
        Some(first) => (as_of - first).num_days().max(0) as f64,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(event_type: &str, ts: DateTime<Utc>, payload: Value) -> WindowEventRow {
        WindowEventRow {
            event_type: event_type.to_string(),
            ts,
            payload_json: payload,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn feature_order_matches_struct_projection() {
        let f = Features {
            txn_count_24h: 1.0,
            txn_amount_sum_24h: 2.0,
            failed_logins_1h: 3.0,
            account_age_days: 4.0,
            unique_countries_7d: 5.0,
            avg_txn_amount_30d: 6.0,
        };
        for (i, name) in FEATURE_ORDER.iter().enumerate() {
            assert_eq!(f.get(name), Some(f.to_vec()[i]), "order mismatch at {name}");
        }
        assert_eq!(f.get("nope"), None);
    }

    #[test]
    fn amount_aggregates_ignore_missing_fields() {
        let ts = at("2024-01-15T12:00:00Z");
        let rows = vec![
            row("transaction", ts, json!({"amount": 10.0})),
            row("transaction", ts, json!({"amount": 2.5})),
            row("transaction", ts, json!({"merchant": "no-amount"})),
        ];
        assert_eq!(amount_sum(rows.iter()), 12.5);
        assert_eq!(amount_avg(&rows), 6.25);
        assert_eq!(amount_avg(&[]), 0.0);
    }

    #[test]
    fn failed_logins_count_only_explicit_false() {
        let ts = at("2024-01-15T12:00:00Z");
        let rows = vec![
            row("login", ts, json!({"success": false})),
            row("login", ts, json!({"success": true})),
            row("login", ts, json!({"success": false})),
            row("login", ts, json!({})),
        ];
        assert_eq!(failed_login_count(&rows), 2.0);
    }

    #[test]
    fn unique_countries_deduplicate() {
        let ts = at("2024-01-15T12:00:00Z");
        let rows = vec![
            row("transaction", ts, json!({"country": "US"})),
            row("signup", ts, json!({"country": "US"})),
            row("transaction", ts, json!({"country": "GB"})),
            row("transaction", ts, json!({})),
        ];
        assert_eq!(unique_countries(&rows), 2.0);
    }

    #[test]
    fn account_age_floors_and_clamps() {
        let as_of = at("2024-01-15T12:00:00Z");
        assert_eq!(account_age_days(None, as_of), 0.0);
        assert_eq!(
            account_age_days(Some(at("2024-01-10T13:00:00Z")), as_of),
            4.0,
            "partial days floor down"
        );
        assert_eq!(account_age_days(Some(at("2024-01-15T12:00:00Z")), as_of), 0.0);
        assert_eq!(
            account_age_days(Some(at("2024-02-01T00:00:00Z")), as_of),
            0.0,
            "future first event clamps to zero"
        );
    }
}
