//! HTTP response bodies shared by the API surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAcceptedResponse {
    pub event_id: Uuid,
    pub status: String,
}

impl EventAcceptedResponse {
    pub fn accepted(event_id: Uuid) -> Self {
        Self {
            event_id,
            status: "accepted".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScoreResponse {
    pub user_id: String,
    pub score: f64,
    pub band: String,
    pub computed_at: DateTime<Utc>,
    pub top_features: Option<Value>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntryResponse {
    pub id: i32,
    pub event_id: Option<Uuid>,
    pub raw_payload: String,
    pub failure_reason: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqListResponse {
    pub entries: Vec<DlqEntryResponse>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Typed error detail for 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
