//! Shared event model for the risk pipeline: the event envelope sum type,
//! strict payload validation, canonical JSON hashing, the score band policy,
//! and the HTTP response bodies both services speak.

use serde::{Deserialize, Serialize};

mod canonical;
mod event;
mod responses;

pub use canonical::{canonical_json, payload_hash};
pub use event::{
    parse_event, parse_event_bytes, Event, EventPayload, LoginPayload, SignupPayload,
    TransactionPayload, ValidationError,
};
pub use responses::{
    DlqEntryResponse, DlqListResponse, ErrorBody, EventAcceptedResponse, HealthResponse,
    RiskScoreResponse,
};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Signup,
    Login,
    Transaction,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Signup => "signup",
            EventType::Login => "login",
            EventType::Transaction => "transaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signup" => Some(EventType::Signup),
            "login" => Some(EventType::Login),
            "transaction" => Some(EventType::Transaction),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RiskBand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Med,
    High,
}

impl RiskBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Med => "med",
            RiskBand::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskBand::Low),
            "med" => Some(RiskBand::Med),
            "high" => Some(RiskBand::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Band thresholds, left-closed: a score exactly at a boundary falls into the
/// higher band.
pub const BAND_LOW_MAX: f64 = 0.33;
pub const BAND_MED_MAX: f64 = 0.66;

pub fn score_to_band(score: f64) -> RiskBand {
    if score < BAND_LOW_MAX {
        RiskBand::Low
    } else if score < BAND_MED_MAX {
        RiskBand::Med
    } else {
        RiskBand::High
    }
}

// ---------------------------------------------------------------------------
// ProcessingStatus
// ---------------------------------------------------------------------------

/// Terminal disposition recorded in the processed-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Success,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }
}
