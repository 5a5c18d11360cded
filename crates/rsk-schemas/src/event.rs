//! Event envelope decoding and validation.
//!
//! Ingress payloads are tagged variants: the `event_type` discriminator in
//! the envelope selects the payload shape. Unknown discriminators are a
//! distinct error from malformed JSON so the worker can DLQ them with a
//! schema-level reason. Unknown keys are rejected at every nesting level.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{EventType, CURRENT_SCHEMA_VERSION};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Schema-level rejection, distinct from transport errors. Maps to 400 on the
/// ingest path and to a non-retryable DLQ transfer on the worker path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed event json: {0}")]
    Json(String),
    #[error("missing event_type discriminator")]
    MissingEventType,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid {event_type} payload: {detail}")]
    Payload {
        event_type: EventType,
        detail: String,
    },
    #[error("invalid {field}: {detail}")]
    Field { field: &'static str, detail: String },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignupPayload {
    pub email_domain: String,
    pub country: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginPayload {
    pub ip: String,
    pub success: bool,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionPayload {
    pub amount: f64,
    pub currency: String,
    pub merchant: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Signup(SignupPayload),
    Login(LoginPayload),
    Transaction(TransactionPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Signup(_) => EventType::Signup,
            EventPayload::Login(_) => EventType::Login,
            EventPayload::Transaction(_) => EventType::Transaction,
        }
    }

    pub fn to_value(&self) -> Value {
        // Payload structs serialize to plain maps; this cannot fail.
        match self {
            EventPayload::Signup(p) => serde_json::to_value(p),
            EventPayload::Login(p) => serde_json::to_value(p),
            EventPayload::Transaction(p) => serde_json::to_value(p),
        }
        .expect("payload serialization must not fail")
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub user_id: String,
    pub ts: DateTime<Utc>,
    pub schema_version: i32,
    pub payload: EventPayload,
}

/// Envelope shape as decoded from the wire, before payload dispatch.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    event_id: Uuid,
    user_id: String,
    #[allow(dead_code)]
    event_type: String,
    ts: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    schema_version: i32,
    payload: Value,
}

fn default_schema_version() -> i32 {
    CURRENT_SCHEMA_VERSION
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Serialize back to the wire envelope. A decoded then re-serialized
    /// envelope re-parses to the same `Event`; timestamps are emitted as
    /// ISO-8601 UTC with a `Z` suffix.
    pub fn to_value(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "user_id": self.user_id,
            "event_type": self.event_type().as_str(),
            "ts": self.ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            "schema_version": self.schema_version,
            "payload": self.payload.to_value(),
        })
    }

    /// Rebuild a typed event from stored columns (envelope fields plus the
    /// payload JSONB). Used when re-publishing a persisted but unpublished
    /// row.
    pub fn from_parts(
        event_id: Uuid,
        user_id: String,
        event_type: EventType,
        ts: DateTime<Utc>,
        schema_version: i32,
        payload: &Value,
    ) -> Result<Self, ValidationError> {
        let payload = decode_payload(event_type, payload)?;
        let event = Event {
            event_id,
            user_id,
            ts,
            schema_version,
            payload,
        };
        event.validate()?;
        Ok(event)
    }

    /// Field bounds beyond what serde enforces structurally.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_len("user_id", &self.user_id, 1, 255)?;
        if self.schema_version < 1 {
            return Err(ValidationError::Field {
                field: "schema_version",
                detail: format!("must be >= 1, got {}", self.schema_version),
            });
        }

        match &self.payload {
            EventPayload::Signup(p) => {
                check_len("email_domain", &p.email_domain, 1, 255)?;
                check_exact_len("country", &p.country, 2)?;
                check_len("device_id", &p.device_id, 1, 255)?;
            }
            EventPayload::Login(p) => {
                check_len("ip", &p.ip, 7, 45)?;
                check_len("device_id", &p.device_id, 1, 255)?;
            }
            EventPayload::Transaction(p) => {
                if !(p.amount > 0.0) || !p.amount.is_finite() {
                    return Err(ValidationError::Field {
                        field: "amount",
                        detail: format!("must be > 0, got {}", p.amount),
                    });
                }
                check_exact_len("currency", &p.currency, 3)?;
                check_len("merchant", &p.merchant, 1, 255)?;
                check_exact_len("country", &p.country, 2)?;
            }
        }
        Ok(())
    }
}

fn check_len(field: &'static str, s: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let n = s.chars().count();
    if n < min || n > max {
        return Err(ValidationError::Field {
            field,
            detail: format!("length must be in {min}..={max}, got {n}"),
        });
    }
    Ok(())
}

fn check_exact_len(field: &'static str, s: &str, want: usize) -> Result<(), ValidationError> {
    let n = s.chars().count();
    if n != want {
        return Err(ValidationError::Field {
            field,
            detail: format!("length must be exactly {want}, got {n}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode and validate an event from a parsed JSON map. The discriminator is
/// inspected before full envelope decoding so unknown types surface as
/// `UnknownEventType` rather than a generic serde error.
pub fn parse_event(value: &Value) -> Result<Event, ValidationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::Json("event must be a JSON object".to_string()))?;

    let tag = obj
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingEventType)?;
    let event_type =
        EventType::parse(tag).ok_or_else(|| ValidationError::UnknownEventType(tag.to_string()))?;

    let raw: RawEnvelope =
        serde_json::from_value(value.clone()).map_err(|e| ValidationError::Json(e.to_string()))?;

    let payload = decode_payload(event_type, &raw.payload)?;

    let event = Event {
        event_id: raw.event_id,
        user_id: raw.user_id,
        ts: raw.ts,
        schema_version: raw.schema_version,
        payload,
    };
    event.validate()?;
    Ok(event)
}

/// Decode and validate an event from raw bytes (the log wire value).
pub fn parse_event_bytes(bytes: &[u8]) -> Result<Event, ValidationError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Json(e.to_string()))?;
    parse_event(&value)
}

fn decode_payload(event_type: EventType, value: &Value) -> Result<EventPayload, ValidationError> {
    let mk_err = |e: serde_json::Error| ValidationError::Payload {
        event_type,
        detail: e.to_string(),
    };
    Ok(match event_type {
        EventType::Signup => EventPayload::Signup(
            serde_json::from_value(value.clone()).map_err(mk_err)?,
        ),
        EventType::Login => {
            EventPayload::Login(serde_json::from_value(value.clone()).map_err(mk_err)?)
        }
        EventType::Transaction => EventPayload::Transaction(
            serde_json::from_value(value.clone()).map_err(mk_err)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical_json;
    use serde_json::json;

    fn signup_value() -> Value {
        json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u1",
            "event_type": "signup",
            "ts": "2024-01-15T12:00:00Z",
            "schema_version": 1,
            "payload": {"email_domain": "ex.com", "country": "US", "device_id": "d1"}
        })
    }

    #[test]
    fn parses_signup_event() {
        let event = parse_event(&signup_value()).unwrap();
        assert_eq!(event.event_type(), EventType::Signup);
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.schema_version, 1);
        match &event.payload {
            EventPayload::Signup(p) => assert_eq!(p.country, "US"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn parses_login_and_transaction_events() {
        let login = json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u2",
            "event_type": "login",
            "ts": "2024-01-15T12:00:00Z",
            "payload": {"ip": "10.0.0.1", "success": false, "device_id": "d2"}
        });
        let event = parse_event(&login).unwrap();
        assert_eq!(event.event_type(), EventType::Login);
        // schema_version defaults when absent
        assert_eq!(event.schema_version, CURRENT_SCHEMA_VERSION);

        let txn = json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u3",
            "event_type": "transaction",
            "ts": "2024-01-15T12:00:00Z",
            "schema_version": 1,
            "payload": {"amount": 99.5, "currency": "USD", "merchant": "m", "country": "GB"}
        });
        let event = parse_event(&txn).unwrap();
        assert_eq!(event.event_type(), EventType::Transaction);
    }

    #[test]
    fn normalizes_offset_timestamps_to_utc() {
        let mut v = signup_value();
        v["ts"] = json!("2024-01-15T17:30:00+05:30");
        let event = parse_event(&v).unwrap();
        assert_eq!(
            event.ts,
            "2024-01-15T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn rejects_unknown_event_type_distinctly() {
        let mut v = signup_value();
        v["event_type"] = json!("purchase");
        match parse_event(&v) {
            Err(ValidationError::UnknownEventType(t)) => assert_eq!(t, "purchase"),
            other => panic!("expected UnknownEventType, got {other:?}"),
        }

        let no_tag = json!({"event_id": "12345678-1234-5678-1234-567812345678"});
        assert!(matches!(
            parse_event(&no_tag),
            Err(ValidationError::MissingEventType)
        ));
    }

    #[test]
    fn rejects_unknown_keys_at_both_levels() {
        let mut v = signup_value();
        v["extra"] = json!(1);
        assert!(matches!(parse_event(&v), Err(ValidationError::Json(_))));

        let mut v = signup_value();
        v["payload"]["extra"] = json!(1);
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Payload { .. })
        ));
    }

    #[test]
    fn rejects_field_bound_violations() {
        let mut v = signup_value();
        v["payload"]["email_domain"] = json!("");
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field {
                field: "email_domain",
                ..
            })
        ));

        let mut v = signup_value();
        v["payload"]["country"] = json!("USA");
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field { field: "country", .. })
        ));

        let mut v = signup_value();
        v["user_id"] = json!("");
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field { field: "user_id", .. })
        ));

        let mut v = signup_value();
        v["schema_version"] = json!(0);
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field {
                field: "schema_version",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_and_negative_amounts() {
        for amount in [0.0, -5.0] {
            let v = json!({
                "event_id": "12345678-1234-5678-1234-567812345678",
                "user_id": "u3",
                "event_type": "transaction",
                "ts": "2024-01-15T12:00:00Z",
                "payload": {"amount": amount, "currency": "USD", "merchant": "m", "country": "GB"}
            });
            assert!(
                matches!(
                    parse_event(&v),
                    Err(ValidationError::Field { field: "amount", .. })
                ),
                "amount {amount} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_currency_and_ip_length_violations() {
        let v = json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u3",
            "event_type": "transaction",
            "ts": "2024-01-15T12:00:00Z",
            "payload": {"amount": 1.0, "currency": "US", "merchant": "m", "country": "GB"}
        });
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field { field: "currency", .. })
        ));

        let v = json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u2",
            "event_type": "login",
            "ts": "2024-01-15T12:00:00Z",
            "payload": {"ip": "1.2.3", "success": true, "device_id": "d"}
        });
        assert!(matches!(
            parse_event(&v),
            Err(ValidationError::Field { field: "ip", .. })
        ));
    }

    #[test]
    fn envelope_round_trips() {
        let event = parse_event(&signup_value()).unwrap();
        let reparsed = parse_event(&event.to_value()).unwrap();
        assert_eq!(event, reparsed);
    }

    #[test]
    fn canonical_form_survives_decode_for_fully_specified_input() {
        let input = signup_value();
        let event = parse_event(&input).unwrap();
        assert_eq!(canonical_json(&event.to_value()), canonical_json(&input));
    }

    #[test]
    fn parse_event_bytes_rejects_invalid_json() {
        assert!(matches!(
            parse_event_bytes(b"not json"),
            Err(ValidationError::Json(_))
        ));
        assert!(matches!(
            parse_event_bytes(&[0xff, 0xfe]),
            Err(ValidationError::Json(_))
        ));
    }

    #[test]
    fn from_parts_rebuilds_the_same_event() {
        let event = parse_event(&signup_value()).unwrap();
        let rebuilt = Event::from_parts(
            event.event_id,
            event.user_id.clone(),
            event.event_type(),
            event.ts,
            event.schema_version,
            &event.payload.to_value(),
        )
        .unwrap();
        assert_eq!(event, rebuilt);
    }
}
