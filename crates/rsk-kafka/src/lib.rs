//! Log plumbing: producer/consumer construction and the wire codec.
//!
//! Messages are keyed by `user_id` bytes so every user's events land on one
//! partition, which is what gives the pipeline its per-user ordering
//! guarantee. The value is the full event envelope as JSON with UTC
//! timestamps. The configured DLQ topic name is recognized for external
//! forwarding; the core pipeline's DLQ lives in Postgres.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;

use rsk_config::Settings;
use rsk_schemas::{parse_event_bytes, Event, ValidationError};

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn serialize_event(event: &Event) -> Vec<u8> {
    event.to_value().to_string().into_bytes()
}

pub fn deserialize_event(bytes: &[u8]) -> Result<Event, ValidationError> {
    parse_event_bytes(bytes)
}

/// Partition key: the raw user id bytes.
pub fn message_key(event: &Event) -> &[u8] {
    event.user_id.as_bytes()
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

pub struct EventProducer {
    inner: FutureProducer,
    topic: String,
}

impl EventProducer {
    pub fn new(settings: &Settings) -> Result<Self> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.kafka_brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("create kafka producer")?;
        Ok(Self {
            inner,
            topic: settings.kafka_topic.clone(),
        })
    }

    /// Publish one event, awaiting the broker acknowledgement. At-least-once:
    /// the caller marks the row published only after this returns Ok.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serialize_event(event);
        let record = FutureRecord::to(&self.topic)
            .key(event.user_id.as_bytes())
            .payload(&payload);

        let (partition, offset) = self
            .inner
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _msg)| anyhow!("publish to {} failed: {err}", self.topic))?;

        debug!(
            event_id = %event.event_id,
            partition,
            offset,
            "event published"
        );
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Build the worker's consumer: stable group, manual offset commits, start
/// from the earliest uncommitted offset.
pub fn create_consumer(settings: &Settings) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &settings.kafka_brokers)
        .set("group.id", &settings.consumer_group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .create()
        .context("create kafka consumer")?;

    consumer
        .subscribe(&[settings.kafka_topic.as_str()])
        .with_context(|| format!("subscribe to {}", settings.kafka_topic))?;

    Ok(consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        rsk_schemas::parse_event(&json!({
            "event_id": "12345678-1234-5678-1234-567812345678",
            "user_id": "u1",
            "event_type": "login",
            "ts": "2024-01-15T12:00:00Z",
            "schema_version": 1,
            "payload": {"ip": "10.0.0.1", "success": true, "device_id": "d1"}
        }))
        .unwrap()
    }

    #[test]
    fn codec_round_trips() {
        let event = sample_event();
        let bytes = serialize_event(&event);
        let decoded = deserialize_event(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn key_is_user_id_bytes() {
        let event = sample_event();
        assert_eq!(message_key(&event), b"u1");
    }

    #[test]
    fn wire_value_carries_utc_timestamp() {
        let event = sample_event();
        let text = String::from_utf8(serialize_event(&event)).unwrap();
        assert!(text.contains("2024-01-15T12:00:00Z"), "value: {text}");
        assert!(text.contains("\"event_type\":\"login\""));
    }
}
