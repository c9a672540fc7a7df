use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::envelope::{new_id, Envelope, EventClass};
use crate::time::{parse_iso8601, rfc3339};

/// Fills optional identifiers and stamps processing metadata. Pure apart from id generation
/// for envelopes that arrive without one.
#[derive(Debug, Clone)]
pub struct Enricher {
    pub environment: String,
    pub region: String,
    pub processor_version: String,
}

impl Enricher {
    pub fn new(environment: &str, region: &str) -> Self {
        Self {
            environment: environment.to_owned(),
            region: region.to_owned(),
            processor_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Wrap a validated body. Caller metadata is kept, but the system keys
    /// (`processor`, `processorVersion`, `requestId`, `processedAt`) always win.
    pub fn enrich<B>(
        &self,
        class: EventClass,
        raw: &Map<String, Value>,
        body: B,
        correlation_id: String,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Envelope<B> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(new_id);

        let timestamp = raw
            .get("timestamp")
            .and_then(Value::as_str)
            .filter(|ts| parse_iso8601(ts).is_some())
            .map(String::from)
            .unwrap_or_else(|| rfc3339(now));

        let mut metadata = raw
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        metadata.insert("processor".to_owned(), class.unit_name().into());
        metadata.insert(
            "processorVersion".to_owned(),
            self.processor_version.clone().into(),
        );
        metadata.insert("requestId".to_owned(), request_id.into());
        metadata.insert("processedAt".to_owned(), rfc3339(now).into());

        Envelope {
            id,
            timestamp,
            correlation_id,
            environment: self.environment.clone(),
            region: self.region.clone(),
            metadata,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventBody;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn body() -> EventBody {
        EventBody {
            event_type: "user.login".to_owned(),
            source: "web".to_owned(),
            payload: json!({"userId": "u1"}).as_object().unwrap().clone(),
        }
    }

    fn enrich(raw: Value) -> Envelope<EventBody> {
        Enricher::new("test", "eu-west-1").enrich(
            EventClass::Event,
            raw.as_object().unwrap(),
            body(),
            "corr-1".to_owned(),
            "req-1",
            now(),
        )
    }

    #[test]
    fn fills_missing_identifiers() {
        let envelope = enrich(json!({"type": "user.login"}));

        assert!(uuid::Uuid::parse_str(&envelope.id).is_ok());
        assert_eq!(envelope.timestamp, "2024-05-01T12:00:00.000Z");
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(envelope.environment, "test");
        assert_eq!(envelope.region, "eu-west-1");
        assert_eq!(envelope.body, body());
    }

    #[test]
    fn keeps_caller_identifiers() {
        let envelope = enrich(json!({"id": "evt-1", "timestamp": "2024-04-30T08:00:00Z"}));
        assert_eq!(envelope.id, "evt-1");
        assert_eq!(envelope.timestamp, "2024-04-30T08:00:00Z");
    }

    #[test]
    fn keeps_iso8601_timestamps_verbatim() {
        for timestamp in ["2024-04-30T08:00:00", "2024-04-30T08:00:00+0100", "2024-04-30"] {
            let envelope = enrich(json!({"timestamp": timestamp}));
            assert_eq!(envelope.timestamp, timestamp);
        }
    }

    #[test]
    fn unparseable_timestamp_becomes_ingestion_time() {
        let envelope = enrich(json!({"timestamp": "yesterday"}));
        assert_eq!(envelope.timestamp, "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn system_metadata_wins() {
        let envelope = enrich(json!({
            "id": "evt-1",
            "metadata": {"processor": "spoofed", "team": "growth"}
        }));

        assert_eq!(envelope.metadata["processor"], "Event Processor");
        assert_eq!(envelope.metadata["team"], "growth");
        assert_eq!(envelope.metadata["requestId"], "req-1");
        assert_eq!(envelope.metadata["processedAt"], "2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn deterministic_apart_from_generated_ids() {
        let raw = json!({"id": "evt-1", "timestamp": "2024-04-30T08:00:00Z"});
        assert_eq!(enrich(raw.clone()), enrich(raw));
    }
}
