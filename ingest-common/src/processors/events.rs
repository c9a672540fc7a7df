use crate::capability::{Capability, DispatchTargets};
use crate::envelope::{EventBody, EventClass, Envelope};
use crate::schema::{FieldKind, FieldRule, Schema};
use crate::store::{RecordKey, TtlPolicy};

static SCHEMA: Schema = Schema::new(&[
    FieldRule::required("type", FieldKind::String),
    FieldRule::required("source", FieldKind::String),
    FieldRule::required("payload", FieldKind::Object),
]);

/// Generic events, keyed by id and fanned out to the bus and the queue.
pub struct EventProcessor {}

impl Capability for EventProcessor {
    type Body = EventBody;

    fn class(&self) -> EventClass {
        EventClass::Event
    }

    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)] {
        &[("eventId", "id"), ("eventType", "type"), ("source", "source")]
    }

    fn discriminator_fields(&self) -> &'static [&'static str] {
        &["type"]
    }

    fn key(&self, envelope: &Envelope<EventBody>) -> RecordKey {
        RecordKey::new(envelope.id.as_str())
    }

    fn ttl(&self) -> TtlPolicy {
        TtlPolicy::GENERIC_EVENTS
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets::BUS_AND_QUEUE
    }

    fn bus_route(&self, body: &EventBody) -> (String, String) {
        (body.source.clone(), body.event_type.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use serde_json::json;

    #[test]
    fn payload_is_required() {
        let raw = json!({"type": "user.login", "source": "web"});
        assert_eq!(
            EventProcessor {}.schema().validate(&raw),
            Err(ValidationError::MissingFields(vec!["payload".to_owned()]))
        );
    }
}
