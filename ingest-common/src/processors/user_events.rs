use crate::capability::{Capability, DispatchTargets};
use crate::envelope::{new_id, Envelope, EventClass, UserEventBody};
use crate::schema::{FieldKind, FieldRule, Schema};
use crate::store::{RecordKey, TtlPolicy};

static SCHEMA: Schema = Schema::new(&[
    FieldRule::required("type", FieldKind::String),
    FieldRule::required("source", FieldKind::String),
    FieldRule::required("userId", FieldKind::String),
    FieldRule::required("payload", FieldKind::Object),
    FieldRule::optional("sessionId", FieldKind::String),
]);

/// Events bound to a user. Stored per user in timestamp order, sessions generated if absent.
pub struct UserEventProcessor {}

impl Capability for UserEventProcessor {
    type Body = UserEventBody;

    fn class(&self) -> EventClass {
        EventClass::UserEvent
    }

    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("eventId", "id"),
            ("userId", "userId"),
            ("sessionId", "sessionId"),
            ("eventType", "type"),
        ]
    }

    fn discriminator_fields(&self) -> &'static [&'static str] {
        &["type", "userId"]
    }

    fn key(&self, envelope: &Envelope<UserEventBody>) -> RecordKey {
        RecordKey::composite(
            envelope.body.user_id.as_str(),
            format!("{}#{}", envelope.timestamp, envelope.id),
        )
    }

    fn ttl(&self) -> TtlPolicy {
        TtlPolicy::USER_EVENTS
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets::BUS_AND_QUEUE
    }

    fn bus_route(&self, body: &UserEventBody) -> (String, String) {
        (body.source.clone(), body.event_type.clone())
    }

    fn prepare(&self, body: &mut UserEventBody) {
        if body.session_id.as_deref().map_or(true, str::is_empty) {
            body.session_id = Some(new_id());
        }
    }
}
