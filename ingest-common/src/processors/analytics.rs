use crate::capability::{Capability, DispatchTargets};
use crate::envelope::{Envelope, EventClass, MetricBody};
use crate::schema::{FieldKind, FieldRule, Schema};
use crate::store::{RecordKey, TtlPolicy};

static SCHEMA: Schema = Schema::new(&[
    FieldRule::required("type", FieldKind::String),
    FieldRule::required("payload", FieldKind::Object),
    FieldRule::optional("source", FieldKind::String),
]);

const DEFAULT_SOURCE: &str = "analytics";

/// Analytics metrics, stored per metric series in timestamp order.
pub struct AnalyticsProcessor {}

impl Capability for AnalyticsProcessor {
    type Body = MetricBody;

    fn class(&self) -> EventClass {
        EventClass::Analytics
    }

    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)] {
        &[("metricId", "id"), ("metricType", "type")]
    }

    fn discriminator_fields(&self) -> &'static [&'static str] {
        &["type"]
    }

    fn key(&self, envelope: &Envelope<MetricBody>) -> RecordKey {
        RecordKey::composite(
            envelope.body.metric_type.as_str(),
            format!("{}#{}", envelope.timestamp, envelope.id),
        )
    }

    fn ttl(&self) -> TtlPolicy {
        TtlPolicy::ANALYTICS
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets::BUS_AND_QUEUE
    }

    fn bus_route(&self, body: &MetricBody) -> (String, String) {
        (
            body.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_owned()),
            body.metric_type.clone(),
        )
    }
}
