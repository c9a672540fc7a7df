//! The per-class capability set plugged into the generic `Pipeline`.
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::{Envelope, EventClass};
use crate::error::PipelineError;
use crate::pipeline::Dependencies;
use crate::response::Step;
use crate::schema::Schema;
use crate::sinks::{AttributeValue, Attributes};
use crate::store::{RecordKey, TtlPolicy};

/// Which sinks an invocation must reach. Each enabled sink is a required postcondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTargets {
    pub bus: bool,
    pub queue: bool,
}

impl DispatchTargets {
    pub const BUS_AND_QUEUE: DispatchTargets = DispatchTargets {
        bus: true,
        queue: true,
    };
    pub const QUEUE_ONLY: DispatchTargets = DispatchTargets {
        bus: false,
        queue: true,
    };
}

#[async_trait]
pub trait Capability: Send + Sync + 'static {
    type Body: Serialize + DeserializeOwned + Clone + Send + Sync;

    fn class(&self) -> EventClass;

    fn schema(&self) -> &'static Schema;

    /// `(response field, envelope field)` pairs echoed back to the caller.
    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)];

    /// Envelope fields mirrored into message attributes. The first one names the
    /// notification subject.
    fn discriminator_fields(&self) -> &'static [&'static str];

    fn key(&self, envelope: &Envelope<Self::Body>) -> RecordKey;

    fn ttl(&self) -> TtlPolicy;

    fn targets(&self) -> DispatchTargets;

    /// `(source, detail type)` used by bus subscribers to route the envelope.
    fn bus_route(&self, _body: &Self::Body) -> (String, String) {
        (
            format!("ingest.{}", self.class()),
            self.class().as_str().to_owned(),
        )
    }

    /// Fill class-specific optional fields before enrichment.
    fn prepare(&self, _body: &mut Self::Body) {}

    /// Whether the primary record follows the `processing -> completed | failed` machine.
    fn tracks_status(&self) -> bool {
        false
    }

    /// Class stage between bus dispatch and the status update. The returned value becomes
    /// the `result` of the record and of the response.
    async fn process(
        &self,
        _envelope: &Envelope<Self::Body>,
        _deps: &Dependencies,
        _steps: &mut Vec<Step>,
    ) -> Result<Option<Value>, PipelineError> {
        Ok(None)
    }
}

/// Pick the identifier fields out of an envelope (or raw input, when the invocation failed
/// before enrichment).
pub fn identifiers(
    fields: &[(&'static str, &'static str)],
    source: &Value,
) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|(name, field)| match source.get(*field) {
            None | Some(Value::Null) => None,
            Some(value) => Some(((*name).to_owned(), value.clone())),
        })
        .collect()
}

/// First discriminator value, or `unknown` when the input never carried it.
pub fn subject_discriminator(fields: &[&'static str], source: &Value) -> String {
    fields
        .first()
        .and_then(|field| source.get(*field))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned()
}

/// Message attributes shared by the bus and the queue.
pub fn message_attributes(
    class: EventClass,
    fields: &[&'static str],
    envelope: &Value,
) -> Attributes {
    let mut attributes = Attributes::new();
    for field in fields {
        if let Some(value) = envelope.get(*field).and_then(Value::as_str) {
            attributes.insert((*field).to_owned(), value.into());
        }
    }
    for field in ["correlationId", "environment"] {
        if let Some(value) = envelope.get(field).and_then(Value::as_str) {
            attributes.insert(field.to_owned(), value.into());
        }
    }
    attributes.insert(
        crate::queue::EVENT_CLASS_ATTRIBUTE.to_owned(),
        AttributeValue::from(class.as_str()),
    );
    attributes
}
