use async_trait::async_trait;
use serde_json::Value;

use crate::batch::BatchEngine;
use crate::capability::{Capability, DispatchTargets};
use crate::envelope::{BatchBody, BatchOperation, Envelope, EventClass};
use crate::error::{DispatchError, PipelineError};
use crate::pipeline::Dependencies;
use crate::response::Step;
use crate::schema::{FieldKind, FieldRule, Schema};
use crate::store::{RecordKey, TtlPolicy};

static SCHEMA: Schema = Schema::new(&[
    FieldRule::required("batchId", FieldKind::String),
    FieldRule::required("operation", FieldKind::String).one_of(BatchOperation::NAMES),
    FieldRule::required("items", FieldKind::Array),
]);

/// Batch jobs. The job record is status-tracked; its result is the batch report.
pub struct BatchProcessor {
    engine: BatchEngine,
}

impl BatchProcessor {
    pub fn new(engine: BatchEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Capability for BatchProcessor {
    type Body = BatchBody;

    fn class(&self) -> EventClass {
        EventClass::Batch
    }

    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)] {
        &[("batchId", "batchId"), ("operation", "operation")]
    }

    fn discriminator_fields(&self) -> &'static [&'static str] {
        &["operation", "batchId"]
    }

    fn key(&self, envelope: &Envelope<BatchBody>) -> RecordKey {
        RecordKey::new(envelope.body.batch_id.as_str())
    }

    fn ttl(&self) -> TtlPolicy {
        TtlPolicy::BATCH_JOBS
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets::QUEUE_ONLY
    }

    fn tracks_status(&self) -> bool {
        true
    }

    async fn process(
        &self,
        envelope: &Envelope<BatchBody>,
        _deps: &Dependencies,
        steps: &mut Vec<Step>,
    ) -> Result<Option<Value>, PipelineError> {
        let report = self.engine.run(envelope).await;
        steps.push(Step::ProcessBatch);

        let report = serde_json::to_value(&report)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        Ok(Some(report))
    }
}
