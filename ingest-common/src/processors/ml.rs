use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{Capability, DispatchTargets};
use crate::envelope::{Envelope, EventClass, InferenceBody, ModelType};
use crate::error::{DispatchError, PipelineError};
use crate::model_router::ModelRouter;
use crate::pipeline::{with_timeout, Dependencies};
use crate::response::Step;
use crate::schema::{FieldKind, FieldRule, Schema};
use crate::store::{Record, RecordKey, TtlPolicy};

pub const FEATURES_TABLE: &str = "ml_features";

static SCHEMA: Schema = Schema::new(&[
    FieldRule::required("modelId", FieldKind::String),
    FieldRule::required("modelType", FieldKind::String).one_of(ModelType::NAMES),
    FieldRule::required("inputData", FieldKind::Object),
    FieldRule::optional("version", FieldKind::String),
]);

/// ML inference requests. The model record is status-tracked around the backend call, and
/// a feature record mirrors input and output of every successful inference.
pub struct MlProcessor {
    router: ModelRouter,
}

impl MlProcessor {
    pub fn new(router: ModelRouter) -> Self {
        Self { router }
    }
}

/// Feature records are keyed per model and invocation, so they are written once.
pub fn feature_key(model_id: &str, correlation_id: &str) -> RecordKey {
    RecordKey::new(format!("{model_id}#{correlation_id}"))
}

#[async_trait]
impl Capability for MlProcessor {
    type Body = InferenceBody;

    fn class(&self) -> EventClass {
        EventClass::MlInference
    }

    fn schema(&self) -> &'static Schema {
        &SCHEMA
    }

    fn identifier_fields(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("modelId", "modelId"),
            ("version", "version"),
            ("modelType", "modelType"),
        ]
    }

    fn discriminator_fields(&self) -> &'static [&'static str] {
        &["modelType", "modelId"]
    }

    fn key(&self, envelope: &Envelope<InferenceBody>) -> RecordKey {
        RecordKey::composite(
            envelope.body.model_id.as_str(),
            envelope.body.version.as_str(),
        )
    }

    fn ttl(&self) -> TtlPolicy {
        TtlPolicy::ML_MODELS
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets::QUEUE_ONLY
    }

    fn tracks_status(&self) -> bool {
        true
    }

    async fn process(
        &self,
        envelope: &Envelope<InferenceBody>,
        deps: &Dependencies,
        steps: &mut Vec<Step>,
    ) -> Result<Option<Value>, PipelineError> {
        let output = with_timeout(
            "route_model",
            deps.io_timeout,
            self.router.route(&envelope.body),
        )
        .await?;
        steps.push(Step::RouteModel);

        let record = Record::new(
            FEATURES_TABLE,
            feature_key(&envelope.body.model_id, &envelope.correlation_id),
            json!({
                "modelId": envelope.body.model_id,
                "version": envelope.body.version,
                "correlationId": envelope.correlation_id,
                "inputFeatures": envelope.body.input_data,
                "outputFeatures": output.output,
                "timestamp": envelope.timestamp,
            }),
            TtlPolicy::FEATURES,
            deps.time.now(),
        );
        with_timeout("store_features", deps.io_timeout, deps.store.put(record)).await?;
        steps.push(Step::StoreFeatures);

        let result = serde_json::to_value(&output)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn unknown_model_types_fail_validation() {
        let raw = json!({"modelId": "m1", "modelType": "unknown", "inputData": {}});
        assert!(matches!(
            SCHEMA.validate(&raw),
            Err(ValidationError::InvalidValue { field, .. }) if field == "modelType"
        ));
    }

    #[test]
    fn feature_key_joins_model_and_correlation() {
        assert_eq!(feature_key("m1", "corr-1").to_string(), "m1#corr-1");
    }
}
