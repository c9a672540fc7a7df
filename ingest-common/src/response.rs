use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pipeline stages, reported in `stepsCompleted` in the order they finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Extract,
    Validate,
    Enrich,
    Persist,
    DispatchBus,
    RouteModel,
    StoreFeatures,
    ProcessBatch,
    UpdateStatus,
    Enqueue,
    Notify,
}

/// Outbound response of every invocation, whatever the inbound path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResponse {
    pub success: bool,
    /// Class identifiers: `eventId`, `userId`, `modelId`, `batchId`, ...
    #[serde(flatten)]
    pub identifiers: Map<String, Value>,
    pub correlation_id: String,
    /// Milliseconds since the invocation started.
    pub processing_time: u64,
    pub steps_completed: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub timestamp: String,
    /// Whether redelivering the same input may succeed. Not part of the wire format.
    #[serde(skip)]
    pub retryable: bool,
}

impl ProcessingResponse {
    pub fn has_step(&self, step: Step) -> bool {
        self.steps_completed.contains(&step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn serializes_flat_camel_case() {
        let response = ProcessingResponse {
            success: false,
            identifiers: json!({"eventId": "evt-1"}).as_object().unwrap().clone(),
            correlation_id: "corr-1".to_owned(),
            processing_time: 12,
            steps_completed: vec![Step::Extract, Step::Validate],
            error: Some("missing required fields: payload".to_owned()),
            message: "Event processing failed".to_owned(),
            result: None,
            timestamp: "2024-05-01T12:00:00.000Z".to_owned(),
            retryable: false,
        };

        assert_json_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "success": false,
                "eventId": "evt-1",
                "correlationId": "corr-1",
                "processingTime": 12,
                "stepsCompleted": ["extract", "validate"],
                "error": "missing required fields: payload",
                "message": "Event processing failed",
                "timestamp": "2024-05-01T12:00:00.000Z"
            })
        );
    }
}
