//! Envelope types shared by every processing unit.
//!
//! Raw input arrives as untyped JSON (HTTP body, queue message body or a direct call). It is
//! validated against the class schema, deserialized into the class body and wrapped into an
//! `Envelope` carrying the identifiers and metadata stamped by the enricher.
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// The five processing units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Event,
    UserEvent,
    Analytics,
    MlInference,
    Batch,
}

impl EventClass {
    pub const ALL: [EventClass; 5] = [
        EventClass::Event,
        EventClass::UserEvent,
        EventClass::Analytics,
        EventClass::MlInference,
        EventClass::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Event => "event",
            EventClass::UserEvent => "user_event",
            EventClass::Analytics => "analytics",
            EventClass::MlInference => "ml_inference",
            EventClass::Batch => "batch",
        }
    }

    /// Name used as the notification subject prefix and as the `processor` metadata value.
    pub fn unit_name(&self) -> &'static str {
        match self {
            EventClass::Event => "Event Processor",
            EventClass::UserEvent => "User Event Processor",
            EventClass::Analytics => "Analytics Processor",
            EventClass::MlInference => "ML Processor",
            EventClass::Batch => "Batch Processor",
        }
    }

    /// Logical table holding the primary record of this class.
    pub fn table(&self) -> &'static str {
        match self {
            EventClass::Event => "events",
            EventClass::UserEvent => "user_events",
            EventClass::Analytics => "analytics_metrics",
            EventClass::MlInference => "ml_models",
            EventClass::Batch => "batch_jobs",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("{s} is not a valid EventClass"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Bedrock,
    Sagemaker,
    Custom,
}

impl ModelType {
    pub const NAMES: &'static [&'static str] = &["bedrock", "sagemaker", "custom"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Bedrock => "bedrock",
            ModelType::Sagemaker => "sagemaker",
            ModelType::Custom => "custom",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    DataExport,
    DataImport,
    DataCleanup,
    ReportGeneration,
    NotificationSend,
    BackupCreation,
}

impl BatchOperation {
    pub const NAMES: &'static [&'static str] = &[
        "data_export",
        "data_import",
        "data_cleanup",
        "report_generation",
        "notification_send",
        "backup_creation",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::DataExport => "data_export",
            BatchOperation::DataImport => "data_import",
            BatchOperation::DataCleanup => "data_cleanup",
            BatchOperation::ReportGeneration => "report_generation",
            BatchOperation::NotificationSend => "notification_send",
            BatchOperation::BackupCreation => "backup_creation",
        }
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated and enriched unit of work. `B` is the class-specific body, flattened into the
/// same JSON object as the common identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<B> {
    pub id: String,
    pub timestamp: String,
    pub correlation_id: String,
    pub environment: String,
    pub region: String,
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub body: B,
}

/// Generic events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub payload: Map<String, Value>,
}

/// User events: a generic event bound to a user and a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: Map<String, Value>,
}

/// Analytics metrics. `type` names the metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBody {
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub payload: Map<String, Value>,
}

fn default_model_version() -> String {
    "latest".to_owned()
}

/// ML inference requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceBody {
    pub model_id: String,
    #[serde(default = "default_model_version")]
    pub version: String,
    pub model_type: ModelType,
    pub input_data: Map<String, Value>,
}

/// Batch jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBody {
    pub batch_id: String,
    pub operation: BatchOperation,
    pub items: Vec<Value>,
}

/// Per-invocation values that do not come from the envelope body.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Inbound request id (HTTP request id header or queue delivery id).
    pub request_id: String,
    /// Correlation id supplied out of band (header or message attribute), wins over the body.
    pub correlation_id: Option<String>,
    pub started: Instant,
}

impl InvocationContext {
    pub fn new(request_id: Option<String>, correlation_id: Option<String>) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(new_id),
            correlation_id: correlation_id.filter(|id| !id.is_empty()),
            started: Instant::now(),
        }
    }

    /// Out-of-band id first, then the body's `correlationId`, then a fresh one.
    pub fn resolve_correlation_id(&self, raw: &Value) -> String {
        if let Some(id) = &self.correlation_id {
            return id.clone();
        }
        raw.get("correlationId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(new_id)
    }
}

/// Identifiers are UUIDv7 so that generated keys sort by creation time.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Parse a raw request or message body. Anything that is not JSON is a malformed request.
pub fn parse_body(bytes: &[u8]) -> Result<Value, ValidationError> {
    serde_json::from_slice(bytes).map_err(|e| {
        tracing::debug!("failed to parse body: {}", e);
        ValidationError::Malformed(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_flattens_body() {
        let envelope = Envelope {
            id: "evt-1".to_owned(),
            timestamp: "2024-05-01T10:00:00Z".to_owned(),
            correlation_id: "corr-1".to_owned(),
            environment: "test".to_owned(),
            region: "eu-west-1".to_owned(),
            metadata: Map::new(),
            body: EventBody {
                event_type: "user.login".to_owned(),
                source: "web".to_owned(),
                payload: json!({"userId": "u1"}).as_object().unwrap().clone(),
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "user.login");
        assert_eq!(value["correlationId"], "corr-1");
        assert_eq!(value["payload"]["userId"], "u1");

        let back: Envelope<EventBody> = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn inference_version_defaults_to_latest() {
        let body: InferenceBody = serde_json::from_value(json!({
            "modelId": "m1",
            "modelType": "sagemaker",
            "inputData": {"x": 1}
        }))
        .unwrap();
        assert_eq!(body.version, "latest");
        assert_eq!(body.model_type, ModelType::Sagemaker);
    }

    #[test]
    fn correlation_id_prefers_out_of_band_value() {
        let raw = json!({"correlationId": "from-body"});

        let ctx = InvocationContext::new(None, Some("from-header".to_owned()));
        assert_eq!(ctx.resolve_correlation_id(&raw), "from-header");

        let ctx = InvocationContext::new(None, Some(String::new()));
        assert_eq!(ctx.resolve_correlation_id(&raw), "from-body");

        let generated = ctx.resolve_correlation_id(&json!({}));
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn event_class_round_trips_through_str() {
        for class in EventClass::ALL {
            assert_eq!(class.as_str().parse::<EventClass>(), Ok(class));
        }
        assert!("metrics".parse::<EventClass>().is_err());
    }

    #[test]
    fn parse_body_rejects_invalid_json() {
        assert!(matches!(
            parse_body(b"{not json"),
            Err(ValidationError::Malformed(_))
        ));
        assert_eq!(parse_body(b"{\"a\":1}").unwrap(), json!({"a": 1}));
    }
}
