use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DispatchError;

pub mod kafka;
pub mod print;

/// Typed message attribute, so consumers can filter without deserializing the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dataType", content = "stringValue")]
pub enum AttributeValue {
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeValue::String(value) => value,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// A message for the content-routed bus. Subscribers route on `(source, detail_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Partitioning key: the envelope id.
    pub key: String,
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    pub attributes: Attributes,
}

#[async_trait]
pub trait RoutingBus: Send + Sync {
    /// Publish once. There is no retry loop here: an outage fails the invocation.
    async fn publish(&self, message: BusMessage) -> Result<(), DispatchError>;
}
