//! Best-effort status notifications.
//!
//! A failed publish is returned as an error so the caller can log it, and is then dropped.
//! It never changes the outcome of an invocation.
use std::time;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::envelope::EventClass;
use crate::error::NotificationError;
use crate::sinks::Attributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Success,
    Error,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Success => "SUCCESS",
            NotificationStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub message: Value,
    pub attributes: Attributes,
}

impl Notification {
    /// Subject reads `"<Unit>: <STATUS> - <discriminator> (<id>)"`.
    pub fn new(
        class: EventClass,
        status: NotificationStatus,
        discriminator: &str,
        id: &str,
        message: Value,
        mut attributes: Attributes,
    ) -> Self {
        attributes.insert("status".to_owned(), status.as_str().into());
        Self {
            subject: format!(
                "{}: {} - {} ({})",
                class.unit_name(),
                status.as_str(),
                discriminator,
                id
            ),
            message,
            attributes,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Publish, then log and drop any failure. Returns whether the notification went out.
pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    notification: &Notification,
    timeout: time::Duration,
) -> bool {
    let error = match tokio::time::timeout(timeout, notifier.publish(notification)).await {
        Ok(Ok(())) => return true,
        Ok(Err(error)) => error.to_string(),
        Err(_) => format!("timed out after {timeout:?}"),
    };

    warn!(
        subject = %notification.subject,
        "dropping notification: {}", error
    );
    counter!("ingest_notifications_dropped_total").increment(1);
    false
}

/// POSTs `{subject, message, attributes}` as JSON to a topic endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: reqwest::Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await
            .map_err(|e| NotificationError::Request(e.to_string()))?;

        response
            .error_for_status_ref()
            .map_err(|_| NotificationError::Status(response.status().as_u16()))?;

        Ok(())
    }
}

/// Logs notifications. Used when no topic endpoint is configured.
pub struct LogNotifier {}

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            subject = %notification.subject,
            "notification: {}", notification.message
        );
        Ok(())
    }
}
