//! Model routing for ML inference requests.
//!
//! The router only switches over `modelType`; what a backend does with the input is opaque.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::envelope::{InferenceBody, ModelType};
use crate::error::BackendError;

/// Result of a successful routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceOutput {
    pub success: bool,
    pub output: Value,
    pub model_type: ModelType,
    pub model_id: String,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(&self, request: &InferenceBody) -> Result<Value, BackendError>;
}

/// Any backend reachable over HTTP: the body `{modelId, version, modelType, inputData}` is
/// POSTed as JSON and the JSON response is the model output.
pub struct HttpModelBackend {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    model_type: ModelType,
}

impl HttpModelBackend {
    pub fn new(client: reqwest::Client, endpoint: reqwest::Url, model_type: ModelType) -> Self {
        Self {
            client,
            endpoint,
            model_type,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn invoke(&self, request: &InferenceBody) -> Result<Value, BackendError> {
        let request_error = |e: reqwest::Error| BackendError::Request {
            model_type: self.model_type,
            message: e.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                model_type: self.model_type,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        response.json::<Value>().await.map_err(request_error)
    }
}

/// Switch from `modelType` to the backend serving it. Kinds without a backend fail as a
/// dependency error.
#[derive(Clone, Default)]
pub struct ModelRouter {
    bedrock: Option<Arc<dyn ModelBackend>>,
    sagemaker: Option<Arc<dyn ModelBackend>>,
    custom: Option<Arc<dyn ModelBackend>>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, model_type: ModelType, backend: Arc<dyn ModelBackend>) -> Self {
        *self.slot(model_type) = Some(backend);
        self
    }

    fn slot(&mut self, model_type: ModelType) -> &mut Option<Arc<dyn ModelBackend>> {
        match model_type {
            ModelType::Bedrock => &mut self.bedrock,
            ModelType::Sagemaker => &mut self.sagemaker,
            ModelType::Custom => &mut self.custom,
        }
    }

    fn backend(&self, model_type: ModelType) -> Option<&Arc<dyn ModelBackend>> {
        match model_type {
            ModelType::Bedrock => self.bedrock.as_ref(),
            ModelType::Sagemaker => self.sagemaker.as_ref(),
            ModelType::Custom => self.custom.as_ref(),
        }
    }

    #[instrument(skip_all, fields(model_id = %request.model_id, model_type = %request.model_type))]
    pub async fn route(&self, request: &InferenceBody) -> Result<InferenceOutput, BackendError> {
        let backend = self
            .backend(request.model_type)
            .ok_or(BackendError::NotConfigured(request.model_type))?;

        let output = backend.invoke(request).await?;
        if output.get("success") == Some(&Value::Bool(false)) {
            return Err(BackendError::Unsuccessful {
                model_type: request.model_type,
            });
        }

        Ok(InferenceOutput {
            success: true,
            output,
            model_type: request.model_type,
            model_id: request.model_id.clone(),
        })
    }
}
