//! HTTP backend for an Ollama-compatible local model server.

use serde::{Deserialize, Serialize};

use super::{InferenceBackend, InferenceError, PromptContext};

/// Client for a local model server speaking the Ollama generate API.
pub struct HttpBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpBackend {
    /// Point at a server instance. The HTTP-level timeout is a backstop;
    /// the engine enforces its own per-attempt deadline on top.
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| InferenceError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    /// Default local instance at the standard Ollama port.
    pub fn default_local(model: &str) -> Result<Self, InferenceError> {
        Self::new("http://localhost:11434", model, 300)
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::BackendUnavailable(format!(
                "server returned {status}: {body}"
            )));
        }

        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn map_transport_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                elapsed_secs: self.timeout_secs,
            }
        } else if e.is_connect() {
            InferenceError::BackendUnavailable(format!("cannot reach {}", self.base_url))
        } else {
            InferenceError::BackendUnavailable(e.to_string())
        }
    }
}

/// Request body for /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Response body from /api/tags
#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[async_trait::async_trait]
impl InferenceBackend for HttpBackend {
    async fn infer(&self, prompt: &PromptContext) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt.user,
            system: &prompt.system,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::BackendUnavailable(format!(
                "server returned {status}: {body}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

        Ok(parsed.response)
    }

    async fn healthy(&self) -> Result<(), InferenceError> {
        let models = self.list_models().await?;
        if models.iter().any(|m| m.starts_with(&self.model)) {
            Ok(())
        } else {
            Err(InferenceError::BackendUnavailable(format!(
                "model '{}' is not loaded on {}",
                self.model, self.base_url
            )))
        }
    }
}
