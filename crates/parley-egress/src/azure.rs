//! Azure OpenAI egress adapter
//!
//! Same wire shape as OpenAI but addressed per deployment, authenticated with
//! an `api-key` header, and versioned through an `api-version` query
//! parameter. The service rejects unknown request fields, so only the fields
//! it accepts are forwarded.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use crate::openai::sse_chunk_stream;
use async_trait::async_trait;
use parley_core::{ChatAdapter, ChatMessage, ChatRequest, ChatResponse, Error, ResponseStream, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

/// Azure OpenAI adapter configuration
#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Resource endpoint, e.g. https://my-resource.openai.azure.com
    pub api_base: String,

    pub api_key: String,

    /// Service API version, e.g. 2023-05-15
    pub api_version: String,

    /// Deployment name the model was published under
    pub deployment_id: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl AzureConfig {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            api_version: api_version.into(),
            deployment_id: deployment_id.into(),
            client_config: HttpClientConfig::default(),
        }
    }
}

/// Azure OpenAI adapter
pub struct AzureAdapter {
    config: AzureConfig,
    client: Client,
}

impl AzureAdapter {
    pub fn new(config: AzureConfig) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.api_base.trim_end_matches('/'),
            self.config.deployment_id,
            self.config.api_version
        )
    }
}

/// The subset of request fields the deployment endpoint accepts; the model is
/// implied by the deployment.
#[derive(Debug, Serialize)]
struct AzureChatRequest<'a> {
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

impl<'a> From<&'a ChatRequest> for AzureChatRequest<'a> {
    fn from(request: &'a ChatRequest) -> Self {
        Self {
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop.as_deref(),
            stream: request.stream,
        }
    }
}

#[async_trait]
impl ChatAdapter for AzureAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        debug!(deployment = %self.config.deployment_id, stream = request.stream, "dispatching Azure request");

        let timeout_secs = self.config.client_config.timeout_secs;
        let response = self
            .client
            .post(self.endpoint())
            .header("api-key", &self.config.api_key)
            .json(&AzureChatRequest::from(&request))
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))?;
        let response = error_for_status(response).await?;

        if request.stream {
            Ok(sse_chunk_stream(response))
        } else {
            let completion: ChatResponse = response
                .json()
                .await
                .map_err(|e| Error::MalformedFrame(format!("invalid completion body: {e}")))?;
            Ok(Box::pin(futures::stream::iter([Ok(completion)])))
        }
    }
}
