//! Zhipu egress adapter
//!
//! Calls the `invoke` / `sse-invoke` model endpoints with a short-lived
//! HS256-signed token drawn from the shared [`TokenCache`]. Prompts fold
//! system turns the same way Spark does; streamed events carry incremental
//! text fragments and a terminal `finish` event.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use crate::prompt::{DEFAULT_SYSTEM_TEMPLATE, fold_system_messages};
use crate::sign::TokenCache;
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::EventStream;
use futures::StreamExt;
use parley_core::{
    ChatAdapter, ChatMessage, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts,
    ResponseStream, Result,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Zhipu adapter configuration
#[derive(Debug, Clone)]
pub struct ZhipuConfig {
    /// Credential in `<key>.<secret>` form
    pub api_key: String,

    /// Upstream model, e.g. chatglm_turbo
    pub model: String,

    /// Template for folded system turns
    pub system_template: String,

    /// Base URL (default: https://open.bigmodel.cn/api/paas/v3/model-api)
    pub base_url: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl ZhipuConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            base_url: "https://open.bigmodel.cn/api/paas/v3/model-api".to_string(),
            client_config: HttpClientConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Zhipu adapter
pub struct ZhipuApiAdapter {
    config: ZhipuConfig,
    client: Client,
    tokens: Arc<TokenCache>,
}

#[derive(Debug, Serialize)]
struct ZhipuRequest {
    prompt: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ZhipuResponse {
    data: ZhipuData,
}

#[derive(Debug, Deserialize)]
struct ZhipuData {
    request_id: String,
    usage: ZhipuUsage,
    choices: Vec<ZhipuChoice>,
}

#[derive(Debug, Deserialize)]
struct ZhipuUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ZhipuChoice {
    content: String,
}

/// The vendor treats `top_p == 1` as out of range; its own default is 0.7.
fn clamp_top_p(top_p: Option<f32>) -> Option<f32> {
    top_p.map(|p| if p >= 1.0 { 0.7 } else { p })
}

impl ZhipuApiAdapter {
    pub fn new(config: ZhipuConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    fn endpoint(&self, stream: bool) -> String {
        let method = if stream { "sse-invoke" } else { "invoke" };
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            method
        )
    }
}

#[async_trait]
impl ChatAdapter for ZhipuApiAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let prompt = fold_system_messages(&request.messages, &self.config.system_template)?;
        let token = self.tokens.token(&self.config.api_key)?;
        debug!(model = %self.config.model, stream = request.stream, "dispatching Zhipu request");

        let vendor_request = ZhipuRequest {
            prompt,
            temperature: request.temperature,
            top_p: clamp_top_p(request.top_p),
        };

        let timeout_secs = self.config.client_config.timeout_secs;
        let response = self
            .client
            .post(self.endpoint(request.stream))
            .header("Authorization", token)
            .header("Accept", "application/json")
            .json(&vendor_request)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))?;
        let response = error_for_status(response).await?;

        if request.stream {
            let model = self.config.model.clone();
            Ok(Box::pin(try_stream! {
                let mut events = Box::pin(EventStream::new(response.bytes_stream()));
                while let Some(event) = events.next().await {
                    let event =
                        event.map_err(|e| Error::Transport(format!("SSE stream error: {e}")))?;
                    let finished = event.event == "finish";
                    if event.data.is_empty() && !finished {
                        continue;
                    }
                    yield ChatResponse::chunk(
                        event.data,
                        &model,
                        0,
                        ResponseParts {
                            id: Some(format!("chatcmpl-{}", event.id)),
                            finish_reason: finished.then_some(FinishReason::Stop),
                            ..Default::default()
                        },
                    );
                    if finished {
                        break;
                    }
                }
            }))
        } else {
            let body: ZhipuResponse = response
                .json()
                .await
                .map_err(|e| Error::MalformedFrame(format!("invalid completion body: {e}")))?;
            let content = body
                .data
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.content)
                .ok_or(Error::NoResponse)?;
            let completion = ChatResponse::completion(
                content,
                &self.config.model,
                ResponseParts {
                    id: Some(body.data.request_id),
                    prompt_tokens: body.data.usage.prompt_tokens,
                    completion_tokens: Some(body.data.usage.completion_tokens),
                    ..Default::default()
                },
            );
            Ok(Box::pin(futures::stream::iter([Ok(completion)])))
        }
    }
}
