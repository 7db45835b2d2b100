//! Anthropic egress adapter (text completions API)
//!
//! The API takes a single role-tagged prompt instead of structured messages,
//! so the conversation is concatenated into `\n\nHuman:` / `\n\nAssistant:`
//! turns. Streamed SSE events carry incremental `completion` text; an event
//! with a `stop_reason` ends the turn.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::EventStream;
use futures::StreamExt;
use parley_core::{
    ChatAdapter, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts, ResponseStream,
    Result, Role,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Anthropic adapter configuration
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,

    /// API version header value, e.g. 2023-06-01
    pub api_version: String,

    /// Upstream model; canonical model names are aliased when unset.
    pub model: Option<String>,

    /// Base URL (default: https://api.anthropic.com)
    pub base_url: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_version: api_version.into(),
            model: None,
            base_url: "https://api.anthropic.com".to_string(),
            client_config: HttpClientConfig::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Anthropic adapter
pub struct AnthropicAdapter {
    config: AnthropicConfig,
    client: Client,
}

#[derive(Debug, Clone, Serialize)]
struct CompleteRequest {
    model: String,
    prompt: String,
    max_tokens_to_sample: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    #[serde(default)]
    completion: String,
    stop_reason: Option<String>,
}

const MAX_TOKENS_DEFAULT: u32 = 100_000;

fn alias_model(canonical: &str) -> &'static str {
    match canonical {
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0613" => "claude-instant-1",
        _ => "claude-2",
    }
}

fn map_stop_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "max_tokens" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Concatenate the conversation into a role-tagged prompt ending with an
/// open assistant turn.
fn messages_to_prompt(request: &ChatRequest) -> Result<String> {
    let mut prompt = String::new();
    for message in &request.messages {
        let tag = match message.role {
            Role::System | Role::User => "Human",
            Role::Assistant => "Assistant",
            Role::Function => {
                return Err(Error::UnsupportedRole("function".to_string()));
            }
        };
        prompt.push_str(&format!("\n\n{}: {}", tag, message.text()));
    }
    prompt.push_str("\n\nAssistant: ");
    Ok(prompt)
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/complete", self.config.base_url.trim_end_matches('/'))
    }

    fn model(&self, request: &ChatRequest) -> String {
        self.config
            .model
            .clone()
            .unwrap_or_else(|| alias_model(&request.model).to_string())
    }

    fn to_vendor_request(&self, request: &ChatRequest) -> Result<CompleteRequest> {
        Ok(CompleteRequest {
            model: self.model(request),
            prompt: messages_to_prompt(request)?,
            max_tokens_to_sample: request.max_tokens.unwrap_or(MAX_TOKENS_DEFAULT),
            stop_sequences: request.stop.clone(),
            temperature: request.temperature,
            stream: request.stream.then_some(true),
        })
    }
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let vendor_request = self.to_vendor_request(&request)?;
        let model = vendor_request.model.clone();
        debug!(model = %model, stream = request.stream, "dispatching Anthropic request");

        let timeout_secs = self.config.client_config.timeout_secs;
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header("accept", "application/json")
            .json(&vendor_request)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))?;
        let response = error_for_status(response).await?;

        if request.stream {
            Ok(Box::pin(try_stream! {
                let mut events = Box::pin(EventStream::new(response.bytes_stream()));
                while let Some(event) = events.next().await {
                    let event =
                        event.map_err(|e| Error::Transport(format!("SSE stream error: {e}")))?;
                    if event.data == "[DONE]" {
                        break;
                    }
                    if event.data.is_empty() {
                        continue;
                    }
                    let frame: CompleteResponse = serde_json::from_str(&event.data)
                        .map_err(|e| Error::MalformedFrame(format!("invalid completion event: {e}")))?;
                    if let Some(stop_reason) = frame.stop_reason {
                        yield ChatResponse::chunk(
                            "",
                            &model,
                            0,
                            ResponseParts {
                                finish_reason: Some(map_stop_reason(&stop_reason)),
                                ..Default::default()
                            },
                        );
                        break;
                    }
                    if !frame.completion.is_empty() {
                        yield ChatResponse::chunk(frame.completion, &model, 0, ResponseParts::default());
                    }
                }
            }))
        } else {
            let body: CompleteResponse = response
                .json()
                .await
                .map_err(|e| Error::MalformedFrame(format!("invalid completion body: {e}")))?;
            let finish_reason = body.stop_reason.as_deref().map(map_stop_reason);
            let completion = ChatResponse::completion(
                body.completion,
                &model,
                ResponseParts {
                    finish_reason,
                    ..Default::default()
                },
            );
            Ok(Box::pin(futures::stream::iter([Ok(completion)])))
        }
    }
}
