//! Qwen (DashScope) egress adapter
//!
//! Streamed events carry the *cumulative* answer text and running token
//! counts rather than increments, so the stream goes through the cumulative
//! normalizer before chunks are emitted.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::EventStream;
use futures::StreamExt;
use parley_core::{
    ChatAdapter, ChatMessage, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts,
    ResponseStream, Result, Usage,
    stream::{CumulativeText, CumulativeUsage},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";

/// Qwen adapter configuration
#[derive(Debug, Clone)]
pub struct QwenConfig {
    pub api_key: String,

    /// Upstream model, e.g. qwen-turbo
    pub model: String,

    /// Endpoint URL (default: the DashScope text-generation endpoint)
    pub endpoint: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl QwenConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            client_config: HttpClientConfig::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Qwen adapter
pub struct QwenAdapter {
    config: QwenConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct QwenRequest<'a> {
    model: &'a str,
    input: QwenInput<'a>,
    parameters: QwenParameters,
}

#[derive(Debug, Serialize)]
struct QwenInput<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Serialize)]
struct QwenParameters {
    result_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct QwenResponse {
    request_id: String,
    output: QwenOutput,
    usage: QwenUsage,
}

#[derive(Debug, Deserialize)]
struct QwenOutput {
    choices: Vec<QwenChoice>,
}

#[derive(Debug, Deserialize)]
struct QwenChoice {
    message: QwenMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QwenMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct QwenUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl QwenUsage {
    fn as_usage(&self) -> Usage {
        Usage::of(self.input_tokens, self.output_tokens)
    }
}

fn map_finish_reason(finish_reason: Option<&str>) -> Option<FinishReason> {
    match finish_reason {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        _ => None,
    }
}

impl QwenAdapter {
    pub fn new(config: QwenConfig) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChatAdapter for QwenAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        debug!(model = %self.config.model, stream = request.stream, "dispatching Qwen request");

        let vendor_request = QwenRequest {
            model: &self.config.model,
            input: QwenInput {
                messages: &request.messages,
            },
            parameters: QwenParameters {
                result_format: "message",
                temperature: request.temperature,
                top_p: request.top_p,
            },
        };

        let timeout_secs = self.config.client_config.timeout_secs;
        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&vendor_request);
        if request.stream {
            builder = builder.header("X-DashScope-SSE", "enable");
        }
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))?;
        let response = error_for_status(response).await?;

        if request.stream {
            let model = self.config.model.clone();
            Ok(Box::pin(try_stream! {
                let mut text_state = CumulativeText::new();
                let mut usage_state = CumulativeUsage::new();
                let mut events = Box::pin(EventStream::new(response.bytes_stream()));
                while let Some(event) = events.next().await {
                    let event =
                        event.map_err(|e| Error::Transport(format!("SSE stream error: {e}")))?;
                    if event.data.is_empty() {
                        continue;
                    }
                    if event.event == "error" {
                        Err(Error::Upstream {
                            status: 500,
                            body: event.data.clone(),
                        })?;
                    }
                    let frame: QwenResponse = serde_json::from_str(&event.data)
                        .map_err(|e| Error::MalformedFrame(format!("invalid stream event: {e}")))?;
                    let index = event.id.parse().unwrap_or(0);
                    let choice = frame
                        .output
                        .choices
                        .first()
                        .ok_or(Error::NoResponse)?;
                    let finish_reason = map_finish_reason(choice.finish_reason.as_deref());
                    let delta = text_state.delta(&choice.message.content);
                    let usage = usage_state.delta(frame.usage.as_usage());
                    // Emit only when something new arrived or the turn ended.
                    if delta.is_none() && finish_reason.is_none() {
                        continue;
                    }
                    yield ChatResponse::chunk(
                        delta.unwrap_or_default(),
                        &model,
                        index,
                        ResponseParts {
                            id: Some(frame.request_id),
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: Some(usage.completion_tokens),
                            finish_reason,
                        },
                    );
                    if finish_reason.is_some() {
                        break;
                    }
                }
            }))
        } else {
            let body: QwenResponse = response
                .json()
                .await
                .map_err(|e| Error::MalformedFrame(format!("invalid completion body: {e}")))?;
            let choice = body.output.choices.into_iter().next().ok_or(Error::NoResponse)?;
            let completion = ChatResponse::completion(
                choice.message.content,
                &self.config.model,
                ResponseParts {
                    id: Some(body.request_id),
                    prompt_tokens: body.usage.input_tokens,
                    completion_tokens: Some(body.usage.output_tokens),
                    finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
                },
            );
            Ok(Box::pin(futures::stream::iter([Ok(completion)])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use parley_core::Role;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cumulative_event(id: u32, content: &str, input: u32, output: u32, finish: &str) -> String {
        format!(
            "id:{id}\nevent:result\ndata:{}\n\n",
            json!({
                "request_id": "req-1",
                "output": {"choices": [{
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": finish
                }]},
                "usage": {"input_tokens": input, "output_tokens": output}
            })
        )
    }

    #[tokio::test]
    async fn cumulative_events_become_incremental_chunks() {
        let server = MockServer::start().await;
        let sse = [
            cumulative_event(1, "Hi", 10, 1, "null"),
            cumulative_event(2, "Hi there", 10, 3, "null"),
            cumulative_event(3, "Hi there!", 10, 4, "stop"),
        ]
        .concat();
        Mock::given(method("POST"))
            .and(header("X-DashScope-SSE", "enable"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter =
            QwenAdapter::new(QwenConfig::new("k", "qwen-turbo").with_endpoint(server.uri()))
                .unwrap();
        let mut request = ChatRequest::new("m", vec![ChatMessage::new(Role::User, "hi")]);
        request.stream = true;

        let chunks: Vec<_> = adapter
            .chat_completions(request)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let texts: Vec<_> = chunks.iter().filter_map(|c| c.text()).collect();
        assert_eq!(texts, vec!["Hi", " there", "!"]);
        assert_eq!(chunks[2].finish_reason(), Some(FinishReason::Stop));

        // Usage deltas, not running totals.
        assert_eq!(chunks[0].usage().unwrap().prompt_tokens, 10);
        assert_eq!(chunks[1].usage().unwrap().prompt_tokens, 0);
        assert_eq!(chunks[1].usage().unwrap().completion_tokens, 2);
        assert_eq!(chunks[2].usage().unwrap().completion_tokens, 1);
    }

    #[tokio::test]
    async fn error_event_fails_the_stream() {
        let server = MockServer::start().await;
        let sse = "id:1\nevent:error\ndata:{\"code\":\"InvalidParameter\"}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter =
            QwenAdapter::new(QwenConfig::new("k", "qwen-turbo").with_endpoint(server.uri()))
                .unwrap();
        let mut request = ChatRequest::new("m", vec![ChatMessage::new(Role::User, "hi")]);
        request.stream = true;

        let result: Result<Vec<_>> = adapter
            .chat_completions(request)
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::Upstream { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn non_streaming_maps_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "request_id": "req-9",
                "output": {"choices": [{
                    "message": {"role": "assistant", "content": "四十二"},
                    "finish_reason": "stop"
                }]},
                "usage": {"input_tokens": 7, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let adapter =
            QwenAdapter::new(QwenConfig::new("k", "qwen-turbo").with_endpoint(server.uri()))
                .unwrap();
        let responses: Vec<_> = adapter
            .chat_completions(ChatRequest::new(
                "m",
                vec![ChatMessage::new(Role::User, "hi")],
            ))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(responses[0].text(), Some("四十二"));
        assert_eq!(responses[0].usage().unwrap(), Usage::of(7, 3));
    }
}
