//! OpenAI-compatible egress adapter
//!
//! Works against api.openai.com and any OpenAI-compatible proxy. The
//! canonical contract is already OpenAI-shaped, so the request passes through
//! with bearer authentication; streamed bodies are SSE events terminated by
//! the `[DONE]` sentinel.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::EventStream;
use futures::StreamExt;
use parley_core::{ChatAdapter, ChatRequest, ChatResponse, Error, ResponseStream, Result};
use reqwest::Client;
use tracing::debug;

/// OpenAI adapter configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for bearer authentication
    pub api_key: String,

    /// Base URL (default: https://api.openai.com/v1)
    pub base_url: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            client_config: HttpClientConfig::default(),
        }
    }

    /// Set the base URL (proxies, compatible vendors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// OpenAI-compatible adapter
pub struct OpenAiAdapter {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatAdapter for OpenAiAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        debug!(model = %request.model, stream = request.stream, "dispatching OpenAI-compatible request");

        let timeout_secs = self.config.client_config.timeout_secs;
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
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

/// Decode an OpenAI-shaped SSE body into canonical chunks.
///
/// Each event's data is one chunk JSON; the stream ends at the `[DONE]`
/// sentinel. Shared with the Azure adapter, which speaks the same framing.
pub(crate) fn sse_chunk_stream(response: reqwest::Response) -> ResponseStream {
    Box::pin(try_stream! {
        let mut events = Box::pin(EventStream::new(response.bytes_stream()));
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| Error::Transport(format!("SSE stream error: {e}")))?;
            if event.data == "[DONE]" {
                break;
            }
            if event.data.is_empty() {
                continue;
            }
            let chunk: ChatResponse = serde_json::from_str(&event.data)
                .map_err(|e| Error::MalformedFrame(format!("invalid stream chunk: {e}")))?;
            yield chunk;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use parley_core::{ChatMessage, FinishReason, Role};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(stream: bool) -> ChatRequest {
        let mut req = ChatRequest::new(
            "gpt-3.5-turbo",
            vec![ChatMessage::new(Role::User, "Hello")],
        );
        req.stream = stream;
        req
    }

    fn adapter(server: &MockServer) -> OpenAiAdapter {
        OpenAiAdapter::new(OpenAiConfig::new("sk-test").with_base_url(server.uri())).unwrap()
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let adapter =
            OpenAiAdapter::new(OpenAiConfig::new("k").with_base_url("http://x/v1/")).unwrap();
        assert_eq!(adapter.endpoint(), "http://x/v1/chat/completions");
    }

    #[tokio::test]
    async fn non_streaming_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-3.5-turbo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-123",
                "object": "chat.completion",
                "created": 1_700_000_000,
                "model": "gpt-3.5-turbo",
                "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8},
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let responses: Vec<_> = adapter(&server)
            .chat_completions(request(false))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].text(), Some("Hi there"));
        assert_eq!(responses[0].finish_reason(), Some(FinishReason::Stop));
        let usage = responses[0].usage().unwrap();
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[tokio::test]
    async fn streaming_stops_at_done_sentinel() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let chunks: Vec<_> = adapter(&server)
            .chat_completions(request(true))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text(), Some("Hel"));
        assert_eq!(chunks[1].text(), Some("lo"));
        assert_eq!(chunks[1].finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn upstream_error_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429).set_body_string("{\"error\":\"insufficient_quota\"}"),
            )
            .mount(&server)
            .await;

        let err = adapter(&server)
            .chat_completions(request(false))
            .await
            .err()
            .unwrap();
        match err {
            Error::Upstream { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("insufficient_quota"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
