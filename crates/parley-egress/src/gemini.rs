//! Gemini egress adapter
//!
//! Speaks the `generateContent` REST API. Roles remap to `user`/`model` and
//! system turns fold into user turns. The upstream call itself is
//! non-streaming; a `stream: true` request is answered with one final chunk.

use crate::client::{HttpClientConfig, build_client, error_for_status, transport_error};
use crate::prompt::{DEFAULT_SYSTEM_TEMPLATE, fold_system_messages};
use async_trait::async_trait;
use parley_core::{
    ChatAdapter, ChatMessage, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts,
    ResponseStream, Result, Role,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Gemini adapter configuration
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API key passed as the `key` query parameter
    pub api_key: String,

    /// Upstream model (default: gemini-pro)
    pub model: String,

    /// Template for folded system turns
    pub system_template: String,

    /// Base URL (default: https://generativelanguage.googleapis.com/v1beta)
    pub base_url: String,

    /// HTTP client configuration
    pub client_config: HttpClientConfig,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gemini-pro".to_string(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            client_config: HttpClientConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Gemini adapter
pub struct GeminiAdapter {
    config: GeminiConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

fn to_contents(messages: &[ChatMessage], template: &str) -> Result<Vec<Content>> {
    let folded = fold_system_messages(messages, template)?;
    Ok(folded
        .into_iter()
        .map(|message| Content {
            role: match message.role {
                Role::Assistant => "model".to_string(),
                _ => "user".to_string(),
            },
            parts: vec![Part {
                text: message.text().to_string(),
            }],
        })
        .collect())
}

impl GeminiAdapter {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = build_client(&config.client_config)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            self.config.api_key
        )
    }
}

#[async_trait]
impl ChatAdapter for GeminiAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let contents = to_contents(&request.messages, &self.config.system_template)?;
        debug!(model = %self.config.model, "dispatching Gemini request");

        let timeout_secs = self.config.client_config.timeout_secs;
        let response = self
            .client
            .post(self.endpoint())
            .json(&GenerateContentRequest { contents })
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_secs))?;
        let response = error_for_status(response).await?;

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedFrame(format!("invalid generateContent body: {e}")))?;
        let text = body
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or(Error::NoResponse)?;

        let parts = ResponseParts {
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        };
        let response = if request.stream {
            ChatResponse::chunk(text, &self.config.model, 0, parts)
        } else {
            ChatResponse::completion(text, &self.config.model, parts)
        };
        Ok(Box::pin(futures::stream::iter([Ok(response)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn assistant_turns_remap_to_model() {
        let messages = vec![
            ChatMessage::new(Role::User, "你好"),
            ChatMessage::new(Role::Assistant, "你好"),
            ChatMessage::new(Role::User, "你是谁？"),
        ];
        let contents = to_contents(&messages, DEFAULT_SYSTEM_TEMPLATE).unwrap();
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[2].parts[0].text, "你是谁？");
    }

    #[test]
    fn system_turns_fold_before_remap() {
        let messages = vec![
            ChatMessage::new(Role::System, "stay formal"),
            ChatMessage::new(Role::User, "hello"),
        ];
        let contents = to_contents(&messages, DEFAULT_SYSTEM_TEMPLATE).unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[1].parts[0].text, "ok");
    }

    async fn mock_server_with_reply(text: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": text}]},
                    "finishReason": "STOP",
                    "index": 0
                }]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn non_streaming_roundtrip() {
        let server = mock_server_with_reply("bonjour").await;
        let adapter =
            GeminiAdapter::new(GeminiConfig::new("g-key").with_base_url(server.uri())).unwrap();

        let responses: Vec<_> = adapter
            .chat_completions(ChatRequest::new(
                "any",
                vec![ChatMessage::new(Role::User, "hi")],
            ))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], ChatResponse::Completion(_)));
        assert_eq!(responses[0].text(), Some("bonjour"));
    }

    #[tokio::test]
    async fn stream_request_is_served_as_single_final_chunk() {
        let server = mock_server_with_reply("salut").await;
        let adapter =
            GeminiAdapter::new(GeminiConfig::new("g-key").with_base_url(server.uri())).unwrap();

        let mut request = ChatRequest::new("any", vec![ChatMessage::new(Role::User, "hi")]);
        request.stream = true;
        let chunks: Vec<_> = adapter
            .chat_completions(request)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], ChatResponse::Chunk(_)));
        assert_eq!(chunks[0].text(), Some("salut"));
        assert_eq!(chunks[0].finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn empty_candidates_is_no_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;
        let adapter =
            GeminiAdapter::new(GeminiConfig::new("g-key").with_base_url(server.uri())).unwrap();
        let err = adapter
            .chat_completions(ChatRequest::new(
                "any",
                vec![ChatMessage::new(Role::User, "hi")],
            ))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoResponse));
    }
}
