//! Canonical chat-completion protocol types
//!
//! Every adapter translates between these OpenAI-shaped types and its
//! vendor's wire format. Requests are read-only for adapters; responses are
//! either a complete message or an incremental chunk, tagged by the `object`
//! field on the wire.

use crate::token_count::count_tokens;
use serde::{Deserialize, Serialize};

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Function => "function",
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,

    /// Message text; may be absent on placeholder turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
        }
    }

    /// Message text, or the empty string when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Canonical chat-completion request
///
/// The message sequence is ordered; the latest turn is last. Adapters never
/// mutate a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,

    pub messages: Vec<ChatMessage>,

    /// Sampling temperature, canonical range 0.0 to 2.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// A non-streaming request with no sampling overrides.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            stream: false,
        }
    }
}

/// Token usage reported for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from prompt and completion counts; the total is derived.
    pub fn of(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ContentFilter,
}

/// Canonical response, tagged by the OpenAI `object` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum ChatResponse {
    /// A complete, non-streamed answer
    #[serde(rename = "chat.completion")]
    Completion(ChatCompletion),

    /// An incremental chunk; `delta` carries only newly produced text
    #[serde(rename = "chat.completion.chunk")]
    Chunk(ChatChunk),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// Newly produced content since the previous chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Optional pieces vendors report alongside plain completion text.
///
/// Anything left unset is filled in: ids are generated, `created` is stamped,
/// completion tokens are counted from the text itself.
#[derive(Debug, Clone, Default)]
pub struct ResponseParts {
    pub id: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: Option<u32>,
    pub finish_reason: Option<FinishReason>,
}

fn generated_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ChatResponse {
    /// Build a complete response from vendor text.
    pub fn completion(text: impl Into<String>, model: &str, parts: ResponseParts) -> Self {
        let text = text.into();
        let completion_tokens = parts
            .completion_tokens
            .unwrap_or_else(|| count_tokens(&text));
        ChatResponse::Completion(ChatCompletion {
            id: parts.id.unwrap_or_else(generated_id),
            created: now_unix(),
            model: model.to_string(),
            usage: Some(Usage::of(parts.prompt_tokens, completion_tokens)),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, text),
                finish_reason: Some(parts.finish_reason.unwrap_or(FinishReason::Stop)),
            }],
        })
    }

    /// Build a streamed chunk from vendor delta text.
    pub fn chunk(text: impl Into<String>, model: &str, index: u32, parts: ResponseParts) -> Self {
        let text = text.into();
        let completion_tokens = parts
            .completion_tokens
            .unwrap_or_else(|| count_tokens(&text));
        ChatResponse::Chunk(ChatChunk {
            id: parts.id.unwrap_or_else(generated_id),
            created: now_unix(),
            model: model.to_string(),
            usage: Some(Usage::of(parts.prompt_tokens, completion_tokens)),
            choices: vec![ChunkChoice {
                index,
                delta: Delta {
                    role: Some(Role::Assistant),
                    content: Some(text),
                },
                finish_reason: parts.finish_reason,
            }],
        })
    }

    pub fn usage(&self) -> Option<Usage> {
        match self {
            ChatResponse::Completion(c) => c.usage,
            ChatResponse::Chunk(c) => c.usage,
        }
    }

    /// Finish reason of the first choice, if any.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            ChatResponse::Completion(c) => c.choices.first().and_then(|c| c.finish_reason),
            ChatResponse::Chunk(c) => c.choices.first().and_then(|c| c.finish_reason),
        }
    }

    /// Text carried by the first choice (message content or delta content).
    pub fn text(&self) -> Option<&str> {
        match self {
            ChatResponse::Completion(c) => {
                c.choices.first().and_then(|c| c.message.content.as_deref())
            }
            ChatResponse::Chunk(c) => c.choices.first().and_then(|c| c.delta.content.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Function).unwrap(), "\"function\"");
    }

    #[test]
    fn request_roundtrip() {
        let json = r#"{
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.7,
            "stream": true
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "gpt-3.5-turbo");
        assert_eq!(req.messages[0].text(), "Hello");
        assert!(req.stream);
        assert_eq!(req.top_p, None);

        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("top_p").is_none());
    }

    #[test]
    fn stream_defaults_to_false() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"model": "m", "messages": []}"#).unwrap();
        assert!(!req.stream);
    }

    #[test]
    fn response_object_tag_roundtrip() {
        let resp = ChatResponse::completion("hello", "test-model", ResponseParts::default());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");

        let parsed: ChatResponse = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, ChatResponse::Completion(_)));
    }

    #[test]
    fn chunk_object_tag() {
        let resp = ChatResponse::chunk("he", "test-model", 0, ResponseParts::default());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "he");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn completion_defaults_finish_reason_to_stop() {
        let resp = ChatResponse::completion("x", "m", ResponseParts::default());
        assert_eq!(resp.finish_reason(), Some(FinishReason::Stop));
    }

    #[test]
    fn usage_total_is_derived() {
        let usage = Usage::of(12, 34);
        assert_eq!(usage.total_tokens, 46);
    }

    #[test]
    fn helper_usage_holds_total_invariant() {
        let resp = ChatResponse::completion(
            "some completion text",
            "m",
            ResponseParts {
                prompt_tokens: 9,
                ..Default::default()
            },
        );
        let usage = resp.usage().unwrap();
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
        assert_eq!(usage.prompt_tokens, 9);
        assert!(usage.completion_tokens > 0);
    }

    #[test]
    fn generated_ids_have_prefix() {
        let resp = ChatResponse::completion("x", "m", ResponseParts::default());
        match resp {
            ChatResponse::Completion(c) => assert!(c.id.starts_with("chatcmpl-")),
            ChatResponse::Chunk(_) => unreachable!(),
        }
    }

    #[test]
    fn reported_tokens_win_over_counting() {
        let resp = ChatResponse::completion(
            "irrelevant",
            "m",
            ResponseParts {
                prompt_tokens: 5,
                completion_tokens: Some(7),
                ..Default::default()
            },
        );
        assert_eq!(resp.usage().unwrap(), Usage::of(5, 7));
    }

    #[test]
    fn finish_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FinishReason::FunctionCall).unwrap(),
            "\"function_call\""
        );
    }
}
