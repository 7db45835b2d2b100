//! Copilot conversational WebSocket adapter
//!
//! The only stateful backend: a signed multi-turn session over a persistent
//! socket. By default every canonical call runs in a fresh conversation; a
//! single-conversation configuration reuses one session and serializes turns
//! behind a mutex. Streamed frames carry cumulative text, so deltas go
//! through the cumulative normalizer before chunks are exposed.

mod client;
mod constants;
mod frames;

pub use client::{Attachment, CopilotClient};

use crate::client::HttpClientConfig;
use async_stream::try_stream;
use async_trait::async_trait;
use client::TurnEvent;
use parley_core::{
    ChatAdapter, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts, ResponseStream,
    Result, stream::CumulativeText,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Conversation style the session adopts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStyle {
    /// Original and imaginative chat
    Creative,
    /// Informative and friendly chat
    Balanced,
    /// Concise and straightforward chat
    Precise,
}

impl ConversationStyle {
    pub(crate) fn tone(&self) -> &'static str {
        match self {
            ConversationStyle::Creative => "Creative",
            ConversationStyle::Balanced => "Balanced",
            ConversationStyle::Precise => "Precise",
        }
    }

    pub(crate) fn option_sets(&self) -> &'static [&'static str] {
        match self {
            ConversationStyle::Creative => &["h3imaginative", "clgalileo", "gencontentv3"],
            ConversationStyle::Balanced => &["galileo"],
            ConversationStyle::Precise => &["h3precise", "clgalileo"],
        }
    }
}

/// Endpoint set; overridable for tests and self-hosted gateways.
#[derive(Debug, Clone)]
pub struct CopilotEndpoints {
    pub create_url: String,
    pub chathub_url: String,
    pub upload_url: String,
    pub blob_url: String,
}

impl Default for CopilotEndpoints {
    fn default() -> Self {
        Self {
            create_url: format!(
                "https://edgeservices.bing.com/edgesvc/turing/conversation/create?bundleVersion={}",
                constants::BUNDLE_VERSION
            ),
            chathub_url: "wss://sydney.bing.com/sydney/ChatHub".to_string(),
            upload_url: "https://copilot.microsoft.com/images/kblob".to_string(),
            blob_url: "https://copilot.microsoft.com/images/blob?bcid=".to_string(),
        }
    }
}

/// Copilot adapter configuration
#[derive(Debug, Clone)]
pub struct CopilotConfig {
    /// Authentication cookies; anonymous sessions are allowed but limited.
    pub cookies: Option<String>,

    pub style: ConversationStyle,

    /// Whether the assistant may search the web
    pub search: bool,

    /// Reuse one conversation across calls instead of starting fresh per call.
    pub single_conversation: bool,

    pub endpoints: CopilotEndpoints,

    pub client_config: HttpClientConfig,

    pub connect_timeout_secs: u64,

    /// Bound on each socket read while a turn is running
    pub turn_timeout_secs: u64,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            cookies: None,
            style: ConversationStyle::Balanced,
            search: true,
            single_conversation: false,
            endpoints: CopilotEndpoints::default(),
            client_config: HttpClientConfig::default(),
            connect_timeout_secs: 30,
            turn_timeout_secs: 300,
        }
    }
}

/// Copilot adapter
pub struct CopilotAdapter {
    config: CopilotConfig,
    shared: Option<Arc<Mutex<CopilotClient>>>,
}

impl CopilotAdapter {
    pub fn new(config: CopilotConfig) -> Result<Self> {
        let shared = if config.single_conversation {
            Some(Arc::new(Mutex::new(CopilotClient::new(config.clone())?)))
        } else {
            None
        };
        Ok(Self { config, shared })
    }
}

/// The upstream cannot represent conversation history; only the latest turn
/// is sent.
fn latest_prompt(request: &ChatRequest) -> Result<String> {
    let message = request
        .messages
        .last()
        .ok_or_else(|| Error::InvalidRequest("request contains no messages".to_string()))?;
    if request.messages.len() > 1 {
        warn!("conversation history is not representable upstream; sending only the latest turn");
    }
    Ok(message.text().to_string())
}

fn is_session_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::Throttled(_) | Error::CaptchaChallenge(_) | Error::ConversationLimit { .. }
    )
}

#[async_trait]
impl ChatAdapter for CopilotAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let prompt = latest_prompt(&request)?;
        let handle = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(Mutex::new(CopilotClient::new(self.config.clone())?)),
        };
        let fresh = self.shared.is_none();
        let stream_mode = request.stream;
        let model = request.model.clone();

        Ok(Box::pin(try_stream! {
            let mut client = handle.lock_owned().await;
            client.ensure_active().await?;
            let mut turn = client.begin_turn(&prompt, None, stream_mode).await?;

            let mut cumulative = CumulativeText::new();
            loop {
                match turn.next_event().await {
                    Ok(Some(TurnEvent::Update(text))) => {
                        if let Some(delta) = cumulative.delta(&text) {
                            yield ChatResponse::chunk(delta, &model, 0, ResponseParts::default());
                        }
                    }
                    Ok(Some(TurnEvent::Final { text, .. })) => {
                        client.update_throttling(turn.throttling());
                        if stream_mode {
                            let delta = cumulative.delta(&text).unwrap_or_default();
                            yield ChatResponse::chunk(
                                delta,
                                &model,
                                0,
                                ResponseParts {
                                    finish_reason: Some(FinishReason::Stop),
                                    ..Default::default()
                                },
                            );
                        } else {
                            yield ChatResponse::completion(text, &model, ResponseParts::default());
                        }
                        break;
                    }
                    Ok(None) => {
                        client.update_throttling(turn.throttling());
                        if stream_mode {
                            // Deterministic stream end even for an empty turn.
                            yield ChatResponse::chunk(
                                "",
                                &model,
                                0,
                                ResponseParts {
                                    finish_reason: Some(FinishReason::Stop),
                                    ..Default::default()
                                },
                            );
                            break;
                        }
                        Err(Error::NoResponse)?;
                        break;
                    }
                    Err(e) => {
                        if is_session_fatal(&e) {
                            client.invalidate();
                        }
                        Err(e)?;
                        break;
                    }
                }
            }
            turn.close().await;
            if fresh {
                client.close();
            }
        }))
    }
}
