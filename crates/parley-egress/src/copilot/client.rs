//! Copilot conversation client
//!
//! Drives one signed, stateful, multi-turn session:
//! `Disconnected → Handshaking → Active → Closed`. The handshake is an HTTP
//! call that yields the conversation identifiers and signatures; each turn
//! then runs over a fresh ChatHub socket, optionally uploading a binary
//! attachment first. A session serves one turn at a time.

use super::frames::{ChatHubFrame, decode_frame, last_substantive_index};
use super::{CopilotConfig, constants};
use crate::client::build_client;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{SinkExt, StreamExt};
use parley_core::{Error, Result};
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Binary attachment uploaded ahead of a turn.
#[derive(Debug, Clone)]
pub enum Attachment {
    /// Publicly reachable image URL
    Url(String),
    /// Raw image bytes, uploaded base64-encoded
    Bytes(Vec<u8>),
}

#[derive(Debug)]
enum SessionState {
    Disconnected,
    Handshaking,
    Active(Session),
    Closed,
}

#[derive(Debug)]
struct Session {
    conversation_id: String,
    client_id: String,
    conversation_signature: Option<String>,
    encrypted_signature: Option<String>,
    /// Starts at 0, advances by exactly one per turn sent.
    invocation_id: u64,
    messages_sent: u32,
    message_limit: Option<u32>,
}

/// Stateful Copilot session client. Not safe for concurrent turns; callers
/// serialize access (the adapter wraps it in a mutex).
pub struct CopilotClient {
    config: CopilotConfig,
    http: reqwest::Client,
    state: SessionState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationResponse {
    result: ConversationResult,
    conversation_id: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationResult {
    value: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    blob_id: Option<String>,
}

fn session_headers(config: &CopilotConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(REFERER, HeaderValue::from_static(constants::REFERER));
    headers.insert(USER_AGENT, HeaderValue::from_static(constants::USER_AGENT));
    if let Some(cookies) = &config.cookies {
        headers.insert(
            COOKIE,
            HeaderValue::from_str(cookies)
                .map_err(|e| Error::Authentication(format!("invalid cookie value: {e}")))?,
        );
    }
    Ok(headers)
}

async fn send_frame(ws: &mut WsStream, value: &serde_json::Value) -> Result<()> {
    let mut payload = value.to_string();
    payload.push(constants::DELIMITER);
    ws.send(Message::text(payload))
        .await
        .map_err(|e| Error::Transport(format!("WebSocket send failed: {e}")))
}

impl CopilotClient {
    pub fn new(config: CopilotConfig) -> Result<Self> {
        let http = build_client(&config.client_config)?;
        Ok(Self {
            config,
            http,
            state: SessionState::Disconnected,
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    /// Start the session when disconnected; fail fast once closed.
    pub async fn ensure_active(&mut self) -> Result<()> {
        match &self.state {
            SessionState::Active(session) => {
                if let Some(limit) = session.message_limit
                    && session.messages_sent >= limit
                {
                    return Err(Error::ConversationLimit { max: limit });
                }
                Ok(())
            }
            SessionState::Disconnected => self.start_conversation().await,
            SessionState::Handshaking | SessionState::Closed => Err(Error::Transport(
                "conversation session is closed".to_string(),
            )),
        }
    }

    /// Handshake: obtain conversation identifiers and session signatures.
    pub async fn start_conversation(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;

        let response = self
            .http
            .get(&self.config.endpoints.create_url)
            .headers(session_headers(&self.config)?)
            .send()
            .await
            .map_err(|e| {
                self.state = SessionState::Closed;
                Error::Transport(format!("conversation create failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            self.state = SessionState::Closed;
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let header_value = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let conversation_signature = header_value("X-Sydney-Conversationsignature");
        let encrypted_signature = header_value("X-Sydney-Encryptedconversationsignature");

        let body: CreateConversationResponse = response.json().await.map_err(|e| {
            self.state = SessionState::Closed;
            Error::MalformedFrame(format!("invalid conversation create body: {e}"))
        })?;

        if body.result.value != "Success" {
            self.state = SessionState::Closed;
            return Err(Error::Authentication(format!(
                "failed to create conversation: {}",
                body.result.message.unwrap_or(body.result.value)
            )));
        }

        let (conversation_id, client_id) = match (body.conversation_id, body.client_id) {
            (Some(conversation_id), Some(client_id)) => (conversation_id, client_id),
            _ => {
                self.state = SessionState::Closed;
                return Err(Error::MalformedFrame(
                    "conversation create response is missing identifiers".to_string(),
                ));
            }
        };

        debug!(conversation_id = %conversation_id, "conversation created");
        self.state = SessionState::Active(Session {
            conversation_id,
            client_id,
            conversation_signature,
            encrypted_signature,
            invocation_id: 0,
            messages_sent: 0,
            message_limit: None,
        });
        Ok(())
    }

    /// Record the throttling counters reported by the last final frame.
    pub(crate) fn update_throttling(&mut self, observed: Option<(u32, u32)>) {
        if let (SessionState::Active(session), Some((sent, limit))) = (&mut self.state, observed) {
            session.messages_sent = sent;
            session.message_limit = Some(limit);
        }
    }

    /// Drop the session after a fatal upstream policy error.
    pub(crate) fn invalidate(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Release the session; identifiers are cleared and further calls fail.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Open the socket for one turn, upload any attachment, send the request.
    pub(crate) async fn begin_turn(
        &mut self,
        prompt: &str,
        attachment: Option<&Attachment>,
        stream_mode: bool,
    ) -> Result<TurnSocket> {
        let (conversation_id, client_id, conversation_signature, encrypted_signature, invocation_id) =
            match &self.state {
                SessionState::Active(session) => (
                    session.conversation_id.clone(),
                    session.client_id.clone(),
                    session.conversation_signature.clone(),
                    session.encrypted_signature.clone(),
                    session.invocation_id,
                ),
                _ => {
                    return Err(Error::Transport(
                        "no active conversation session".to_string(),
                    ));
                }
            };

        let mut chathub_url = self.config.endpoints.chathub_url.clone();
        if let Some(signature) = &encrypted_signature {
            chathub_url = format!(
                "{chathub_url}?sec_access_token={}",
                urlencoding::encode(signature)
            );
        }

        let mut ws_request = chathub_url
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid ChatHub URL: {e}")))?;
        let headers = ws_request.headers_mut();
        headers.insert(
            "Origin",
            constants::ORIGIN
                .parse()
                .map_err(|e| Error::Config(format!("invalid header value: {e}")))?,
        );
        headers.insert(
            "User-Agent",
            constants::USER_AGENT
                .parse()
                .map_err(|e| Error::Config(format!("invalid header value: {e}")))?,
        );

        let connect_timeout_secs = self.config.connect_timeout_secs;
        let (mut ws, _) = timeout(
            Duration::from_secs(connect_timeout_secs),
            connect_async(ws_request),
        )
        .await
        .map_err(|_| Error::Timeout(connect_timeout_secs))?
        .map_err(|e| Error::Transport(format!("ChatHub connect failed: {e}")))?;

        // Protocol handshake must precede any request frame.
        send_frame(&mut ws, &json!({"protocol": "json", "version": 1})).await?;
        let ack = timeout(Duration::from_secs(connect_timeout_secs), ws.next())
            .await
            .map_err(|_| Error::Timeout(connect_timeout_secs))?;
        if ack.is_none() {
            return Err(Error::Transport(
                "connection closed during protocol handshake".to_string(),
            ));
        }

        let image_url = match attachment {
            Some(attachment) => {
                let blob_id = self.upload_attachment(&conversation_id, attachment).await?;
                Some(format!("{}{}", self.config.endpoints.blob_url, blob_id))
            }
            None => None,
        };

        let request = build_turn_arguments(
            &self.config,
            &conversation_id,
            &client_id,
            conversation_signature.as_deref(),
            prompt,
            image_url.as_deref(),
            invocation_id,
        );

        if let SessionState::Active(session) = &mut self.state {
            session.invocation_id += 1;
        }
        send_frame(&mut ws, &request).await?;

        Ok(TurnSocket {
            ws,
            stream_mode,
            read_timeout_secs: self.config.turn_timeout_secs,
            pending: VecDeque::new(),
            throttling: None,
            empty_turn: false,
            finished: false,
        })
    }

    /// Upload an attachment through the short-lived multipart endpoint.
    ///
    /// A non-success status or a missing/empty blob id fails the turn.
    pub(crate) async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> Result<String> {
        let payload = json!({
            "imageInfo": match attachment {
                Attachment::Url(url) => json!({"url": url}),
                Attachment::Bytes(_) => json!({}),
            },
            "knowledgeRequest": {
                "invokedSkills": ["ImageById"],
                "subscriptionId": "Bing.Chat.Multimodal",
                "invokedSkillsRequestData": {"enableFaceBlur": true},
                "convoData": {
                    "convoid": conversation_id,
                    "convotone": self.config.style.tone(),
                }
            }
        });

        let mut form = reqwest::multipart::Form::new().part(
            "knowledgeRequest",
            reqwest::multipart::Part::text(payload.to_string())
                .mime_str("application/json")
                .map_err(|e| Error::Config(format!("invalid multipart payload: {e}")))?,
        );
        if let Attachment::Bytes(bytes) = attachment {
            form = form.part(
                "imageBase64",
                reqwest::multipart::Part::text(STANDARD.encode(bytes))
                    .mime_str("application/octet-stream")
                    .map_err(|e| Error::Config(format!("invalid multipart payload: {e}")))?,
            );
        }

        let response = self
            .http
            .post(&self.config.endpoints.upload_url)
            .headers(session_headers(&self.config)?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("attachment upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedFrame(format!("invalid upload response: {e}")))?;
        match body.blob_id {
            Some(blob_id) if !blob_id.is_empty() => Ok(blob_id),
            _ => Err(Error::MalformedFrame(
                "attachment upload returned an empty blob id".to_string(),
            )),
        }
    }
}

fn build_turn_arguments(
    config: &CopilotConfig,
    conversation_id: &str,
    client_id: &str,
    conversation_signature: Option<&str>,
    prompt: &str,
    image_url: Option<&str>,
    invocation_id: u64,
) -> serde_json::Value {
    let mut options_sets: Vec<&str> = constants::DEFAULT_OPTIONS.to_vec();
    options_sets.extend(config.style.option_sets());
    if config.cookies.is_some() {
        options_sets.extend(constants::COOKIE_OPTIONS);
    }
    if !config.search {
        options_sets.extend(constants::NO_SEARCH_OPTIONS);
    }

    json!({
        "arguments": [{
            "source": "cib",
            "optionsSets": options_sets,
            "allowedMessageTypes": constants::ALLOWED_MESSAGE_TYPES,
            "sliceIds": [],
            "verbosity": "verbose",
            "scenario": "SERP",
            "plugins": [],
            "conversationHistoryOptionsSets": constants::CONVERSATION_HISTORY_OPTIONS,
            "isStartOfSession": invocation_id == 0,
            "message": {
                "author": "user",
                "inputMethod": "Keyboard",
                "text": prompt,
                "messageType": "Chat",
                "imageUrl": image_url,
                "originalImageUrl": image_url,
            },
            "conversationSignature": conversation_signature,
            "participant": {"id": client_id},
            "tone": config.style.tone(),
            "spokenTextMode": "None",
            "conversationId": conversation_id,
        }],
        "invocationId": invocation_id.to_string(),
        "target": "chat",
        "type": 4,
    })
}

/// Events produced while one turn runs.
#[derive(Debug)]
pub(crate) enum TurnEvent {
    /// Cumulative transcript text so far (streaming only)
    Update(String),
    /// Final answer plus any suggested follow-up replies
    Final {
        text: String,
        suggested: Vec<String>,
    },
}

/// The socket for one in-flight turn. Dropping it releases the connection.
pub(crate) struct TurnSocket {
    ws: WsStream,
    stream_mode: bool,
    read_timeout_secs: u64,
    pending: VecDeque<TurnEvent>,
    throttling: Option<(u32, u32)>,
    empty_turn: bool,
    finished: bool,
}

impl TurnSocket {
    pub(crate) fn throttling(&self) -> Option<(u32, u32)> {
        self.throttling
    }

    pub(crate) async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Next event of the turn; `Ok(None)` is a benign empty turn end.
    pub(crate) async fn next_event(&mut self) -> Result<Option<TurnEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.empty_turn || self.finished {
                return Ok(None);
            }

            let msg = timeout(Duration::from_secs(self.read_timeout_secs), self.ws.next())
                .await
                .map_err(|_| Error::Timeout(self.read_timeout_secs))?;
            let Some(msg) = msg else {
                return Err(Error::Transport(
                    "connection closed before the turn completed".to_string(),
                ));
            };
            let msg = msg.map_err(|e| Error::Transport(format!("WebSocket read failed: {e}")))?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(Error::Transport(
                        "connection closed before the turn completed".to_string(),
                    ));
                }
                _ => continue,
            };

            for raw in text.split(constants::DELIMITER).filter(|s| !s.is_empty()) {
                match decode_frame(raw)? {
                    ChatHubFrame::Update(arguments) => {
                        if !self.stream_mode {
                            continue;
                        }
                        let Some(message) = arguments.messages.first() else {
                            continue;
                        };
                        if message.is_search_progress() {
                            continue;
                        }
                        if let Some(text) = &message.text {
                            self.pending.push_back(TurnEvent::Update(text.clone()));
                        }
                    }
                    ChatHubFrame::Final(item) => self.handle_final(item)?,
                    ChatHubFrame::Unrecognized(kind) => {
                        warn!(kind = ?kind, "ignoring unrecognized ChatHub frame");
                    }
                }
            }
        }
    }

    fn handle_final(&mut self, item: super::frames::FinalItem) -> Result<()> {
        if let Some(throttling) = &item.throttling {
            let sent = throttling.num_user_messages_in_conversation;
            let limit = throttling.max_num_user_messages_in_conversation;
            self.throttling = Some((sent, limit));
            if sent == limit {
                return Err(Error::ConversationLimit { max: limit });
            }
        }

        if item.messages.is_empty() {
            let result = item.result.as_ref();
            let detail = || {
                result
                    .and_then(|r| r.message.clone())
                    .unwrap_or_else(|| "no detail provided".to_string())
            };
            return match result.map(|r| r.value.as_str()) {
                Some("Throttled") => Err(Error::Throttled(detail())),
                Some("CaptchaChallenge") => Err(Error::CaptchaChallenge(detail())),
                _ => {
                    self.empty_turn = true;
                    Ok(())
                }
            };
        }

        let index = last_substantive_index(&item.messages).ok_or(Error::NoResponse)?;
        let message = &item.messages[index];
        let text = message.text.clone().ok_or(Error::NoResponse)?;
        let suggested = message
            .suggested_responses
            .iter()
            .map(|s| s.text.clone())
            .collect();
        self.pending.push_back(TurnEvent::Final { text, suggested });
        self.finished = true;
        Ok(())
    }
}
