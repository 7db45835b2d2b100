//! Spark signed-request WebSocket adapter
//!
//! Each call signs a fresh connection URL (HMAC-SHA256 over a
//! host/date/request-line string, base64-wrapped into an authorization query
//! parameter), sends one JSON request and reads status frames until the
//! terminal one. A non-zero code in any frame fails the call with the
//! provider's message.

use crate::prompt::{DEFAULT_SYSTEM_TEMPLATE, fold_system_messages};
use async_stream::try_stream;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parley_core::{
    ChatAdapter, ChatMessage, ChatRequest, ChatResponse, Error, FinishReason, ResponseParts,
    ResponseStream, Result,
};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Spark adapter configuration
#[derive(Debug, Clone)]
pub struct SparkConfig {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,

    /// API model version: v1.5, v2.0, v3.0 or v3.5
    pub version: String,

    /// Endpoint override; defaults to the version's public endpoint.
    pub endpoint: Option<String>,

    /// Template for folded system turns
    pub system_template: String,

    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl SparkConfig {
    pub fn new(
        app_id: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            version: version.into(),
            endpoint: None,
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 300,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// (domain, endpoint) pair for a published model version.
fn version_entry(version: &str) -> Result<(&'static str, &'static str)> {
    Ok(match version {
        "v1.5" => ("general", "wss://spark-api.xf-yun.com/v1.1/chat"),
        "v2.0" => ("generalv2", "wss://spark-api.xf-yun.com/v2.1/chat"),
        "v3.0" => ("generalv3", "wss://spark-api.xf-yun.com/v3.1/chat"),
        "v3.5" => ("generalv3.5", "wss://spark-api.xf-yun.com/v3.5/chat"),
        other => {
            return Err(Error::Config(format!("unknown Spark model version: {other}")));
        }
    })
}

fn rfc1123_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    let rest = endpoint
        .strip_prefix("wss://")
        .or_else(|| endpoint.strip_prefix("ws://"))
        .ok_or_else(|| Error::Config(format!("unsupported endpoint scheme: {endpoint}")))?;
    Ok(match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    })
}

/// Sign `endpoint` for one connection attempt.
///
/// The signature covers `host: <host>\ndate: <date>\nGET <path> HTTP/1.1`,
/// keyed by the API secret; the resulting authorization payload rides in the
/// query string together with the date and host it was computed over.
pub(crate) fn signed_url(
    endpoint: &str,
    api_key: &str,
    api_secret: &str,
    date: &str,
) -> Result<String> {
    let (host, path) = split_endpoint(endpoint)?;

    let signature_origin = format!("host: {host}\ndate: {date}\nGET {path} HTTP/1.1");
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| Error::Authentication(format!("invalid signing secret: {e}")))?;
    mac.update(signature_origin.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{api_key}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{signature}\""
    );
    let authorization = STANDARD.encode(authorization_origin.as_bytes());

    Ok(format!(
        "{endpoint}?authorization={}&date={}&host={}",
        urlencoding::encode(&authorization),
        urlencoding::encode(date),
        urlencoding::encode(host),
    ))
}

// Vendor frame shapes

#[derive(Debug, Deserialize)]
struct SparkFrame {
    header: SparkHeader,
    payload: Option<SparkPayload>,
}

#[derive(Debug, Deserialize)]
struct SparkHeader {
    code: i64,
    #[serde(default)]
    message: String,
    sid: Option<String>,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct SparkPayload {
    choices: SparkChoices,
    usage: Option<SparkUsage>,
}

#[derive(Debug, Deserialize)]
struct SparkChoices {
    #[serde(default)]
    text: Vec<SparkText>,
}

#[derive(Debug, Deserialize)]
struct SparkText {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct SparkUsage {
    text: SparkUsageText,
}

#[derive(Debug, Deserialize)]
struct SparkUsageText {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Spark adapter
pub struct SparkAdapter {
    config: SparkConfig,
    domain: &'static str,
    endpoint: String,
}

impl SparkAdapter {
    pub fn new(config: SparkConfig) -> Result<Self> {
        let (domain, default_endpoint) = version_entry(&config.version)?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint.to_string());
        Ok(Self {
            config,
            domain,
            endpoint,
        })
    }

    fn build_query(&self, messages: &[ChatMessage], request: &ChatRequest) -> serde_json::Value {
        serde_json::json!({
            "header": {
                "app_id": self.config.app_id,
                "uid": "110",
            },
            "parameter": {
                "chat": {
                    "domain": self.domain,
                    // Canonical range is 0-2, the vendor's is 0-1.
                    "temperature": request.temperature.map_or(0.5, |t| t / 2.0),
                    "max_tokens": request.max_tokens.unwrap_or(1024),
                    "top_k": 4,
                    "chat_id": uuid::Uuid::new_v4().to_string(),
                }
            },
            "payload": {"message": {"text": messages}},
        })
    }
}

fn frame_text(frame: &SparkFrame) -> String {
    frame
        .payload
        .as_ref()
        .map(|payload| {
            payload
                .choices
                .text
                .iter()
                .map(|t| t.content.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn frame_usage(frame: &SparkFrame) -> Option<(u32, u32)> {
    frame
        .payload
        .as_ref()
        .and_then(|payload| payload.usage.as_ref())
        .map(|usage| (usage.text.prompt_tokens, usage.text.completion_tokens))
}

#[async_trait]
impl ChatAdapter for SparkAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let messages = fold_system_messages(&request.messages, &self.config.system_template)?;
        let query = self.build_query(&messages, &request);
        let url = signed_url(
            &self.endpoint,
            &self.config.api_key,
            &self.config.api_secret,
            &rfc1123_date(),
        )?;
        debug!(version = %self.config.version, stream = request.stream, "dispatching Spark request");

        let stream_mode = request.stream;
        let model = request.model.clone();
        let connect_timeout_secs = self.config.connect_timeout_secs;
        let read_timeout_secs = self.config.read_timeout_secs;

        Ok(Box::pin(try_stream! {
            let (mut ws, _) = timeout(
                Duration::from_secs(connect_timeout_secs),
                connect_async(&url),
            )
            .await
            .map_err(|_| Error::Timeout(connect_timeout_secs))?
            .map_err(|e| Error::Transport(format!("WebSocket connect failed: {e}")))?;

            ws.send(Message::text(query.to_string()))
                .await
                .map_err(|e| Error::Transport(format!("WebSocket send failed: {e}")))?;

            let mut full_text = String::new();
            let mut final_usage = None;
            let mut sid = None;
            loop {
                let msg = timeout(Duration::from_secs(read_timeout_secs), ws.next())
                    .await
                    .map_err(|_| Error::Timeout(read_timeout_secs))?;
                let Some(msg) = msg else {
                    Err(Error::Transport(
                        "connection closed before the terminal frame".to_string(),
                    ))?;
                    break;
                };
                let msg =
                    msg.map_err(|e| Error::Transport(format!("WebSocket read failed: {e}")))?;
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        Err(Error::Transport(
                            "connection closed before the terminal frame".to_string(),
                        ))?;
                        break;
                    }
                    _ => continue,
                };

                let frame: SparkFrame = serde_json::from_str(text.as_str())
                    .map_err(|e| Error::MalformedFrame(format!("invalid Spark frame: {e}")))?;
                if frame.header.code != 0 {
                    Err(Error::Upstream {
                        status: frame.header.code.try_into().unwrap_or(u16::MAX),
                        body: frame.header.message.clone(),
                    })?;
                }

                let finished = frame.header.status == 2;
                let piece = frame_text(&frame);
                let usage = frame_usage(&frame);
                if stream_mode {
                    let (prompt_tokens, completion_tokens) = usage.unzip();
                    yield ChatResponse::chunk(
                        piece,
                        &model,
                        0,
                        ResponseParts {
                            id: frame.header.sid.clone(),
                            prompt_tokens: prompt_tokens.unwrap_or_default(),
                            completion_tokens,
                            finish_reason: finished.then_some(FinishReason::Stop),
                        },
                    );
                } else {
                    full_text.push_str(&piece);
                    if usage.is_some() {
                        final_usage = usage;
                    }
                    sid = frame.header.sid.clone().or(sid);
                }
                if finished {
                    break;
                }
            }
            let _ = ws.close(None).await;

            if !stream_mode {
                let (prompt_tokens, completion_tokens) = final_usage.unzip();
                yield ChatResponse::completion(
                    full_text,
                    &model,
                    ResponseParts {
                        id: sid,
                        prompt_tokens: prompt_tokens.unwrap_or_default(),
                        completion_tokens,
                        ..Default::default()
                    },
                );
            }
        }))
    }
}
