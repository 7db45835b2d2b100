//! Error taxonomy shared across the Parley workspace

use thiserror::Error;

/// All failure modes an adapter call can surface.
///
/// Policy conditions reported by upstreams (throttling, CAPTCHA, conversation
/// limits) are distinct variants so callers can branch on them without string
/// matching. Routing adapters propagate delegate errors unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Construction-time misconfiguration; never reaches request handling.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Missing or invalid credential, raised before any network call.
    #[error("Invalid authentication: {0}")]
    Authentication(String),

    /// A canonical request the adapter cannot serve (e.g. no messages).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Non-success HTTP status from an upstream, with the raw body attached.
    #[error("Upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Bounded wait expired. Never reported as empty output.
    #[error("Request timeout after {0}s")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream produced a payload the protocol translator cannot decode.
    #[error("Malformed upstream frame: {0}")]
    MalformedFrame(String),

    #[error("Request is throttled: {0}")]
    Throttled(String),

    #[error("CAPTCHA challenge requires manual intervention: {0}")]
    CaptchaChallenge(String),

    /// The conversational session hit its message ceiling; fatal, not retryable.
    #[error("Reached conversation limit of {max} messages")]
    ConversationLimit { max: u32 },

    /// A message role the backend cannot represent, raised before any network call.
    #[error("Unsupported message role: {0}")]
    UnsupportedRole(String),

    /// Upstream closed the turn without producing a final message.
    #[error("No response was returned")]
    NoResponse,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_upstream_status() {
        let err = Error::Upstream {
            status: 429,
            body: "quota exceeded".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("429"));
        assert!(rendered.contains("quota exceeded"));
    }

    #[test]
    fn display_carries_conversation_limit() {
        let err = Error::ConversationLimit { max: 30 };
        assert_eq!(err.to_string(), "Reached conversation limit of 30 messages");
    }

    #[test]
    fn serde_json_errors_convert() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
