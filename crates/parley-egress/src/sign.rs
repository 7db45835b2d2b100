//! Signing-token cache for credential-signed upstream APIs
//!
//! Tokens are HS256-signed per credential and cached with an expiry shorter
//! than their server-side validity, so a stale-but-unexpired token is always
//! reused rather than regenerated. Reads are frequent; writes happen only on
//! expiry.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use parley_core::{Error, Result};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

type HmacSha256 = Hmac<Sha256>;

/// Server-side validity of issued tokens.
const TOKEN_TTL: Duration = Duration::from_secs(3 * 60);

/// Cache expiry, kept ahead of the server-side validity.
const CACHE_TTL: Duration = Duration::from_secs(3 * 60 - 30);

struct CachedToken {
    token: String,
    issued_at: Instant,
}

/// Process-wide cache of signed tokens keyed by credential secret.
///
/// Owned and injected explicitly so tests can instantiate isolated caches.
pub struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Signed token for `credential`, reusing any unexpired cached one.
    ///
    /// The credential must look like `<key>.<secret>`.
    pub fn token(&self, credential: &str) -> Result<String> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(cached) = entries.get(credential)
            && cached.issued_at.elapsed() < self.ttl
        {
            return Ok(cached.token.clone());
        }

        let token = sign_token(credential)?;
        entries.insert(
            credential.to_string(),
            CachedToken {
                token: token.clone(),
                issued_at: Instant::now(),
            },
        );
        Ok(token)
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sign_token(credential: &str) -> Result<String> {
    let (api_key, secret) = credential.split_once('.').ok_or_else(|| {
        Error::Authentication("credential must look like <key>.<secret>".to_string())
    })?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let header = json!({"alg": "HS256", "sign_type": "SIGN"});
    let payload = json!({
        "api_key": api_key,
        "exp": now_ms + TOKEN_TTL.as_millis() as i64,
        "timestamp": now_ms,
    });

    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Authentication(format!("invalid signing secret: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_three_segments() {
        let token = sign_token("my-key.my-secret").unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn header_decodes_as_expected() {
        let token = sign_token("my-key.my-secret").unwrap();
        let header_b64 = token.split('.').next().unwrap();
        let header = URL_SAFE_NO_PAD.decode(header_b64).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["sign_type"], "SIGN");
    }

    #[test]
    fn malformed_credential_is_rejected() {
        let err = sign_token("no-dot-here").unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn unexpired_token_is_reused() {
        let cache = TokenCache::new();
        let first = cache.token("key.secret").unwrap();
        let second = cache.token("key.secret").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn expired_token_is_regenerated() {
        let cache = TokenCache::with_ttl(Duration::ZERO);
        let first = cache.token("key.secret").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = cache.token("key.secret").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn distinct_credentials_get_distinct_tokens() {
        let cache = TokenCache::new();
        let a = cache.token("key-a.secret").unwrap();
        let b = cache.token("key-b.secret").unwrap();
        assert_ne!(a, b);
    }
}
