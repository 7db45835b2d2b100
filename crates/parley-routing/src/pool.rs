//! Credential-pool routing adapter

use async_trait::async_trait;
use parley_core::{AdapterLookup, ChatAdapter, ChatRequest, Error, ResponseStream, Result};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Selection strategy over the credential pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolStrategy {
    /// Cyclic selection; any window of pool length covers each token once.
    RoundRobin,
    /// Uniform selection without memory.
    Random,
}

/// Routes each call to one token from an ordered pool, then delegates.
///
/// The round-robin cursor is shared across concurrent selections and advances
/// exactly once per selection. Payloads are never interpreted here.
pub struct PoolAdapter {
    tokens: Vec<String>,
    strategy: PoolStrategy,
    cursor: AtomicUsize,
    lookup: Arc<dyn AdapterLookup>,
}

impl PoolAdapter {
    pub fn new(
        tokens: Vec<String>,
        strategy: PoolStrategy,
        lookup: Arc<dyn AdapterLookup>,
    ) -> Result<Self> {
        if tokens.is_empty() {
            return Err(Error::Config("credential pool cannot be empty".to_string()));
        }
        Ok(Self {
            tokens,
            strategy,
            cursor: AtomicUsize::new(0),
            lookup,
        })
    }

    fn select(&self) -> &str {
        let index = match self.strategy {
            PoolStrategy::RoundRobin => {
                // Wrapping add with AcqRel ordering keeps concurrent
                // selections distinct and overflow-safe.
                let cursor = self
                    .cursor
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                        Some(cursor.wrapping_add(1))
                    })
                    .unwrap();
                cursor % self.tokens.len()
            }
            PoolStrategy::Random => rand::rng().random_range(0..self.tokens.len()),
        };
        &self.tokens[index]
    }
}

#[async_trait]
impl ChatAdapter for PoolAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let token = self.select();
        debug!(token = %token, strategy = ?self.strategy, "pool selected credential");
        let delegate = self.lookup.lookup(token).ok_or_else(|| {
            Error::Authentication(format!("no adapter configured for credential token {token}"))
        })?;
        delegate.chat_completions(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use parley_core::{ChatMessage, ChatResponse, ResponseParts, Role};
    use std::collections::HashMap;

    struct EchoAdapter(String);

    #[async_trait]
    impl ChatAdapter for EchoAdapter {
        async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
            let response =
                ChatResponse::completion(self.0.clone(), &request.model, ResponseParts::default());
            Ok(Box::pin(futures::stream::iter([Ok(response)])))
        }
    }

    struct MapLookup(HashMap<String, Arc<dyn ChatAdapter>>);

    impl AdapterLookup for MapLookup {
        fn lookup(&self, token: &str) -> Option<Arc<dyn ChatAdapter>> {
            self.0.get(token).cloned()
        }
    }

    fn echo_lookup(tokens: &[&str]) -> Arc<dyn AdapterLookup> {
        let map: HashMap<String, Arc<dyn ChatAdapter>> = tokens
            .iter()
            .map(|token| {
                (
                    token.to_string(),
                    Arc::new(EchoAdapter(token.to_string())) as Arc<dyn ChatAdapter>,
                )
            })
            .collect();
        Arc::new(MapLookup(map))
    }

    fn tokens(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_pool_is_a_config_error() {
        let err = PoolAdapter::new(vec![], PoolStrategy::RoundRobin, echo_lookup(&[]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn round_robin_cycles_through_the_pool() {
        let pool = PoolAdapter::new(
            tokens(&["a", "b", "c"]),
            PoolStrategy::RoundRobin,
            echo_lookup(&["a", "b", "c"]),
        )
        .unwrap();

        let selected: Vec<_> = (0..4).map(|_| pool.select().to_string()).collect();
        assert_eq!(selected, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_survives_cursor_overflow() {
        let pool = PoolAdapter::new(
            tokens(&["a", "b"]),
            PoolStrategy::RoundRobin,
            echo_lookup(&["a", "b"]),
        )
        .unwrap();
        pool.cursor.store(usize::MAX - 1, Ordering::Release);

        for _ in 0..4 {
            let token = pool.select();
            assert!(token == "a" || token == "b");
        }
    }

    #[test]
    fn concurrent_round_robin_covers_tokens_evenly() {
        let pool = Arc::new(
            PoolAdapter::new(
                tokens(&["a", "b", "c"]),
                PoolStrategy::RoundRobin,
                echo_lookup(&["a", "b", "c"]),
            )
            .unwrap(),
        );

        let mut handles = vec![];
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::with_capacity(100);
                for _ in 0..100 {
                    seen.push(pool.select().to_string());
                }
                seen
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for token in handle.join().unwrap() {
                *counts.entry(token).or_insert(0) += 1;
            }
        }

        // 600 selections over a pool of 3: perfect cyclic coverage means
        // exactly 200 per token, regardless of interleaving.
        assert_eq!(counts.get("a"), Some(&200));
        assert_eq!(counts.get("b"), Some(&200));
        assert_eq!(counts.get("c"), Some(&200));
    }

    #[test]
    fn random_selection_stays_within_the_pool() {
        let pool = PoolAdapter::new(
            tokens(&["a", "b", "c"]),
            PoolStrategy::Random,
            echo_lookup(&["a", "b", "c"]),
        )
        .unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.select().to_string());
        }
        assert!(seen.iter().all(|t| ["a", "b", "c"].contains(&t.as_str())));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn delegates_to_the_selected_adapter() {
        let pool = PoolAdapter::new(
            tokens(&["a", "b"]),
            PoolStrategy::RoundRobin,
            echo_lookup(&["a", "b"]),
        )
        .unwrap();

        let request = ChatRequest::new("m", vec![ChatMessage::new(Role::User, "hi")]);
        let first: Vec<_> = pool
            .chat_completions(request.clone())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let second: Vec<_> = pool
            .chat_completions(request)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(first[0].text(), Some("a"));
        assert_eq!(second[0].text(), Some("b"));
    }

    #[tokio::test]
    async fn unknown_token_is_an_authentication_error() {
        let pool = PoolAdapter::new(
            tokens(&["missing"]),
            PoolStrategy::RoundRobin,
            echo_lookup(&["present"]),
        )
        .unwrap();

        let err = pool
            .chat_completions(ChatRequest::new("m", vec![ChatMessage::new(Role::User, "x")]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
