//! Adapter trait definitions

use crate::{
    Result,
    chat::{ChatRequest, ChatResponse},
};
use futures::Stream;
use std::{pin::Pin, sync::Arc};

/// Lazy sequence of canonical responses produced by one adapter call.
///
/// For `request.stream == false` the sequence yields exactly one
/// `ChatResponse::Completion` (or fails). For `true` it yields one or more
/// `ChatResponse::Chunk`s and the final chunk carries a `finish_reason`.
/// Nothing is computed until polled; dropping the stream releases whatever
/// transport it holds (HTTP body, socket).
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ChatResponse>> + Send>>;

/// The single capability every backend adapter implements.
///
/// Adapters are safe for concurrent invocation; a call is stateless
/// per-request except for the conversational WebSocket client, which
/// serializes its turns internally.
#[async_trait::async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Submit a canonical request and produce its response sequence.
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream>;
}

/// Resolves an opaque credential token to a configured adapter instance.
///
/// This is the boundary to whatever owns the adapter table; routing adapters
/// use it to pick a delegate per call.
pub trait AdapterLookup: Send + Sync {
    fn lookup(&self, token: &str) -> Option<Arc<dyn ChatAdapter>>;
}
