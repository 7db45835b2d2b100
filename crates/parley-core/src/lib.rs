//! Parley Core Types and Traits
//!
//! This crate provides the fundamental pieces used throughout Parley:
//! - Canonical chat-completion request/response types
//! - The `ChatAdapter` capability trait and the credential lookup boundary
//! - Streaming delta reconstruction for cumulative vendor payloads
//! - The shared error taxonomy

pub mod adapter;
pub mod chat;
pub mod error;
pub mod stream;
pub mod token_count;

pub use adapter::{AdapterLookup, ChatAdapter, ResponseStream};
pub use chat::{
    ChatChunk, ChatCompletion, ChatMessage, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta,
    FinishReason, ResponseParts, Role, Usage,
};
pub use error::{Error, Result};
