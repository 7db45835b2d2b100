//! Parley Egress Connectors
//!
//! This crate provides the protocol translators to upstream conversational
//! backends:
//! - OpenAI-compatible, Azure, Anthropic, Gemini, Qwen and Zhipu REST/SSE
//!   adapters
//! - The Spark signed-request WebSocket client
//! - The Copilot conversational WebSocket client
//! - The signing-token cache shared by credential-signed APIs

pub mod anthropic;
pub mod azure;
pub mod client;
pub mod copilot;
pub mod gemini;
pub mod openai;
pub mod prompt;
pub mod qwen;
pub mod sign;
pub mod spark;
pub mod zhipu;
