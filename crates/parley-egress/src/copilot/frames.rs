//! ChatHub frame decoding
//!
//! Socket messages carry one or more JSON objects separated by a record
//! separator. Objects are dispatched by their numeric `type` tag; anything
//! outside the update/final pair decodes to an explicit unrecognized case so
//! it can be logged rather than silently dropped.

use parley_core::{Error, Result};
use serde::Deserialize;

/// One decoded ChatHub object.
#[derive(Debug)]
pub(crate) enum ChatHubFrame {
    /// type 1: in-progress transcript update
    Update(UpdateArguments),
    /// type 2: final turn result
    Final(FinalItem),
    /// Handshake acks, pings, unknown tags
    Unrecognized(Option<u64>),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<u64>,
    #[serde(default)]
    arguments: Vec<UpdateArguments>,
    item: Option<FinalItem>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UpdateArguments {
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FinalItem {
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
    pub throttling: Option<Throttling>,
    pub result: Option<TurnResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TranscriptMessage {
    pub text: Option<String>,
    #[serde(default)]
    pub adaptive_cards: Vec<AdaptiveCard>,
    #[serde(default)]
    pub suggested_responses: Vec<SuggestedResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AdaptiveCard {
    #[serde(default)]
    pub body: Vec<CardBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CardBody {
    pub text: Option<String>,
    pub inlines: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Throttling {
    #[serde(default)]
    pub num_user_messages_in_conversation: u32,
    pub max_num_user_messages_in_conversation: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TurnResult {
    pub value: String,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SuggestedResponse {
    pub text: String,
}

impl TranscriptMessage {
    /// Informational "searching the web" entries carry an inline card body
    /// without literal text.
    pub(crate) fn is_search_progress(&self) -> bool {
        self.adaptive_cards
            .first()
            .and_then(|card| card.body.first())
            .is_some_and(|body| body.inlines.is_some() && body.text.is_none())
    }
}

pub(crate) fn decode_frame(raw: &str) -> Result<ChatHubFrame> {
    let frame: RawFrame = serde_json::from_str(raw)
        .map_err(|e| Error::MalformedFrame(format!("undecodable ChatHub frame: {e}")))?;
    Ok(match frame.kind {
        Some(1) => ChatHubFrame::Update(frame.arguments.into_iter().next().unwrap_or_default()),
        Some(2) => match frame.item {
            Some(item) => ChatHubFrame::Final(item),
            None => ChatHubFrame::Unrecognized(Some(2)),
        },
        other => ChatHubFrame::Unrecognized(other),
    })
}

/// Index of the last transcript entry with answer text, stepping backwards
/// over a trailing image-attachment placeholder.
pub(crate) fn last_substantive_index(messages: &[TranscriptMessage]) -> Option<usize> {
    let mut index = messages.len().checked_sub(1)?;
    let trailing_inline = messages[index]
        .adaptive_cards
        .last()
        .and_then(|card| card.body.first())
        .is_some_and(|body| body.inlines.is_some());
    if trailing_inline {
        index = index.checked_sub(1)?;
    }
    if messages[index].text.is_none() {
        index = index.checked_sub(1)?;
    }
    Some(index)
}
