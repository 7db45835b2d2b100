//! Role folding for vendors without native multi-role messages

use parley_core::{ChatMessage, Error, Result, Role};

/// Default template used to fold a system turn into a user turn.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You need to follow the system settings:{system}";

/// Expand system turns through `template` into a user/assistant("ok") pair.
///
/// Vendors handled here have no system role and no function role at all;
/// function turns are rejected before any network call.
pub fn fold_system_messages(messages: &[ChatMessage], template: &str) -> Result<Vec<ChatMessage>> {
    let mut folded = Vec::with_capacity(messages.len() + 2);
    for message in messages {
        match message.role {
            Role::Function => return Err(Error::UnsupportedRole("function".to_string())),
            Role::System => {
                let content = template.replace("{system}", message.text());
                folded.push(ChatMessage::new(Role::User, content));
                folded.push(ChatMessage::new(Role::Assistant, "ok"));
            }
            Role::User | Role::Assistant => folded.push(message.clone()),
        }
    }
    Ok(folded)
}
