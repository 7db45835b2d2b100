//! Copilot protocol constants

/// Record separator delimiting JSON objects inside one socket message.
pub(crate) const DELIMITER: char = '\u{1e}';

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";

pub(crate) const ORIGIN: &str = "https://copilot.microsoft.com";
pub(crate) const REFERER: &str = "https://copilot.microsoft.com/";

pub(crate) const BUNDLE_VERSION: &str = "1.1381.12";

/// Option sets sent on every turn.
pub(crate) const DEFAULT_OPTIONS: &[&str] = &[
    "nlu_direct_response_filter",
    "deepleo",
    "disable_emoji_spoken_text",
    "responsible_ai_policy_235",
    "enablemm",
    "dv3sugg",
    "iyxapbing",
    "iycapbing",
    "saharagenconv5",
    "eredirecturl",
];

/// Options added when authenticated cookies are in use.
pub(crate) const COOKIE_OPTIONS: &[&str] = &["autosave"];

/// Options that disable web search.
pub(crate) const NO_SEARCH_OPTIONS: &[&str] = &["nosearchall"];

pub(crate) const CONVERSATION_HISTORY_OPTIONS: &[&str] =
    &["autosave", "savemem", "uprofupd", "uprofgen"];

pub(crate) const ALLOWED_MESSAGE_TYPES: &[&str] = &[
    "Chat",
    "ActionRequest",
    "AdsQuery",
    "ConfirmationCard",
    "Context",
    "Disengaged",
    "InternalLoaderMessage",
    "InternalSearchQuery",
    "InternalSearchResult",
    "InvokeAction",
    "Progress",
    "RenderCardRequest",
    "RenderContentRequest",
    "SemanticSerp",
    "GenerateContentQuery",
    "SearchQuery",
];
