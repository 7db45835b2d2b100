//! Completion-token counting for vendors that report no usage figures

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static BPE: Lazy<CoreBPE> = Lazy::new(|| {
    tiktoken_rs::cl100k_base().expect("load embedded cl100k_base vocabulary")
});

/// Number of cl100k_base tokens in `text`.
pub fn count_tokens(text: &str) -> u32 {
    BPE.encode_with_special_tokens(text).len() as u32
}
