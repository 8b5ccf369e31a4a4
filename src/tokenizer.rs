//! Cheap token-count estimator used wherever a real usage figure isn't
//! available: rate-limiting's token descriptor, and filling in response
//! usage when a provider omits it. Not a BPE tokenizer — out of scope, same
//! as the Non-goal "not a training/inference engine".

use crate::schemas::{ChatRequest, Message};

/// `ceil(chars / 4)`, minimum 1, matching the estimator the teacher's
/// `rate_limiting.rs` already used.
pub fn estimate_tokens(text: &str) -> u32 {
    let len = text.chars().count();
    (((len + 3) / 4).max(1)) as u32
}

pub fn estimate_prompt_tokens(request: &ChatRequest) -> u32 {
    request.messages.iter().map(message_tokens).sum::<u32>().max(1)
}

fn message_tokens(message: &Message) -> u32 {
    let content = match &message.content {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    estimate_tokens(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_at_least_one() {
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn estimate_scales_with_length() {
        assert!(estimate_tokens(&"a".repeat(400)) > estimate_tokens(&"a".repeat(4)));
    }
}
