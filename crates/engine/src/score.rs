//! Message importance scoring for the smart compressor.
//!
//! Additive signals over [0, 100]: position (head +30, tail +25), role
//! (user +10), tool calls (+20), configured keyword hits (+15), code blocks
//! (+12), structured content (+8). Head and tail messages are retained
//! unconditionally regardless of score.

use rv_domain::message::{Message, Role};

pub const SCORE_CRITICAL: u32 = 50;
pub const SCORE_HIGH: u32 = 35;
pub const SCORE_MEDIUM: u32 = 20;
pub const SCORE_LOW: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Critical,
    High,
    Medium,
    Low,
    Trivial,
}

pub fn bucket(score: u32) -> Bucket {
    match score {
        s if s >= SCORE_CRITICAL => Bucket::Critical,
        s if s >= SCORE_HIGH => Bucket::High,
        s if s >= SCORE_MEDIUM => Bucket::Medium,
        s if s >= SCORE_LOW => Bucket::Low,
        _ => Bucket::Trivial,
    }
}

/// Score one message given its position class.
pub fn score_message(msg: &Message, is_head: bool, is_tail: bool, keywords: &[String]) -> u32 {
    let mut score = 0u32;

    if is_head {
        score += 30;
    }
    if is_tail {
        score += 25;
    }
    if msg.role == Role::User {
        score += 10;
    }
    if msg.has_tool_calls() {
        score += 20;
    }

    let text = msg.text();
    let lower = text.to_lowercase();
    if keywords.iter().any(|k| lower.contains(k.as_str())) {
        score += 15;
    }
    if text.contains("```") {
        score += 12;
    }
    if looks_structured(text) {
        score += 8;
    }

    score.min(100)
}

/// JSON-ish or table-ish content the summarizer would garble.
fn looks_structured(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[') || text.contains("\n|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv_domain::message::ToolCall;

    fn keywords() -> Vec<String> {
        vec!["decision".into(), "todo".into()]
    }

    #[test]
    fn plain_middle_chatter_is_trivial() {
        let msg = Message::assistant("sure, sounds good");
        assert_eq!(bucket(score_message(&msg, false, false, &keywords())), Bucket::Trivial);
    }

    #[test]
    fn tool_call_messages_reach_medium() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("add", serde_json::json!({}))],
        );
        let s = score_message(&msg, false, false, &keywords());
        assert!(s >= SCORE_MEDIUM, "{s}");
    }

    #[test]
    fn keyworded_user_message_in_tail_is_critical() {
        let msg = Message::user("the decision is to ship tomorrow");
        let s = score_message(&msg, false, true, &keywords());
        assert!(s >= SCORE_CRITICAL, "{s}");
    }

    #[test]
    fn code_and_structured_bonuses_stack() {
        let code = Message::assistant("```rust\nfn main() {}\n```");
        assert_eq!(score_message(&code, false, false, &keywords()), 12);

        let json = Message::assistant("{\"k\": 1}");
        assert_eq!(score_message(&json, false, false, &keywords()), 8);
    }

    #[test]
    fn head_bonus_applies() {
        let msg = Message::user("hello");
        let s = score_message(&msg, true, false, &keywords());
        assert_eq!(s, 40); // head 30 + user 10
    }

    #[test]
    fn buckets_partition_the_range() {
        assert_eq!(bucket(55), Bucket::Critical);
        assert_eq!(bucket(40), Bucket::High);
        assert_eq!(bucket(25), Bucket::Medium);
        assert_eq!(bucket(12), Bucket::Low);
        assert_eq!(bucket(5), Bucket::Trivial);
    }
}
