//! Detects when the user asks to end the conversation.
//!
//! Handles punctuation, fillers ("please", "now") and common variants, with a
//! simple negation guard so that "don't end the chat" is not taken literally.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    EndChat,
    NotEndChat,
    Unknown,
}

/// Direct commands: "end the chat", "stop conversation", ...
const DIRECT: &str = r"(?:end|stop|close|finish|terminate|cancel)\s+(?:the\s+)?(?:chat|conversation|talk|session|dialog(?:ue)?)";
/// Colloquial short forms: "we're done", "that's all", ...
const COLLOQUIAL: &str = r"(?:we(?:'re|\s+are)\s+done|that(?:'s|\s+is)\s+(?:all|it)|all\s+done|enough\s+(?:for\s+)?now)";
/// Farewells used as an end signal.
const FAREWELL: &str =
    r"(?:good\s*bye|bye\b|see\s+you(?:\s+later)?|we(?:'ll|\s+will)\s+talk\s+later)";

fn end_chat_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b(?:{DIRECT}|{COLLOQUIAL}|{FAREWELL})"))
            .expect("end-chat regex should compile")
    })
}

/// A negation within about five words before the trigger verb.
fn negation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?is)\b(?:don'?t|do\s+not|no)\b.{0,40}\b(?:end|stop|close|finish|terminate|cancel)\b",
        )
        .expect("negation regex should compile")
    })
}

/// Classifies a recognized user utterance.
pub fn classify(utterance: &str) -> UserIntent {
    if utterance.trim().is_empty() {
        return UserIntent::Unknown;
    }
    if negation_pattern().is_match(utterance) {
        return UserIntent::NotEndChat;
    }
    if end_chat_pattern().is_match(utterance) {
        return UserIntent::EndChat;
    }
    UserIntent::Unknown
}

pub fn is_end_chat(utterance: &str) -> bool {
    classify(utterance) == UserIntent::EndChat
}
