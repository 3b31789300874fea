//! Reactive cue scan over model replies.
//!
//! A reply that opens with an affirmation, negation, apology or reassurance
//! triggers a small body-language response before it is spoken.

use crate::capabilities::{BehaviorAnimator, MoodSetter, behaviors, moods, noop};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const CUE_MOOD_DURATION: Duration = Duration::from_millis(3_000);

/// Category of the opening of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCue {
    Affirm,
    Negate,
    Reassure,
    Apology,
    None,
}

struct CuePatterns {
    reassure: Regex,
    apology: Regex,
    affirm: Regex,
    negate: Regex,
}

fn patterns() -> &'static CuePatterns {
    static PATTERNS: OnceLock<CuePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CuePatterns {
        reassure: Regex::new(
            r"(?i)^[\p{P}\s]*(?:no\s+(?:worries|problems?|big\s+deal|sweat|trouble)\b|all\s+good\b|it'?s\s+(?:ok(?:ay)?|fine|alright)\b|that'?s\s+(?:ok(?:ay)?|fine|alright)\b|you'?re\s+fine\b|you\s*[’']?re\s+welcome\b|you\s+are\s+welcome\b|thank\s+you\b|thanks\b|cheers\b|great\b|awesome\b)",
        )
        .expect("reassurance regex should compile"),
        apology: Regex::new(
            r"(?i)^[\p{P}\s]*(?:sorry\b|my\s+bad\b|i\s+apologi[sz]e\b|apologies\b|pardon\b|i\s+(?:cannot|can\s*not|can'?t|won'?t|shouldn'?t)\b|i\s*[’']?m\s+(?:unable|not\s+able)\b|won'?t\s+be\s+able\s+to\b|can(?:not|'?t)\b)",
        )
        .expect("apology regex should compile"),
        affirm: Regex::new(
            r"(?i)^\s*(?:yes|yep|yeah|yah|sure|of\s+course|absolutely|affirmative|correct|indeed|right|certainly)\b",
        )
        .expect("affirmation regex should compile"),
        negate: Regex::new(r"(?i)^\s*(?:no|nope|nah|negative|never|incorrect|wrong)\b")
            .expect("negation regex should compile"),
    })
}

/// Classifies the opening of a reply. Reassurance beats negation, so
/// "no worries" is a reassurance rather than a "no".
pub fn classify(text: &str) -> ReplyCue {
    let p = patterns();
    if p.reassure.is_match(text) {
        ReplyCue::Reassure
    } else if p.apology.is_match(text) {
        ReplyCue::Apology
    } else if p.affirm.is_match(text) {
        ReplyCue::Affirm
    } else if p.negate.is_match(text) {
        ReplyCue::Negate
    } else {
        ReplyCue::None
    }
}

/// Plays the body-language response for a cue. Fire-and-forget.
pub fn respond(cue: ReplyCue, animator: &dyn BehaviorAnimator, mood: &dyn MoodSetter) {
    match cue {
        ReplyCue::Affirm => {
            mood.set_mood(moods::HAPPY, Some(CUE_MOOD_DURATION));
            animator.play(behaviors::NOD_YES, noop());
        }
        ReplyCue::Negate => animator.play(behaviors::SHAKE_NO, noop()),
        ReplyCue::Reassure => mood.set_mood(moods::HAPPY, Some(CUE_MOOD_DURATION)),
        ReplyCue::Apology => {
            mood.set_mood(moods::SAD, Some(CUE_MOOD_DURATION));
            animator.play(behaviors::SHAKE_NO, noop());
        }
        ReplyCue::None => {}
    }
}
