//! Capability interfaces consumed by the session core.
//!
//! Speech, behavior and mood are provided by external collaborators. Every
//! operation is fire-and-forget: long-running work reports completion through a
//! [`Completion`] callback, which may be invoked from any thread.

use std::sync::Arc;
use std::time::Duration;

/// Continuation invoked once when an asynchronous capability operation ends.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// A completion that does nothing.
pub fn noop() -> Completion {
    Box::new(|| {})
}

/// Named behaviors the core asks the animator to play.
pub mod behaviors {
    pub const WAKE: &str = "wake";
    pub const SLEEP: &str = "sleep";
    pub const NOD_YES: &str = "nod_yes";
    pub const SHAKE_NO: &str = "shake_no";
}

/// Named moods the core sets.
pub mod moods {
    pub const NEUTRAL: &str = "NEUTRAL";
    pub const HAPPY: &str = "HAPPY";
    pub const SAD: &str = "SAD";
    pub const TIRED: &str = "TIRED";
    pub const THINKING: &str = "THINKING";
}

/// Text-to-speech.
pub trait SpeechOutput: Send + Sync {
    /// Enables speech output. Returns `false` when the engine is not ready.
    fn start(&self) -> bool;
    fn stop(&self);
    /// Speaks `text`; `on_done` fires when speech finishes or fails.
    fn speak(&self, text: &str, on_done: Completion);
}

/// Speech recognition.
pub trait SpeechInput: Send + Sync {
    /// Starts (or resumes) listening. Returns `false` when unavailable.
    fn start(&self) -> bool;
    fn pause(&self);
    fn stop(&self);
}

/// Predefined animated routines such as waking up or falling asleep.
pub trait BehaviorAnimator: Send + Sync {
    fn play(&self, name: &str, on_done: Completion);
}

/// Facial expression control.
pub trait MoodSetter: Send + Sync {
    /// Shows the named mood, for `duration` if given, otherwise until replaced.
    fn set_mood(&self, name: &str, duration: Option<Duration>);
    /// Sets valence (positivity) and arousal (energy); meaningful on a neutral face.
    fn set_positivity_energy(&self, valence: f32, arousal: f32);
}

/// The full set of collaborators the core drives.
#[derive(Clone)]
pub struct Capabilities {
    pub speech_output: Arc<dyn SpeechOutput>,
    pub speech_input: Arc<dyn SpeechInput>,
    pub animator: Arc<dyn BehaviorAnimator>,
    pub mood: Arc<dyn MoodSetter>,
}
