//! Terminal-backed capabilities.
//!
//! Speech is printed, recognized speech is read from stdin, and behaviors and
//! moods are logged. Completions fire after a simulated duration so the
//! session sees the same asynchronous shape as real speech and motion.

use buddychat_core::capabilities::Completion;
use buddychat_core::{
    BehaviorAnimator, Capabilities, MoodSetter, SessionError, SpeechInput, SpeechOutput,
    StateListener,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

const WORD_DURATION: Duration = Duration::from_millis(300);
const BEHAVIOR_DURATION: Duration = Duration::from_millis(1_500);

fn complete_after(runtime: &Handle, delay: Duration, on_done: Completion) {
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        on_done();
    });
}

/// Prints utterances; "speaking" takes longer for longer text.
pub struct ConsoleSpeech {
    runtime: Handle,
    ready: AtomicBool,
}

impl ConsoleSpeech {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            ready: AtomicBool::new(false),
        }
    }
}

impl SpeechOutput for ConsoleSpeech {
    fn start(&self) -> bool {
        self.ready.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    fn speak(&self, text: &str, on_done: Completion) {
        if !self.ready.load(Ordering::SeqCst) {
            warn!("Speech output is not started; dropping utterance.");
            on_done();
            return;
        }
        println!("buddy> {text}");
        let words = text.split_whitespace().count().max(1) as u32;
        complete_after(&self.runtime, WORD_DURATION * words, on_done);
    }
}

/// A listening flag; stdin lines only count as speech while it is set.
#[derive(Default)]
pub struct ConsoleInput {
    listening: AtomicBool,
}

impl ConsoleInput {
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

impl SpeechInput for ConsoleInput {
    fn start(&self) -> bool {
        self.listening.store(true, Ordering::SeqCst);
        info!("Listening.");
        true
    }

    fn pause(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
        info!("Stopped listening.");
    }
}

pub struct LoggingAnimator {
    runtime: Handle,
}

impl LoggingAnimator {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl BehaviorAnimator for LoggingAnimator {
    fn play(&self, name: &str, on_done: Completion) {
        info!(behavior = name, "Playing behavior.");
        complete_after(&self.runtime, BEHAVIOR_DURATION, on_done);
    }
}

pub struct LoggingMood;

impl MoodSetter for LoggingMood {
    fn set_mood(&self, name: &str, duration: Option<Duration>) {
        match duration {
            Some(d) => info!(mood = name, ms = d.as_millis() as u64, "Mood."),
            None => info!(mood = name, "Mood."),
        }
    }

    fn set_positivity_energy(&self, valence: f32, arousal: f32) {
        info!(valence, arousal, "Positivity/energy.");
    }
}

/// Prints session status changes for the operator.
pub struct ConsoleStatus;

impl StateListener for ConsoleStatus {
    fn on_state_change(&self, is_active: bool) {
        if is_active {
            println!("[chat started]");
        } else {
            println!("[chat ended]");
        }
    }

    fn on_failure(&self, error: &SessionError) {
        println!("[chat error] {error}");
    }
}

/// Console capabilities plus a handle on the listening flag.
pub struct Console {
    pub capabilities: Capabilities,
    pub input: Arc<ConsoleInput>,
}

impl Console {
    pub fn new(runtime: Handle) -> Self {
        let input = Arc::new(ConsoleInput::default());
        let capabilities = Capabilities {
            speech_output: Arc::new(ConsoleSpeech::new(runtime.clone())),
            speech_input: input.clone(),
            animator: Arc::new(LoggingAnimator::new(runtime)),
            mood: Arc::new(LoggingMood),
        };
        Self {
            capabilities,
            input,
        }
    }
}

/// Operator commands typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Quit,
    Say(String),
}

impl ConsoleCommand {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "/start" => Some(Self::Start),
            "/stop" => Some(Self::Stop),
            "/quit" | "/exit" => Some(Self::Quit),
            text => Some(Self::Say(text.to_string())),
        }
    }
}
