//! Routes inbound frames to speech, behavior and mood outputs.

use crate::capabilities::{Capabilities, moods, noop};
use crate::cues;
use crate::protocol::{Frame, ServerMessage};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Stateless router over the capability set.
#[derive(Clone)]
pub struct MessageDispatcher {
    capabilities: Capabilities,
}

impl MessageDispatcher {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    /// Handles one raw frame. Malformed frames are logged and dropped.
    pub fn dispatch(&self, raw: &str) {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        match frame.message() {
            ServerMessage::LlmResponse { text } => {
                let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                    debug!("Ignoring llm_response without text.");
                    return;
                };
                let cue = cues::classify(&text);
                if cue != cues::ReplyCue::None {
                    debug!(?cue, "Reply cue detected.");
                }
                cues::respond(
                    cue,
                    self.capabilities.animator.as_ref(),
                    self.capabilities.mood.as_ref(),
                );
                self.capabilities.speech_output.speak(&text, noop());
            }
            ServerMessage::Affect { valence, arousal } => {
                debug!(valence, arousal, "Applying affect.");
                let mood = &self.capabilities.mood;
                mood.set_mood(moods::NEUTRAL, None);
                mood.set_positivity_energy(valence, arousal);
            }
            ServerMessage::Expression { name, duration_ms } => {
                debug!(%name, duration_ms, "Applying expression.");
                self.capabilities
                    .mood
                    .set_mood(&name, Some(Duration::from_millis(duration_ms)));
            }
            ServerMessage::Unknown(kind) => {
                debug!(%kind, "Ignoring frame of unknown type.");
            }
        }
    }

    /// Starts the single ordered dispatch path. Frames sent to the returned
    /// queue are handled one at a time, in the order they were sent, and only
    /// while the queue is live. A new queue starts closed.
    pub fn spawn(self) -> DispatchQueue {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let live = Arc::new(AtomicBool::new(false));
        let gate = live.clone();
        let dispatcher = Arc::new(self);
        let task = tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                if !gate.load(Ordering::SeqCst) {
                    debug!("No live chat; dropping queued inbound frame.");
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&raw)));
                if result.is_err() {
                    error!("A capability panicked while handling an inbound frame; frame dropped.");
                }
            }
            debug!("Dispatch queue closed.");
        });
        DispatchQueue { sender, live, task }
    }
}

/// Handle to the running dispatch task.
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<String>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DispatchQueue {
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.sender.clone()
    }

    /// Frames still queued when the queue goes idle are dropped, not handled.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops accepting new frames and waits for the queued ones.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            warn!("Dispatch task ended abnormally: {}", e);
        }
    }
}
