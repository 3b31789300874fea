//! Recording fakes shared by the unit tests.

use crate::capabilities::{
    BehaviorAnimator, Capabilities, Completion, MoodSetter, SpeechInput, SpeechOutput,
};
use crate::error::TransportError;
use crate::transport::{Connector, Link, LinkEvent, Outbound};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use url::Url;

/// One observed capability call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    OutputStart,
    OutputStop,
    Speak(String),
    InputStart,
    InputPause,
    InputStop,
    Play(String),
    /// Mood name and duration in milliseconds.
    SetMood(String, Option<u64>),
    PositivityEnergy(f32, f32),
}

#[derive(Default)]
struct Behavior {
    output_unavailable: bool,
    input_unavailable: bool,
    input_panics: bool,
    hold_completions: bool,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    held: Vec<(String, Completion)>,
}

/// Implements every capability trait and records what was asked of it.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    state: Arc<Mutex<State>>,
    behavior: Arc<Mutex<Behavior>>,
}

impl Recorder {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().calls.clear();
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities {
            speech_output: Arc::new(self.clone()),
            speech_input: Arc::new(self.clone()),
            animator: Arc::new(self.clone()),
            mood: Arc::new(self.clone()),
        }
    }

    pub(crate) fn output_unavailable(&self) {
        self.behavior.lock().output_unavailable = true;
    }

    pub(crate) fn input_unavailable(&self) {
        self.behavior.lock().input_unavailable = true;
    }

    pub(crate) fn input_panics(&self) {
        self.behavior.lock().input_panics = true;
    }

    /// Keeps completions until [`Recorder::finish`] instead of running them.
    pub(crate) fn hold_completions(&self) {
        self.behavior.lock().hold_completions = true;
    }

    /// Runs every held completion labelled `label` (a behavior name, or
    /// `"speak"`). Returns how many ran.
    pub(crate) fn finish(&self, label: &str) -> usize {
        let ready: Vec<Completion> = {
            let mut state = self.state.lock();
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.held)
                .into_iter()
                .partition(|(l, _)| l == label);
            state.held = rest;
            matching.into_iter().map(|(_, done)| done).collect()
        };
        let count = ready.len();
        for done in ready {
            done();
        }
        count
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn complete(&self, label: &str, done: Completion) {
        if self.behavior.lock().hold_completions {
            self.state.lock().held.push((label.to_string(), done));
        } else {
            done();
        }
    }
}

impl SpeechOutput for Recorder {
    fn start(&self) -> bool {
        self.record(Call::OutputStart);
        !self.behavior.lock().output_unavailable
    }

    fn stop(&self) {
        self.record(Call::OutputStop);
    }

    fn speak(&self, text: &str, on_done: Completion) {
        self.record(Call::Speak(text.to_string()));
        self.complete("speak", on_done);
    }
}

impl SpeechInput for Recorder {
    fn start(&self) -> bool {
        self.record(Call::InputStart);
        let behavior = self.behavior.lock();
        if behavior.input_panics {
            drop(behavior);
            panic!("microphone driver crashed");
        }
        !behavior.input_unavailable
    }

    fn pause(&self) {
        self.record(Call::InputPause);
    }

    fn stop(&self) {
        self.record(Call::InputStop);
    }
}

impl BehaviorAnimator for Recorder {
    fn play(&self, name: &str, on_done: Completion) {
        self.record(Call::Play(name.to_string()));
        self.complete(name, on_done);
    }
}

impl MoodSetter for Recorder {
    fn set_mood(&self, name: &str, duration: Option<Duration>) {
        self.record(Call::SetMood(
            name.to_string(),
            duration.map(|d| d.as_millis() as u64),
        ));
    }

    fn set_positivity_energy(&self, valence: f32, arousal: f32) {
        self.record(Call::PositivityEnergy(valence, arousal));
    }
}

/// The far end of a fake connection.
pub(crate) struct ServerSide {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerSide {
    pub(crate) fn push(&self, text: &str) {
        let _ = self.events.send(LinkEvent::Message(text.to_string()));
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn fail(&self, error: &str) {
        let _ = self.events.send(LinkEvent::Failed(error.to_string()));
    }

    /// Everything the client has queued so far.
    pub(crate) fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// In-memory [`Connector`] with scripted failures and an optional gate.
pub(crate) struct FakeConnector {
    failures: AtomicU32,
    opens: AtomicUsize,
    gate: Option<Semaphore>,
    urls: Mutex<Vec<Url>>,
    servers: Mutex<Vec<Option<ServerSide>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            failures: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
            gate: None,
            urls: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
        }
    }
}

impl FakeConnector {
    /// Every `open` blocks until [`FakeConnector::release`].
    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }

    /// The far end of the `index`-th successful open.
    pub(crate) fn take_server(&self, index: usize) -> ServerSide {
        self.servers
            .lock()
            .get_mut(index)
            .and_then(Option::take)
            .expect("no such connection")
    }

    pub(crate) fn server_count(&self) -> usize {
        self.servers.lock().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &Url) -> Result<Link, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?
                .forget();
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        self.servers.lock().push(Some(ServerSide {
            outbound: out_rx,
            events: ev_tx,
        }));
        Ok(Link {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}
