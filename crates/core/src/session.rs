//! Session lifecycle.
//!
//! All session state lives in a single actor task ([`SessionCore`]) fed by an
//! unbounded command queue. Public calls, transport callbacks and capability
//! completions are all turned into [`Command`]s, so they are handled strictly
//! one at a time in submission order. Completions carry the cycle number they
//! belong to; anything from an earlier cycle is dropped.
//!
//! ```text
//! IDLE --start--> STARTING --connected--> ACTIVE --stop--> STOPPING --> IDLE
//!                    |  \--connect failed / subsystem error--> IDLE
//!                    \--stop--> STOPPING --> IDLE
//! ```

use crate::capabilities::{Capabilities, Completion, behaviors, moods, noop};
use crate::dispatcher::{DispatchQueue, MessageDispatcher};
use crate::error::{SessionError, SubsystemStartError, TransportError};
use crate::intent;
use crate::token::TokenManager;
use crate::transport::{
    ConnectPolicy, ConnectionId, Connector, Endpoint, Link, TransportClient, TransportEvent,
    TransportNotify,
};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn};

const WAKE_MOOD_DURATION: Duration = Duration::from_secs(2);
pub const DEFAULT_FAREWELL: &str = "Okay, thank you for talking today!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        self == SessionState::Active
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Starting => "STARTING",
            SessionState::Active => "ACTIVE",
            SessionState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

/// Observer of the session, typically the UI. Callbacks run on a delivery
/// task owned by the registration, never on the session queue.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, is_active: bool);

    /// A start attempt failed or a live session was lost.
    fn on_failure(&self, _error: &SessionError) {}
}

/// Tunables for the session controller.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: Endpoint,
    pub connect: ConnectPolicy,
    pub farewell: String,
    /// How long to wait for the farewell to finish before tearing down anyway.
    pub farewell_timeout: Duration,
}

impl SessionSettings {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect: ConnectPolicy::default(),
            farewell: DEFAULT_FAREWELL.to_string(),
            farewell_timeout: Duration::from_secs(15),
        }
    }
}

enum Notice {
    State(bool),
    Failure(SessionError),
}

/// The single listener registration.
#[derive(Default)]
struct ListenerSlot {
    delivery: Mutex<Option<mpsc::UnboundedSender<Notice>>>,
}

impl ListenerSlot {
    fn set(&self, runtime: &Handle, listener: Arc<dyn StateListener>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notice>();
        runtime.spawn(async move {
            while let Some(notice) = rx.recv().await {
                let delivered = catch_unwind(AssertUnwindSafe(|| match &notice {
                    Notice::State(active) => listener.on_state_change(*active),
                    Notice::Failure(e) => listener.on_failure(e),
                }));
                if delivered.is_err() {
                    error!("State listener panicked; notification dropped.");
                }
            }
        });
        // Dropping the previous sender lets its delivery task drain and exit.
        *self.delivery.lock() = Some(tx);
    }

    fn clear(&self) {
        self.delivery.lock().take();
    }

    fn send(&self, notice: Notice) {
        if let Some(tx) = self.delivery.lock().as_ref() {
            let _ = tx.send(notice);
        }
    }
}

enum Command {
    Start,
    Stop { reason: String },
    Utterance(String),
    Transport(TransportEvent),
    WakeFinished { cycle: u64 },
    FarewellFinished { cycle: u64 },
    FarewellTimedOut { cycle: u64 },
    Shutdown { done: oneshot::Sender<()> },
}

/// Public handle to the session. Cheap to share behind an `Arc`.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    listener: Arc<ListenerSlot>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Spawns the session actor on the current Tokio runtime.
    pub fn spawn(
        tokens: Arc<TokenManager>,
        connector: Arc<dyn Connector>,
        capabilities: Capabilities,
        settings: SessionSettings,
    ) -> Self {
        let runtime = Handle::current();
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let listener = Arc::new(ListenerSlot::default());

        let dispatch = MessageDispatcher::new(capabilities.clone()).spawn();
        let weak = commands.downgrade();
        let notify: TransportNotify = Arc::new(move |event| {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(Command::Transport(event));
            }
        });
        let transport = TransportClient::new(
            connector,
            settings.endpoint.clone(),
            settings.connect.clone(),
            dispatch.sender(),
            notify,
        );

        let core = SessionCore {
            tokens,
            capabilities,
            transport,
            dispatch,
            farewell_text: settings.farewell,
            farewell_timeout: settings.farewell_timeout,
            state: SessionState::Idle,
            state_tx,
            listener: listener.clone(),
            mailbox: commands.downgrade(),
            enabled: Vec::new(),
            cycle: 0,
            farewell: None,
        };
        let task = runtime.spawn(core.run(mailbox));

        Self {
            commands,
            state: state_rx,
            listener,
            runtime,
            task: Mutex::new(Some(task)),
        }
    }

    /// Requests a new session. Ignored unless IDLE.
    pub fn start(&self) {
        self.submit(Command::Start);
    }

    pub fn stop(&self) {
        self.stop_with("stop requested");
    }

    /// Requests the end of the session. Safe in any state.
    pub fn stop_with(&self, reason: impl Into<String>) {
        self.submit(Command::Stop {
            reason: reason.into(),
        });
    }

    /// Feeds a recognized user utterance into the session.
    pub fn handle_utterance(&self, text: impl Into<String>) {
        self.submit(Command::Utterance(text.into()));
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Receives every state transition, not only active/inactive flips.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Registers the listener, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn StateListener>) {
        self.listener.set(&self.runtime, listener);
    }

    pub fn clear_listener(&self) {
        self.listener.clear();
    }

    /// Tears down any session without a farewell and stops the actor.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Session queue is closed; request ignored.");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subsystem {
    SpeechOutput,
    SpeechInput,
}

impl Subsystem {
    fn name(self) -> &'static str {
        match self {
            Subsystem::SpeechOutput => "speech output",
            Subsystem::SpeechInput => "speech input",
        }
    }
}

struct FarewellWait {
    cycle: u64,
    timer: JoinHandle<()>,
}

/// Owns everything mutable about the session. Lives on the actor task.
struct SessionCore {
    tokens: Arc<TokenManager>,
    capabilities: Capabilities,
    transport: TransportClient,
    dispatch: DispatchQueue,
    farewell_text: String,
    farewell_timeout: Duration,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    listener: Arc<ListenerSlot>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    /// Subsystems enabled in this cycle, in enable order.
    enabled: Vec<Subsystem>,
    cycle: u64,
    farewell: Option<FarewellWait>,
}

impl SessionCore {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        debug!("Session queue running.");
        let mut shutdown_ack = None;
        while let Some(command) = mailbox.recv().await {
            if let Command::Shutdown { done } = command {
                shutdown_ack = Some(done);
                break;
            }
            info_span!("session", cycle = self.cycle).in_scope(|| self.handle(command));
        }

        self.teardown();
        let SessionCore {
            transport,
            dispatch,
            ..
        } = self;
        drop(transport);
        dispatch.close().await;
        info!("Session queue stopped.");
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start => self.on_start(),
            Command::Stop { reason } => self.on_stop(&reason),
            Command::Utterance(text) => self.on_utterance(&text),
            Command::Transport(event) => self.on_transport(event),
            Command::WakeFinished { cycle } => self.on_wake_finished(cycle),
            Command::FarewellFinished { cycle } => self.on_farewell_done(cycle, false),
            Command::FarewellTimedOut { cycle } => self.on_farewell_done(cycle, true),
            Command::Shutdown { .. } => {}
        }
    }

    // --- Start ---

    fn on_start(&mut self) {
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "Start ignored; session is not idle.");
            return;
        }
        self.cycle += 1;
        info!(cycle = self.cycle, "Starting session...");
        self.set_state(SessionState::Starting);

        if let Err(e) = self.begin_start() {
            self.abort_start(e);
        }
    }

    fn begin_start(&mut self) -> Result<(), SessionError> {
        let token = self.tokens.ensure_token()?;
        self.enable(Subsystem::SpeechOutput)?;
        self.enable(Subsystem::SpeechInput)?;
        self.transport.connect(&token)?;
        Ok(())
    }

    fn enable(&mut self, subsystem: Subsystem) -> Result<(), SubsystemStartError> {
        let capabilities = &self.capabilities;
        let started = guarded(subsystem.name(), || match subsystem {
            Subsystem::SpeechOutput => capabilities.speech_output.start(),
            Subsystem::SpeechInput => capabilities.speech_input.start(),
        })?;
        if !started {
            return Err(SubsystemStartError::Unavailable(subsystem.name()));
        }
        debug!(subsystem = subsystem.name(), "Subsystem enabled.");
        self.enabled.push(subsystem);
        Ok(())
    }

    /// Undoes a failed start: nothing enabled during STARTING stays enabled.
    fn abort_start(&mut self, error: SessionError) {
        error!(error = %error, "Session start failed; rolling back.");
        self.transport.cancel_pending();
        self.rollback();
        self.transport.end_session();
        self.set_state(SessionState::Idle);
        self.listener.send(Notice::Failure(error));
    }

    fn on_connected(&mut self, connection: ConnectionId, link: Link, attempts: u32) {
        if self.state != SessionState::Starting || !self.transport.is_pending(connection) {
            debug!(connection, state = %self.state, "Late connection discarded.");
            self.transport.discard(link);
            return;
        }
        info!(connection, attempts, "Connected; waking up.");
        self.dispatch.set_live(true);
        self.transport.attach(connection, link);

        let capabilities = &self.capabilities;
        let on_woken = self.post_later(Command::WakeFinished { cycle: self.cycle });
        let woke = guarded("behavior animator", || {
            capabilities.speech_input.pause();
            capabilities.animator.play(behaviors::WAKE, on_woken);
        });
        match woke {
            Ok(()) => self.set_state(SessionState::Active),
            Err(e) => self.abort_start(e.into()),
        }
    }

    fn on_wake_finished(&mut self, cycle: u64) {
        if cycle != self.cycle || self.state != SessionState::Active {
            debug!(cycle, "Stale wake completion ignored.");
            return;
        }
        let capabilities = &self.capabilities;
        let listening = guarded("speech input", || {
            capabilities
                .mood
                .set_mood(moods::HAPPY, Some(WAKE_MOOD_DURATION));
            capabilities.speech_input.start()
        });
        match listening {
            Ok(true) => info!("Session active; listening."),
            Ok(false) => warn!("Speech input did not resume after wake."),
            Err(_) => {}
        }
    }

    // --- Stop ---

    fn on_stop(&mut self, reason: &str) {
        match self.state {
            SessionState::Idle => {
                debug!(reason, "Stop while idle.");
                self.transport.end_session();
            }
            SessionState::Stopping => debug!(reason, "Stop already in progress."),
            SessionState::Starting | SessionState::Active => {
                let was_active = self.state.is_active();
                info!(reason, was_active, "Stopping session...");
                self.transport.cancel_pending();
                self.set_state(SessionState::Stopping);
                if was_active {
                    self.begin_farewell();
                } else {
                    self.finish_stop(false);
                }
            }
        }
    }

    fn begin_farewell(&mut self) {
        let cycle = self.cycle;
        let on_spoken = self.post_later(Command::FarewellFinished { cycle });
        let capabilities = &self.capabilities;
        let text = &self.farewell_text;
        let spoke = guarded("speech output", || {
            capabilities.speech_input.pause();
            capabilities.speech_output.speak(text, on_spoken);
        });
        if spoke.is_err() {
            self.finish_stop(true);
            return;
        }

        let timeout = self.farewell_timeout;
        let mailbox = self.mailbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(commands) = mailbox.upgrade() {
                let _ = commands.send(Command::FarewellTimedOut { cycle });
            }
        });
        self.farewell = Some(FarewellWait { cycle, timer });
    }

    fn on_farewell_done(&mut self, cycle: u64, timed_out: bool) {
        let waiting = self.farewell.as_ref().is_some_and(|w| w.cycle == cycle);
        if !waiting || self.state != SessionState::Stopping {
            debug!(cycle, "Stale farewell completion ignored.");
            return;
        }
        if timed_out {
            warn!("Farewell did not finish in time; continuing shutdown.");
        }
        self.finish_stop(true);
    }

    fn finish_stop(&mut self, farewell: bool) {
        if let Some(wait) = self.farewell.take() {
            wait.timer.abort();
        }
        let capabilities = &self.capabilities;
        if farewell {
            let _ = guarded("mood setter", || capabilities.mood.set_mood(moods::TIRED, None));
        }
        self.rollback();
        self.transport.end_session();
        if farewell {
            let capabilities = &self.capabilities;
            let _ = guarded("behavior animator", || {
                capabilities.animator.play(behaviors::SLEEP, noop())
            });
        }
        self.set_state(SessionState::Idle);
        info!("Session stopped.");
    }

    /// Disables enabled subsystems in reverse order.
    fn rollback(&mut self) {
        let capabilities = &self.capabilities;
        for subsystem in self.enabled.drain(..).rev() {
            debug!(subsystem = subsystem.name(), "Disabling subsystem.");
            let _ = guarded(subsystem.name(), || match subsystem {
                Subsystem::SpeechOutput => capabilities.speech_output.stop(),
                Subsystem::SpeechInput => capabilities.speech_input.stop(),
            });
        }
    }

    /// Shutdown path: no farewell, no sleep behavior.
    fn teardown(&mut self) {
        if self.state == SessionState::Idle {
            self.transport.end_session();
            return;
        }
        info!(state = %self.state, "Shutting down live session.");
        if let Some(wait) = self.farewell.take() {
            wait.timer.abort();
        }
        self.transport.cancel_pending();
        self.rollback();
        self.transport.end_session();
        self.set_state(SessionState::Idle);
    }

    // --- Steady state ---

    fn on_utterance(&mut self, text: &str) {
        if self.state != SessionState::Active {
            debug!(state = %self.state, "Utterance ignored; session not active.");
            return;
        }
        let capabilities = &self.capabilities;
        let _ = guarded("mood setter", || capabilities.mood.set_mood(moods::THINKING, None));
        if let Err(e) = self.transport.send(text) {
            warn!(error = %e, "Transcription not delivered.");
        }
        if intent::is_end_chat(text) {
            self.on_stop("user asked to end the chat");
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                connection,
                link,
                attempts,
            } => self.on_connected(connection, link, attempts),
            TransportEvent::ConnectFailed { connection, error } => {
                if self.state == SessionState::Starting && self.transport.is_pending(connection) {
                    self.abort_start(error.into());
                } else {
                    debug!(connection, "Stale connect failure ignored.");
                }
            }
            TransportEvent::Closed {
                connection,
                code,
                reason,
            } => {
                if self.transport.on_closed(connection) {
                    info!(connection, code, %reason, "Server closed the connection.");
                    self.on_connection_lost(format!("server closed connection ({code})"), None);
                }
            }
            TransportEvent::Failed { connection, error } => {
                if self.transport.on_closed(connection) {
                    error!(connection, error = %error, "Connection failed.");
                    self.on_connection_lost(error.to_string(), Some(error));
                }
            }
        }
    }

    fn on_connection_lost(&mut self, reason: String, error: Option<TransportError>) {
        if self.state.is_active() {
            self.on_stop(&reason);
        }
        if let Some(error) = error {
            self.listener.send(Notice::Failure(error.into()));
        }
    }

    // --- Helpers ---

    fn set_state(&mut self, next: SessionState) {
        let previous = self.state;
        if previous == next {
            return;
        }
        self.state = next;
        debug!(from = %previous, to = %next, "Session state changed.");
        if next != SessionState::Active {
            self.dispatch.set_live(false);
        }
        self.state_tx.send_replace(next);
        if previous.is_active() != next.is_active() {
            self.listener.send(Notice::State(next.is_active()));
        }
    }

    /// A completion that posts `command` back onto the session queue.
    fn post_later(&self, command: Command) -> Completion {
        let mailbox = self.mailbox.clone();
        Box::new(move || {
            if let Some(commands) = mailbox.upgrade() {
                let _ = commands.send(command);
            }
        })
    }
}

/// Runs a collaborator call, converting a panic into an error.
fn guarded<T>(
    subsystem: &'static str,
    call: impl FnOnce() -> T,
) -> Result<T, SubsystemStartError> {
    catch_unwind(AssertUnwindSafe(call)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(subsystem, "Collaborator panicked: {}", message);
        SubsystemStartError::Panicked { subsystem, message }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::testing::{Call, FakeConnector, Recorder};
    use crate::token::MockAuthenticator;
    use crate::transport::{NORMAL_CLOSURE, Outbound};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Active(bool),
        Failure(SessionError),
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<Seen>>,
    }

    impl StateListener for RecordingListener {
        fn on_state_change(&self, is_active: bool) {
            self.seen.lock().push(Seen::Active(is_active));
        }

        fn on_failure(&self, error: &SessionError) {
            self.seen.lock().push(Seen::Failure(error.clone()));
        }
    }

    struct Harness {
        controller: SessionController,
        recorder: Recorder,
        connector: Arc<FakeConnector>,
        listener: Arc<RecordingListener>,
        tokens: Arc<TokenManager>,
    }

    impl Harness {
        fn new(connector: FakeConnector) -> Self {
            let tokens = TokenManager::with_token(Arc::new(MockAuthenticator::new()), "tok-123");
            Self::with_tokens(connector, tokens)
        }

        fn with_tokens(connector: FakeConnector, tokens: Arc<TokenManager>) -> Self {
            let recorder = Recorder::default();
            let connector = Arc::new(connector);
            let endpoint = Endpoint::new("https://cognibot.org", "buddyrobot").unwrap();
            let controller = SessionController::spawn(
                tokens.clone(),
                connector.clone(),
                recorder.capabilities(),
                SessionSettings::new(endpoint),
            );
            let listener = Arc::new(RecordingListener::default());
            controller.set_listener(listener.clone());
            Self {
                controller,
                recorder,
                connector,
                listener,
                tokens,
            }
        }

        fn seen(&self) -> Vec<Seen> {
            self.listener.seen.lock().clone()
        }

        fn plays(&self, name: &str) -> usize {
            self.recorder
                .calls()
                .iter()
                .filter(|c| **c == Call::Play(name.to_string()))
                .count()
        }

        async fn activate(&self) {
            self.controller.start();
            settle().await;
            assert_eq!(self.controller.state(), SessionState::Active);
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_reaches_active_and_wakes_once() {
        let h = Harness::new(FakeConnector::default());
        let mut states = h.controller.subscribe();
        h.activate().await;

        assert!(h.controller.is_active());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Active);
        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::OutputStart,
                Call::InputStart,
                Call::InputPause,
                Call::Play("wake".into()),
                Call::SetMood("HAPPY".into(), Some(2_000)),
                Call::InputStart,
            ]
        );
        assert_eq!(h.seen(), vec![Seen::Active(true)]);

        let urls = h.connector.urls();
        assert_eq!(urls.len(), 1);
        assert_eq!(
            urls[0].as_str(),
            "wss://cognibot.org/ws/chat/?token=tok-123&source=buddyrobot"
        );
    }

    #[tokio::test]
    async fn test_start_is_ignored_while_starting_or_active() {
        let h = Harness::new(FakeConnector::gated());
        h.controller.start();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Starting);
        assert!(!h.controller.is_active());

        h.controller.start();
        settle().await;
        assert_eq!(h.connector.open_count(), 1);

        h.connector.release();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Active);

        h.controller.start();
        settle().await;
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.connector.server_count(), 1);
        assert_eq!(h.plays("wake"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhaustion_rolls_back_to_idle() {
        let h = Harness::new(FakeConnector::default());
        h.connector.fail_next(3);
        h.controller.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.connector.open_count(), 3);
        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::OutputStart,
                Call::InputStart,
                Call::InputStop,
                Call::OutputStop,
            ]
        );
        assert_eq!(
            h.seen(),
            vec![Seen::Failure(SessionError::Transport(
                TransportError::ConnectExhausted {
                    attempts: 3,
                    last: "connection attempt failed: connection refused".to_string(),
                }
            ))]
        );

        // A fresh start is possible after the failure.
        h.controller.start();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_unavailable_subsystem_rolls_back_enabled_siblings() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.input_unavailable();
        h.controller.start();
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.connector.open_count(), 0);
        assert_eq!(
            h.recorder.calls(),
            vec![Call::OutputStart, Call::InputStart, Call::OutputStop]
        );
        assert_eq!(
            h.seen(),
            vec![Seen::Failure(SubsystemStartError::Unavailable("speech input").into())]
        );
    }

    #[tokio::test]
    async fn test_unavailable_first_subsystem_enables_nothing() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.output_unavailable();
        h.controller.start();
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.recorder.calls(), vec![Call::OutputStart]);
        assert_eq!(
            h.seen(),
            vec![Seen::Failure(SubsystemStartError::Unavailable("speech output").into())]
        );
    }

    #[tokio::test]
    async fn test_panicking_subsystem_is_contained() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.input_panics();
        h.controller.start();
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.connector.open_count(), 0);
        assert_eq!(
            h.recorder.calls(),
            vec![Call::OutputStart, Call::InputStart, Call::OutputStop]
        );
        assert!(matches!(
            h.seen().as_slice(),
            [Seen::Failure(SessionError::Subsystem(SubsystemStartError::Panicked {
                subsystem: "speech input",
                ..
            }))]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_means_no_connect() {
        let mut mock = MockAuthenticator::new();
        mock.expect_authenticate()
            .times(3)
            .returning(|| Err(AuthError::Request("timeout".to_string())));
        let tokens = TokenManager::new(Arc::new(mock), Default::default());
        let ready = Arc::new(Mutex::new(false));
        let flag = ready.clone();
        assert!(tokens.initial_login(move |_| *flag.lock() = true).await.is_err());
        assert!(!*ready.lock());

        let h = Harness::with_tokens(FakeConnector::default(), tokens);
        h.controller.start();
        settle().await;

        assert_eq!(h.connector.open_count(), 0);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.seen(), vec![Seen::Failure(AuthError::MissingToken.into())]);
    }

    #[tokio::test]
    async fn test_stop_during_starting_discards_late_connect() {
        let h = Harness::new(FakeConnector::gated());
        h.controller.start();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Starting);

        h.controller.stop();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Idle);

        // The attempt that was pending when stop ran reports success anyway.
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let (_events_tx, events) = mpsc::unbounded_channel();
        let late = Command::Transport(TransportEvent::Connected {
            connection: 1,
            link: Link { outbound, events },
            attempts: 1,
        });
        assert!(h.controller.commands.send(late).is_ok());
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.plays("wake"), 0);
        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::OutputStart,
                Call::InputStart,
                Call::InputStop,
                Call::OutputStop,
            ]
        );
        assert!(h.seen().is_empty());
        assert_eq!(
            sent.try_recv(),
            Ok(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "user ended".to_string()
            })
        );
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_speaks_farewell_before_teardown() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.hold_completions();
        h.controller.start();
        settle().await;
        assert_eq!(h.recorder.finish("wake"), 1);
        settle().await;
        let mut server = h.connector.take_server(0);
        h.recorder.clear();

        h.controller.stop();
        h.controller.stop();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Stopping);
        assert!(!h.controller.is_active());
        assert_eq!(
            h.recorder.calls(),
            vec![Call::InputPause, Call::Speak(DEFAULT_FAREWELL.into())]
        );
        assert!(server.drain().is_empty());

        assert_eq!(h.recorder.finish("speak"), 1);
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::InputPause,
                Call::Speak(DEFAULT_FAREWELL.into()),
                Call::SetMood("TIRED".into(), None),
                Call::InputStop,
                Call::OutputStop,
                Call::Play("sleep".into()),
            ]
        );

        let sent = server.drain();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Outbound::Text(text) if text.contains("\"end_chat\"")));
        assert_eq!(
            sent[1],
            Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "user ended".to_string()
            }
        );
        assert_eq!(h.seen(), vec![Seen::Active(true), Seen::Active(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_farewell_timeout_completes_stop() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.hold_completions();
        h.controller.start();
        settle().await;
        h.recorder.finish("wake");
        settle().await;

        h.controller.stop();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Stopping);

        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.plays("sleep"), 1);

        // A farewell completion arriving after the timeout changes nothing.
        h.recorder.finish("speak");
        settle().await;
        assert_eq!(h.plays("sleep"), 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_a_no_op() {
        let h = Harness::new(FakeConnector::default());
        h.controller.stop();
        h.controller.stop();
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.recorder.calls().is_empty());
        assert!(h.seen().is_empty());
    }

    #[tokio::test]
    async fn test_server_close_runs_normal_stop() {
        let h = Harness::new(FakeConnector::default());
        h.activate().await;
        let mut server = h.connector.take_server(0);

        server.close(1001, "going away");
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.plays("sleep"), 1);
        assert!(
            h.recorder
                .calls()
                .contains(&Call::Speak(DEFAULT_FAREWELL.into()))
        );
        // The connection is already gone, so nothing more is written.
        assert!(server.drain().is_empty());
        assert_eq!(h.seen(), vec![Seen::Active(true), Seen::Active(false)]);
    }

    #[tokio::test]
    async fn test_network_failure_surfaces_transport_error() {
        let h = Harness::new(FakeConnector::default());
        h.activate().await;
        let server = h.connector.take_server(0);

        server.fail("connection reset by peer");
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(
            h.seen(),
            vec![
                Seen::Active(true),
                Seen::Active(false),
                Seen::Failure(
                    TransportError::ConnectionLost("connection reset by peer".to_string()).into()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_capabilities() {
        let h = Harness::new(FakeConnector::default());
        h.activate().await;
        let server = h.connector.take_server(0);
        h.recorder.clear();

        server.push(r#"{"type":"affect","valence":0.9,"arousal":0.1}"#);
        server.push("{not json");
        server.push(r#"{"type":"llm_response","data":"Hello there"}"#);
        settle().await;

        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::SetMood("NEUTRAL".into(), None),
                Call::PositivityEnergy(0.9, 0.1),
                Call::Speak("Hello there".into()),
            ]
        );
        assert!(h.controller.is_active());
    }

    #[tokio::test]
    async fn test_replies_arriving_during_stop_are_dropped() {
        let h = Harness::new(FakeConnector::default());
        h.recorder.hold_completions();
        h.controller.start();
        settle().await;
        h.recorder.finish("wake");
        settle().await;
        let server = h.connector.take_server(0);

        server.push(r#"{"type":"llm_response","data":"in time"}"#);
        settle().await;
        h.controller.stop();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Stopping);

        server.push(r#"{"type":"llm_response","data":"too late"}"#);
        server.push(r#"{"type":"expression","expression":"SURPRISED"}"#);
        settle().await;
        h.recorder.finish("speak");
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        let calls = h.recorder.calls();
        assert!(calls.contains(&Call::Speak("in time".into())));
        assert!(!calls.contains(&Call::Speak("too late".into())));
        assert!(
            !calls
                .iter()
                .any(|c| matches!(c, Call::SetMood(name, _) if name == "SURPRISED"))
        );
        assert_eq!(calls.last(), Some(&Call::Play("sleep".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_times_out_and_rolls_back() {
        let h = Harness::new(FakeConnector::gated());
        h.controller.start();
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Starting);

        // Three attempts of 10s each, with 3s between them.
        tokio::time::sleep(Duration::from_secs(40)).await;
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.connector.open_count(), 3);
        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::OutputStart,
                Call::InputStart,
                Call::InputStop,
                Call::OutputStop,
            ]
        );
        assert!(matches!(
            h.seen().as_slice(),
            [Seen::Failure(SessionError::Transport(TransportError::ConnectExhausted {
                attempts: 3,
                ..
            }))]
        ));
    }

    #[tokio::test]
    async fn test_utterances_are_forwarded_and_end_intent_stops() {
        let h = Harness::new(FakeConnector::default());
        h.activate().await;
        let mut server = h.connector.take_server(0);
        h.recorder.clear();

        h.controller.handle_utterance("what is the weather like");
        settle().await;
        assert_eq!(
            server.drain(),
            vec![Outbound::Text(
                r#"{"type":"transcription","data":"what is the weather like"}"#.to_string()
            )]
        );
        assert_eq!(
            h.recorder.calls(),
            vec![Call::SetMood("THINKING".into(), None)]
        );

        h.controller.handle_utterance("okay, goodbye buddy");
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        let sent = server.drain();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Outbound::Text(text) if text.contains("goodbye buddy")));
        assert!(matches!(&sent[1], Outbound::Text(text) if text.contains("\"end_chat\"")));
        assert_eq!(h.plays("sleep"), 1);
    }

    #[tokio::test]
    async fn test_utterance_while_idle_is_ignored() {
        let h = Harness::new(FakeConnector::default());
        h.controller.handle_utterance("hello");
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_leaves_session_untouched() {
        let mut mock = MockAuthenticator::new();
        mock.expect_authenticate()
            .returning(|| Err(AuthError::Request("offline".to_string())));
        let tokens = TokenManager::with_token(Arc::new(mock), "tok-123");
        let h = Harness::with_tokens(FakeConnector::default(), tokens);
        h.activate().await;

        assert!(h.tokens.login(3, false, None).await.is_err());
        settle().await;

        assert!(h.controller.is_active());
        assert_eq!(h.tokens.ensure_token().unwrap().expose(), "tok-123");
        assert_eq!(h.seen(), vec![Seen::Active(true)]);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_without_farewell() {
        let h = Harness::new(FakeConnector::default());
        h.activate().await;
        let mut server = h.connector.take_server(0);
        h.recorder.clear();

        h.controller.shutdown().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(
            h.recorder.calls(),
            vec![Call::InputStop, Call::OutputStop]
        );
        let sent = server.drain();
        assert!(matches!(&sent[0], Outbound::Text(text) if text.contains("\"end_chat\"")));

        // Requests after shutdown are ignored.
        h.controller.start();
        settle().await;
        assert_eq!(h.connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_cleared_listener_hears_nothing() {
        let h = Harness::new(FakeConnector::default());
        h.controller.clear_listener();
        h.activate().await;
        settle().await;
        assert!(h.seen().is_empty());
    }
}
