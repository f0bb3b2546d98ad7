//! Scripted collaborators for orchestrator tests.
//!
//! Every fake records what it was asked to do. Slow operations (negotiation,
//! speech, queries) pass through a [`Gate`] so a test can hold them in flight
//! and release them at a moment of its choosing.

use crate::session::collaborators::{
    Collaborators, RecognitionEvent, RecognitionEvents, Recognizer, RecognizerHandle,
    RecognizerService, SynthesisService, TransportEvent, TransportEvents, TransportHandle,
    TransportNegotiator,
};
use crate::session::controller::SessionController;
use crate::session::error::{SessionError, SessionResult};
use crate::session::model::{ChatMessage, ModeFlags, SessionSnapshot};
use crate::session::orchestrator::SessionOrchestrator;
use crate::session::settings::SessionSettings;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Holds callers while closed. Open by default.
pub struct Gate {
    closed: AtomicBool,
    waiting: AtomicUsize,
    permits: Semaphore,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            closed: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            permits: Semaphore::new(0),
        }
    }
}

impl Gate {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Let everyone through, now and later.
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.permits.add_permits(self.waiting.load(Ordering::SeqCst));
    }

    /// Callers currently held.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Let exactly one waiting (or the next) caller through.
    pub fn release_one(&self) {
        self.permits.add_permits(1);
    }

    async fn pass(&self) {
        if self.closed.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeTransport {
    id: usize,
    tracks: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    released: AtomicBool,
}

#[async_trait]
impl TransportHandle for FakeTransport {
    fn describe(&self) -> String {
        format!("fake-transport-{}", self.id)
    }

    fn rendered_tracks(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeNegotiator {
    pub requests: AtomicUsize,
    /// Handles successfully handed out.
    pub issued: AtomicUsize,
    /// Handles handed out and not yet released.
    pub live: Arc<AtomicUsize>,
    /// Track count every handle reports.
    pub tracks: Arc<AtomicUsize>,
    /// Emit `Started` right after a handle is created.
    pub auto_start: AtomicBool,
    /// Fail this many upcoming requests.
    pub failures: AtomicUsize,
    pub gate: Gate,
    events: Mutex<Option<TransportEvents>>,
}

impl Default for FakeNegotiator {
    fn default() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            tracks: Arc::new(AtomicUsize::new(1)),
            auto_start: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
            gate: Gate::default(),
            events: Mutex::new(None),
        }
    }
}

impl FakeNegotiator {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn set_tracks(&self, tracks: usize) {
        self.tracks.store(tracks, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Report an event on the most recently requested handle.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let events = self.events.lock().unwrap().clone();
        events.is_some_and(|events| events.emit(event))
    }
}

#[async_trait]
impl TransportNegotiator for FakeNegotiator {
    async fn request_transport(
        &self,
        _settings: &crate::session::settings::TransportSettings,
        events: TransportEvents,
    ) -> SessionResult<Box<dyn TransportHandle>> {
        let id = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        *self.events.lock().unwrap() = Some(events.clone());
        self.gate.pass().await;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Transport("relay token request failed".to_string()));
        }

        self.issued.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        if self.auto_start.load(Ordering::SeqCst) {
            events.emit(TransportEvent::Started);
        }
        Ok(Box::new(FakeTransport {
            id,
            tracks: self.tracks.clone(),
            live: self.live.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
pub struct FakeRecognizer {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub closed: AtomicBool,
    /// Holds `start` before it confirms.
    pub gate: Gate,
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn start(&self) -> SessionResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        Ok(())
    }

    async fn stop(&self) -> SessionResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeRecognizerService {
    pub recognizer: Arc<FakeRecognizer>,
    pub created: AtomicUsize,
    events: Mutex<Option<RecognitionEvents>>,
}

impl FakeRecognizerService {
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        let events = self.events.lock().unwrap().clone();
        events.is_some_and(|events| events.emit(event))
    }

    pub fn starts(&self) -> usize {
        self.recognizer.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.recognizer.stops.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.recognizer.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognizerService for FakeRecognizerService {
    async fn create_recognizer(
        &self,
        _locales: &[String],
        events: RecognitionEvents,
    ) -> SessionResult<RecognizerHandle> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
        Ok(self.recognizer.clone())
    }
}

#[derive(Default)]
pub struct FakeSynthesis {
    pub spoken: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    /// Fail this many upcoming `speak` calls.
    pub failures: AtomicUsize,
    pub gate: Gate,
}

impl FakeSynthesis {
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisService for FakeSynthesis {
    async fn speak(&self, text: &str) -> SessionResult<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        self.gate.pass().await;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Synthesis("voice not available".to_string()));
        }
        Ok(())
    }

    async fn stop_speaking(&self) -> SessionResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers "Reply to {text}" unless a scripted reply is queued.
#[derive(Default)]
pub struct FakeQuery {
    pub calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    pub scripted: Mutex<VecDeque<SessionResult<String>>>,
    pub gate: Gate,
}

impl FakeQuery {
    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn script(&self, reply: SessionResult<String>) {
        self.scripted.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl crate::session::collaborators::QueryService for FakeQuery {
    async fn submit(&self, user_text: &str, history: &[ChatMessage]) -> SessionResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push((user_text.to_string(), history.to_vec()));
        self.gate.pass().await;
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("Reply to {user_text}")))
    }
}

/// Settings that pass validation, with the microphone grace period off.
pub fn settings() -> SessionSettings {
    let mut settings = SessionSettings::default();
    settings.transport.region = "westus2".to_string();
    settings.transport.api_key = "test-key".to_string();
    settings.transport.avatar_character = "lisa".to_string();
    settings.transport.avatar_style = "casual-sitting".to_string();
    settings.timing.microphone_grace = Duration::ZERO;
    settings
}

pub struct Harness {
    pub controller: SessionController,
    pub transport: Arc<FakeNegotiator>,
    pub recognizers: Arc<FakeRecognizerService>,
    pub synthesis: Arc<FakeSynthesis>,
    pub query: Arc<FakeQuery>,
}

impl Harness {
    /// Spawn an orchestrator over fresh fakes.
    pub fn spawn(modes: ModeFlags) -> Self {
        let transport = Arc::new(FakeNegotiator::default());
        let recognizers = Arc::new(FakeRecognizerService::default());
        let synthesis = Arc::new(FakeSynthesis::default());
        let query = Arc::new(FakeQuery::default());

        let collaborators = Collaborators {
            transport: transport.clone(),
            recognizer: recognizers.clone(),
            synthesis: synthesis.clone(),
            query: query.clone(),
        };
        let (orchestrator, controller) = SessionOrchestrator::new(collaborators, settings(), modes);
        tokio::spawn(orchestrator.run());

        Self {
            controller,
            transport,
            recognizers,
            synthesis,
            query,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.controller.snapshot()
    }

    /// Start with the default test settings and wait until `Active`.
    pub async fn start_active(&self) {
        self.controller.start_session(settings()).await.unwrap();
        let state = crate::session::model::SessionState::Active;
        wait_until(|| self.snapshot().state == state).await;
    }
}

/// Yield to spawned tasks until `condition` holds. Does not advance time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Give spawned tasks a chance to run without waiting on anything in particular.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}
