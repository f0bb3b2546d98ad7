//! # Session Orchestrator
//!
//! The session state machine. One tokio task owns the session, the utterance
//! queue, the input pipeline, the health monitor and the reconnect supervisor,
//! and applies every mutation in order.
//!
//! ## Inputs:
//! - commands from [`SessionController`]s (bounded channel)
//! - collaborator events and completions of spawned collaborator calls
//!   (unbounded internal channel)
//! - health monitor ticks
//!
//! ## Guards:
//! - completions carry the session `epoch`; stopping bumps it, so nothing that
//!   was in flight can touch the next session or resurrect a closed one
//! - transport events carry the handle `generation` and are dropped once that
//!   handle has been released or replaced
//! - speech completions carry a `ticket`; only the ticket of the utterance that
//!   is currently speaking advances the queue
//! - query replies carry their turn number; turns at or below the reply cutoff
//!   (moved by every interrupt) are discarded

use crate::session::collaborators::{
    Collaborators, RecognitionEvent, RecognitionEvents, RecognizerHandle, TransportEvent,
    TransportEvents, TransportHandle,
};
use crate::session::controller::SessionController;
use crate::session::error::{SessionError, SessionResult};
use crate::session::input::{ConversationMode, FinalOutcome, SpeechInputPipeline};
use crate::session::model::{
    ChatMessage, HealthSnapshot, ModeFlags, ModeUpdate, ReconnectReason, Session, SessionNotice,
    SessionSnapshot, SessionState, Utterance, UtteranceStatus,
};
use crate::session::monitor::{self, HealthMonitor, HealthSignal, MonitorContext};
use crate::session::queue::UtteranceQueue;
use crate::session::reconnect::{self, FailureOutcome, ReconnectSupervisor};
use crate::session::settings::SessionSettings;
use std::future::Future;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 32;
const NOTICE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<T>;

/// Requests from a [`SessionController`].
pub enum SessionCommand {
    Start {
        settings: Box<SessionSettings>,
        reply: Reply<SessionResult<Uuid>>,
    },
    Stop {
        reply: Reply<()>,
    },
    Interrupt {
        reply: Reply<Option<Utterance>>,
    },
    SubmitText {
        text: String,
        reply: Reply<SessionResult<()>>,
    },
    StartMicrophone {
        reply: Reply<SessionResult<()>>,
    },
    StopMicrophone {
        reply: Reply<SessionResult<()>>,
    },
    UpdateModes {
        update: ModeUpdate,
        reply: Reply<ModeFlags>,
    },
    ClearHistory {
        reply: Reply<()>,
    },
}

/// Everything that re-enters the orchestrator from other tasks.
pub enum SessionInput {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Recognition {
        epoch: u64,
        event: RecognitionEvent,
    },
    Completion {
        epoch: u64,
        completion: Completion,
    },
}

/// Result of a spawned collaborator call.
pub enum Completion {
    TransportReady {
        generation: u64,
        result: SessionResult<Box<dyn TransportHandle>>,
    },
    RecognizerReady {
        result: SessionResult<RecognizerHandle>,
    },
    MicrophoneStarted {
        result: SessionResult<()>,
        reply: Option<Reply<SessionResult<()>>>,
    },
    MicrophoneStopped {
        result: SessionResult<()>,
        reply: Option<Reply<SessionResult<()>>>,
    },
    QueryFinished {
        turn: u64,
        user_text: String,
        result: SessionResult<String>,
    },
    SpeechFinished {
        ticket: u64,
        sequence: u64,
        result: SessionResult<()>,
    },
    /// The post-reconnect microphone grace period is over.
    GraceElapsed,
}

pub struct SessionOrchestrator {
    collaborators: Collaborators,
    settings: SessionSettings,
    session: Session,
    epoch: u64,

    transport: Option<Box<dyn TransportHandle>>,
    transport_generation: u64,
    connecting_generation: Option<u64>,
    /// The current transport reported rendered media.
    media_started: bool,
    avatar_speaking: bool,
    last_speak_at: Option<Instant>,

    input: SpeechInputPipeline,
    recognizer_pending: bool,

    queue: UtteranceQueue,
    speak_ticket: Option<u64>,
    ticket_counter: u64,

    history: Vec<ChatMessage>,
    last_turn: u64,
    reply_cutoff: u64,

    monitor: HealthMonitor,
    supervisor: ReconnectSupervisor,

    commands: mpsc::Receiver<SessionCommand>,
    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    snapshots: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionOrchestrator {
    /// Build an idle orchestrator and the controller that drives it.
    ///
    /// `settings` are used until the first `start_session` replaces them.
    pub fn new(
        collaborators: Collaborators,
        settings: SessionSettings,
        modes: ModeFlags,
    ) -> (Self, SessionController) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let session = Session::new(modes);
        let (snapshots, snapshot_rx) = watch::channel(SessionSnapshot::idle(&session));
        let monitor = HealthMonitor::new(settings.timing.health_poll_interval);
        let supervisor = ReconnectSupervisor::new(settings.reconnect.clone());

        let orchestrator = Self {
            collaborators,
            settings,
            session,
            epoch: 0,
            transport: None,
            transport_generation: 0,
            connecting_generation: None,
            media_started: false,
            avatar_speaking: false,
            last_speak_at: None,
            input: SpeechInputPipeline::new(),
            recognizer_pending: false,
            queue: UtteranceQueue::new(),
            speak_ticket: None,
            ticket_counter: 0,
            history: Vec::new(),
            last_turn: 0,
            reply_cutoff: 0,
            monitor,
            supervisor,
            commands,
            inputs_tx,
            inputs,
            snapshots,
            notices: notices.clone(),
        };

        let controller = SessionController::new(commands_tx, snapshot_rx, notices);
        (orchestrator, controller)
    }

    /// Run until every controller has been dropped.
    pub async fn run(mut self) {
        info!(session_id = %self.session.id, "Session orchestrator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(input) = self.inputs.recv() => self.handle_input(input).await,
                _ = self.monitor.tick() => self.on_health_tick(),
            }
            self.publish();
        }

        if self.session.state() != SessionState::Closed {
            self.session.user_closed = true;
            self.shutdown("orchestrator shut down", true).await;
        }
        info!("Session orchestrator stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { settings, reply } => {
                let result = self.start_session(*settings);
                self.reply(reply, result);
            }
            SessionCommand::Stop { reply } => {
                self.stop_session().await;
                self.reply(reply, ());
            }
            SessionCommand::Interrupt { reply } => {
                let aborted = self.interrupt_speech();
                self.reply(reply, aborted);
            }
            SessionCommand::SubmitText { text, reply } => {
                let result = self.submit_typed_message(&text);
                self.reply(reply, result);
            }
            SessionCommand::StartMicrophone { reply } => self.start_microphone(reply),
            SessionCommand::StopMicrophone { reply } => self.stop_microphone(reply),
            SessionCommand::UpdateModes { update, reply } => {
                let modes = update.apply(self.session.modes);
                self.set_mode(modes).await;
                self.reply(reply, modes);
            }
            SessionCommand::ClearHistory { reply } => {
                debug!(session_id = %self.session.id, turns = self.history.len() / 2, "Clearing chat history");
                self.history.clear();
                self.reply(reply, ());
            }
        }
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Transport { generation, event } => {
                self.on_transport_event(generation, event).await
            }
            SessionInput::Recognition { epoch, event } => {
                if epoch != self.epoch {
                    debug!(epoch, "Ignoring recognition event from a closed session");
                    return;
                }
                self.on_recognition_event(event);
            }
            SessionInput::Completion { epoch, completion } => {
                if epoch != self.epoch {
                    self.discard(completion);
                    return;
                }
                self.on_completion(completion).await;
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::TransportReady { generation, result } => {
                self.on_transport_ready(generation, result).await
            }
            Completion::RecognizerReady { result } => self.on_recognizer_ready(result),
            Completion::MicrophoneStarted { result, reply } => {
                let stop = self.input.finish_start(&result);
                match &result {
                    Ok(()) => info!(session_id = %self.session.id, "Microphone listening"),
                    Err(err) => {
                        warn!(session_id = %self.session.id, error = %err, "Failed to start recognition");
                        self.notify(SessionNotice::RecognitionFailed {
                            message: err.to_string(),
                        });
                    }
                }
                if let Some(recognizer) = stop {
                    debug!(session_id = %self.session.id, "Turn already finished, stopping recognition");
                    self.stop_recognition(recognizer, None);
                }
                self.notify_microphone();
                self.respond(reply, result);
            }
            Completion::MicrophoneStopped { result, reply } => {
                self.input.finish_stop(&result);
                if let Err(err) = &result {
                    warn!(session_id = %self.session.id, error = %err, "Failed to stop recognition");
                    self.notify(SessionNotice::RecognitionFailed {
                        message: err.to_string(),
                    });
                }
                self.notify_microphone();
                self.respond(reply, result);
            }
            Completion::QueryFinished {
                turn,
                user_text,
                result,
            } => self.on_query_finished(turn, user_text, result),
            Completion::SpeechFinished {
                ticket,
                sequence,
                result,
            } => self.on_speech_finished(ticket, sequence, result),
            Completion::GraceElapsed => {
                if self.session.state() == SessionState::Active && self.input.take_deferred_start() {
                    debug!(session_id = %self.session.id, "Grace period over, starting microphone");
                    self.begin_microphone(None);
                }
            }
        }
    }

    /// Release whatever a completion from a closed session still carries.
    fn discard(&self, completion: Completion) {
        match completion {
            Completion::TransportReady {
                generation,
                result: Ok(handle),
            } => {
                debug!(generation, handle = %handle.describe(), "Releasing transport of a closed session");
                tokio::spawn(async move { handle.release().await });
            }
            Completion::RecognizerReady {
                result: Ok(recognizer),
            } => {
                debug!("Closing recognizer of a closed session");
                tokio::spawn(async move { recognizer.close().await });
            }
            Completion::MicrophoneStarted {
                reply: Some(reply), ..
            }
            | Completion::MicrophoneStopped {
                reply: Some(reply), ..
            } => {
                let err = SessionError::invalid_state("use the microphone", self.session.state());
                self.reply(reply, Err(err));
            }
            _ => {}
        }
    }

    // ---- lifecycle -------------------------------------------------------

    fn start_session(&mut self, settings: SessionSettings) -> SessionResult<Uuid> {
        let state = self.session.state();
        if !state.can_start() {
            return Err(SessionError::invalid_state("start a session", state));
        }
        settings.validate()?;

        if state == SessionState::Closed {
            self.session = Session::new(self.session.modes);
        }
        self.monitor.set_period(settings.timing.health_poll_interval);
        self.supervisor.set_policy(settings.reconnect.clone());
        self.supervisor.reset();
        self.settings = settings;

        info!(session_id = %self.session.id, region = %self.settings.transport.region, "Starting session");
        self.transition(SessionState::Connecting);
        self.request_transport(None);
        self.ensure_recognizer();
        Ok(self.session.id)
    }

    async fn stop_session(&mut self) {
        if self.session.state() == SessionState::Closed {
            debug!(session_id = %self.session.id, "Session already closed");
            return;
        }
        self.session.user_closed = true;
        self.shutdown("stopped by user", true).await;
    }

    /// Tear everything down and end in `Closed`.
    ///
    /// Releases are awaited here, on the loop, so the session is fully closed
    /// before the next input is looked at.
    async fn shutdown(&mut self, reason: &str, user_initiated: bool) {
        info!(session_id = %self.session.id, reason, user_initiated, "Closing session");
        self.transition(SessionState::Closing);
        self.epoch += 1;

        self.monitor.stop();
        self.supervisor.reset();
        self.connecting_generation = None;
        self.media_started = false;
        self.recognizer_pending = false;

        let outcome = self.queue.interrupt();
        self.speak_ticket = None;
        if outcome.aborted.is_some() || self.avatar_speaking {
            if let Err(err) = self.collaborators.synthesis.stop_speaking().await {
                warn!(error = %err, "Failed to stop speaking during shutdown");
            }
        }
        self.queue.clear();
        self.avatar_speaking = false;

        if let Some((recognizer, listening)) = self.input.detach() {
            if listening {
                if let Err(err) = recognizer.stop().await {
                    warn!(error = %err, "Failed to stop recognition during shutdown");
                }
            }
            recognizer.close().await;
        }
        self.input.reset();

        if let Some(handle) = self.transport.take() {
            debug!(handle = %handle.describe(), "Releasing transport");
            handle.release().await;
        }

        self.history.clear();
        self.last_speak_at = None;
        self.reply_cutoff = self.last_turn;

        self.transition(SessionState::Closed);
        self.notify(SessionNotice::Closed {
            reason: reason.to_string(),
            user_initiated,
        });
    }

    async fn set_mode(&mut self, modes: ModeFlags) {
        let previous = std::mem::replace(&mut self.session.modes, modes);
        info!(session_id = %self.session.id, ?modes, "Mode flags updated");

        // Retries only come from hung ticks, which need auto-reconnect.
        let stranded = previous.auto_reconnect
            && !modes.auto_reconnect
            && self.session.state() == SessionState::Reconnecting
            && self.transport.is_none()
            && !self.supervisor.in_progress();
        if stranded {
            self.shutdown("automatic reconnect disabled", false).await;
        }
    }

    fn transition(&mut self, next: SessionState) {
        let from = self.session.transition(next);
        if !next.is_monitored() {
            self.monitor.stop();
        }
        if from != next {
            debug!(session_id = %self.session.id, %from, to = %next, "Session state changed");
            self.notify(SessionNotice::StateChanged { from, to: next });
        }
    }

    // ---- transport -------------------------------------------------------

    fn request_transport(&mut self, previous: Option<Box<dyn TransportHandle>>) {
        self.transport_generation += 1;
        let generation = self.transport_generation;
        self.connecting_generation = Some(generation);
        self.media_started = false;

        let negotiator = self.collaborators.transport.clone();
        let settings = self.settings.transport.clone();
        let events = TransportEvents::new(generation, self.inputs_tx.clone());
        debug!(session_id = %self.session.id, generation, "Requesting transport");
        self.spawn_completion(async move {
            let result = reconnect::replace_transport(previous, negotiator, settings, events).await;
            Completion::TransportReady { generation, result }
        });
    }

    async fn on_transport_ready(
        &mut self,
        generation: u64,
        result: SessionResult<Box<dyn TransportHandle>>,
    ) {
        if self.connecting_generation != Some(generation) {
            if let Ok(handle) = result {
                debug!(generation, "Releasing superseded transport");
                tokio::spawn(async move { handle.release().await });
            }
            return;
        }
        self.connecting_generation = None;

        match (self.session.state(), result) {
            (SessionState::Connecting, Ok(handle)) => {
                info!(session_id = %self.session.id, generation, handle = %handle.describe(), "Transport established");
                self.transport = Some(handle);
                if self.media_started {
                    self.become_active(false);
                }
            }
            (SessionState::Connecting, Err(err)) => {
                error!(session_id = %self.session.id, error = %err, "Transport negotiation failed");
                self.shutdown(&err.to_string(), false).await;
            }
            (SessionState::Reconnecting, Ok(handle)) => {
                info!(session_id = %self.session.id, generation, handle = %handle.describe(), "Transport re-established");
                self.transport = Some(handle);
                self.supervisor.finish_success();
                self.notify(SessionNotice::Reconnected);
                self.become_active(true);
            }
            (SessionState::Reconnecting, Err(err)) => self.on_reconnect_failed(err).await,
            (state, Ok(handle)) => {
                debug!(%state, "Releasing transport that is no longer wanted");
                tokio::spawn(async move { handle.release().await });
            }
            (_, Err(_)) => {}
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let current = generation == self.transport_generation
            && (self.transport.is_some() || self.connecting_generation == Some(generation));
        if !current {
            debug!(generation, ?event, "Ignoring event from a released transport");
            return;
        }

        match event {
            TransportEvent::Started => {
                self.media_started = true;
                if self.session.state() == SessionState::Connecting && self.transport.is_some() {
                    self.become_active(false);
                }
            }
            TransportEvent::TurnStart => {
                self.avatar_speaking = true;
                self.last_speak_at = Some(Instant::now());
            }
            TransportEvent::TurnEnd => {
                self.avatar_speaking = false;
                self.last_speak_at = Some(Instant::now());
            }
            TransportEvent::Ended { reason } => self.on_transport_ended(reason).await,
        }
    }

    async fn on_transport_ended(&mut self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "transport ended".to_string());
        if self.transport.is_none() {
            // Negotiation still in flight; its completion decides.
            debug!(reason = %reason, "Transport ended before it was established");
            return;
        }
        if !matches!(
            self.session.state(),
            SessionState::Connecting | SessionState::Active
        ) {
            return;
        }

        warn!(session_id = %self.session.id, reason = %reason, "Transport ended unexpectedly");
        if self.session.modes.auto_reconnect && !self.session.user_closed {
            self.reconnect(ReconnectReason::TransportLost);
        } else {
            if let Some(handle) = self.transport.take() {
                handle.release().await;
            }
            self.shutdown(&reason, false).await;
        }
    }

    fn become_active(&mut self, after_reconnect: bool) {
        self.transition(SessionState::Active);
        self.monitor.start();
        self.last_speak_at = Some(Instant::now());
        info!(session_id = %self.session.id, "Session active");

        if self.input.is_start_deferred() && self.input.has_recognizer() {
            let grace = self.settings.timing.microphone_grace;
            if after_reconnect && !grace.is_zero() {
                debug!(grace_ms = grace.as_millis() as u64, "Deferring microphone start");
                self.spawn_completion(async move {
                    tokio::time::sleep(grace).await;
                    Completion::GraceElapsed
                });
            } else {
                self.input.take_deferred_start();
                self.begin_microphone(None);
            }
        }
        self.speak_next();
    }

    // ---- reconnect & health ----------------------------------------------

    fn reconnect(&mut self, reason: ReconnectReason) {
        if self.session.user_closed || !self.session.state().is_live() {
            return;
        }
        if let Err(refusal) = self.supervisor.begin(reason, Instant::now()) {
            debug!(session_id = %self.session.id, reason = reason.as_str(), ?refusal, "Reconnect not started");
            return;
        }

        info!(session_id = %self.session.id, reason = reason.as_str(), "Reconnecting transport");
        self.transition(SessionState::Reconnecting);
        self.monitor.start();
        self.notify(SessionNotice::Reconnecting { reason });
        self.avatar_speaking = false;

        let replay = self.session.modes.replay_on_reconnect;
        if let Some(utterance) = self.queue.suspend_speaking(replay) {
            self.speak_ticket = None;
            if replay {
                debug!(sequence = utterance.sequence, "Utterance will be replayed after reconnect");
            } else {
                self.notify(SessionNotice::UtteranceFinished {
                    sequence: utterance.sequence,
                    status: UtteranceStatus::Aborted,
                });
            }
        }

        let previous = self.transport.take();
        self.request_transport(previous);
    }

    async fn on_reconnect_failed(&mut self, err: SessionError) {
        let message = err.to_string();
        warn!(session_id = %self.session.id, error = %message, "Reconnect attempt failed");

        if self.supervisor.state().last_trigger_reason == Some(ReconnectReason::Wake) {
            self.supervisor.reset();
            self.notify(SessionNotice::ReconnectFailed {
                message,
                retry_in_ms: None,
            });
            self.transition(SessionState::Standby);
            self.notify(SessionNotice::Standby);
            return;
        }

        // Nothing retries once auto-reconnect is off.
        if !self.session.modes.auto_reconnect {
            self.notify(SessionNotice::ReconnectFailed {
                message: message.clone(),
                retry_in_ms: None,
            });
            self.shutdown(&format!("reconnect failed: {message}"), false)
                .await;
            return;
        }

        match self.supervisor.finish_failure(Instant::now()) {
            FailureOutcome::Retry { after } => {
                self.notify(SessionNotice::ReconnectFailed {
                    message,
                    retry_in_ms: Some(after.as_millis() as u64),
                });
            }
            FailureOutcome::Exhausted => {
                error!(session_id = %self.session.id, "Giving up on reconnect");
                self.notify(SessionNotice::ReconnectFailed {
                    message: message.clone(),
                    retry_in_ms: None,
                });
                self.shutdown(&format!("reconnect failed: {message}"), false).await;
            }
        }
    }

    fn on_health_tick(&mut self) {
        let snapshot = HealthSnapshot {
            has_rendered_media: self
                .transport
                .as_ref()
                .is_some_and(|t| t.rendered_tracks() > 0),
            last_speak_at: self.last_speak_at,
            is_speaking: self.queue.is_speaking() || self.avatar_speaking,
        };
        let ctx = MonitorContext {
            state: self.session.state(),
            auto_reconnect: self.session.modes.auto_reconnect,
            idle_fallback: self.session.modes.idle_fallback,
            user_closed: self.session.user_closed,
            idle_threshold: self.settings.timing.idle_threshold,
        };

        for signal in monitor::evaluate(&snapshot, &ctx, Instant::now()) {
            match signal {
                HealthSignal::Hung => self.reconnect(ReconnectReason::Hung),
                HealthSignal::Idle => self.enter_standby(),
            }
        }
    }

    fn enter_standby(&mut self) {
        if self.session.state() != SessionState::Active || self.session.user_closed {
            return;
        }
        info!(session_id = %self.session.id, "No speech activity, releasing transport");
        self.transition(SessionState::Standby);
        self.avatar_speaking = false;
        self.media_started = false;
        if let Some(handle) = self.transport.take() {
            tokio::spawn(async move { handle.release().await });
        }
        self.notify(SessionNotice::Standby);
    }

    fn wake(&mut self) {
        if self.session.state() == SessionState::Standby {
            self.reconnect(ReconnectReason::Wake);
        }
    }

    // ---- speech input ----------------------------------------------------

    fn ensure_recognizer(&mut self) {
        if self.input.has_recognizer() || self.recognizer_pending {
            return;
        }
        self.recognizer_pending = true;
        let service = self.collaborators.recognizer.clone();
        let locales = self.settings.locales.clone();
        let events = RecognitionEvents::new(self.epoch, self.inputs_tx.clone());
        self.spawn_completion(async move {
            let result = service.create_recognizer(&locales, events).await;
            Completion::RecognizerReady { result }
        });
    }

    fn on_recognizer_ready(&mut self, result: SessionResult<RecognizerHandle>) {
        self.recognizer_pending = false;
        match result {
            Ok(recognizer) => {
                debug!(session_id = %self.session.id, "Recognizer ready");
                self.input.attach(recognizer);
                if self.session.state() == SessionState::Active && self.input.take_deferred_start() {
                    self.begin_microphone(None);
                }
                self.notify_microphone();
            }
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Failed to create recognizer");
                self.notify(SessionNotice::RecognitionFailed {
                    message: err.to_string(),
                });
            }
        }
    }

    fn start_microphone(&mut self, reply: Reply<SessionResult<()>>) {
        let state = self.session.state();
        if !state.is_live() {
            self.reply(reply, Err(SessionError::invalid_state("start the microphone", state)));
            return;
        }
        // Barge-in.
        if self.queue.is_speaking() || self.avatar_speaking {
            self.interrupt_speech();
        }

        if state == SessionState::Active && self.input.has_recognizer() {
            self.begin_microphone(Some(reply));
            return;
        }
        if !self.input.has_recognizer() && !self.recognizer_pending {
            let err = SessionError::Recognition("speech recognizer is not available".to_string());
            self.reply(reply, Err(err));
            return;
        }

        debug!(session_id = %self.session.id, %state, "Microphone start deferred");
        self.input.defer_start();
        self.notify_microphone();
        self.wake();
        self.reply(reply, Ok(()));
    }

    fn begin_microphone(&mut self, reply: Option<Reply<SessionResult<()>>>) {
        match self.input.begin_start() {
            Ok(None) => self.respond(reply, Ok(())),
            Ok(Some(recognizer)) => {
                self.notify_microphone();
                self.spawn_completion(async move {
                    let result = recognizer.start().await;
                    Completion::MicrophoneStarted { result, reply }
                });
            }
            Err(err) => {
                debug!(error = %err, "Microphone start rejected");
                if reply.is_none() {
                    self.notify(SessionNotice::RecognitionFailed {
                        message: err.to_string(),
                    });
                }
                self.respond(reply, Err(err));
            }
        }
    }

    fn stop_microphone(&mut self, reply: Reply<SessionResult<()>>) {
        let cancelled = self.input.take_deferred_start();
        self.input.abort_turn();
        match self.input.begin_stop() {
            Some(recognizer) => self.stop_recognition(recognizer, Some(reply)),
            None => {
                if self.input.stop_once_started() {
                    debug!(session_id = %self.session.id, "Microphone stop queued behind start");
                }
                if cancelled {
                    self.notify_microphone();
                }
                self.reply(reply, Ok(()));
            }
        }
    }

    fn stop_recognition(
        &mut self,
        recognizer: RecognizerHandle,
        reply: Option<Reply<SessionResult<()>>>,
    ) {
        self.notify_microphone();
        self.spawn_completion(async move {
            let result = recognizer.stop().await;
            Completion::MicrophoneStopped { result, reply }
        });
    }

    fn on_recognition_event(&mut self, event: RecognitionEvent) {
        if !self.session.state().is_live() {
            return;
        }
        match event {
            RecognitionEvent::Partial(text) => {
                let draft = self.input.on_partial(&text).to_string();
                self.notify(SessionNotice::DraftUpdated { text: draft });
            }
            RecognitionEvent::Final(text) => {
                let mode = ConversationMode::from_flag(self.session.modes.continuous_conversation);
                match self.input.on_final(&text, mode) {
                    FinalOutcome::Ignored => debug!("Ignoring blank final transcript"),
                    FinalOutcome::Dispatch { query, stop } => {
                        if let Some(recognizer) = stop {
                            self.stop_recognition(recognizer, None);
                        }
                        self.dispatch_turn(query);
                    }
                }
            }
            RecognitionEvent::Canceled(message) => {
                warn!(session_id = %self.session.id, reason = %message, "Recognition canceled");
                self.input.on_canceled();
                self.notify(SessionNotice::RecognitionFailed { message });
                self.notify_microphone();
            }
        }
    }

    // ---- turns & replies -------------------------------------------------

    fn submit_typed_message(&mut self, text: &str) -> SessionResult<()> {
        let state = self.session.state();
        if matches!(state, SessionState::Closing | SessionState::Closed) {
            return Err(SessionError::invalid_state("submit a message", state));
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.dispatch_turn(text.to_string());
        Ok(())
    }

    fn dispatch_turn(&mut self, text: String) {
        // Barge-in.
        if self.queue.is_speaking() || self.queue.pending_len() > 0 || self.avatar_speaking {
            self.interrupt_speech();
        }

        self.last_turn += 1;
        let turn = self.last_turn;
        info!(session_id = %self.session.id, turn, "Dispatching user turn");
        self.notify(SessionNotice::UserTurn { text: text.clone() });

        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.push(ChatMessage::system(self.settings.system_prompt.clone()));
        history.extend(self.history.iter().cloned());

        let query = self.collaborators.query.clone();
        self.spawn_completion(async move {
            let result = query.submit(&text, &history).await;
            Completion::QueryFinished {
                turn,
                user_text: text,
                result,
            }
        });
        self.wake();
    }

    fn on_query_finished(&mut self, turn: u64, user_text: String, result: SessionResult<String>) {
        if turn <= self.reply_cutoff {
            debug!(turn, "Discarding reply to an interrupted turn");
            return;
        }
        let reply = match result {
            Ok(reply) => reply.trim().to_string(),
            Err(err) => {
                warn!(session_id = %self.session.id, turn, error = %err, "Query failed");
                self.notify(SessionNotice::QueryFailed {
                    message: err.to_string(),
                });
                return;
            }
        };

        self.history.push(ChatMessage::user(user_text));
        self.history.push(ChatMessage::assistant(reply.clone()));
        if reply.is_empty() {
            debug!(turn, "Empty reply, nothing to speak");
            return;
        }

        let sequence = self.queue.enqueue(reply.clone());
        debug!(session_id = %self.session.id, turn, sequence, "Reply queued");
        self.notify(SessionNotice::AgentReply {
            sequence,
            text: reply,
        });
        self.wake();
        self.speak_next();
    }

    // ---- playback --------------------------------------------------------

    fn speak_next(&mut self) {
        if self.session.state() != SessionState::Active {
            return;
        }
        let Some(utterance) = self.queue.begin_next() else {
            return;
        };

        self.ticket_counter += 1;
        let ticket = self.ticket_counter;
        self.speak_ticket = Some(ticket);
        self.last_speak_at = Some(Instant::now());

        let sequence = utterance.sequence;
        debug!(session_id = %self.session.id, sequence, ticket, "Speaking utterance");
        self.notify(SessionNotice::UtteranceStarted { sequence });

        let synthesis = self.collaborators.synthesis.clone();
        self.spawn_completion(async move {
            let result = synthesis.speak(&utterance.text).await;
            Completion::SpeechFinished {
                ticket,
                sequence,
                result,
            }
        });
    }

    fn on_speech_finished(&mut self, ticket: u64, sequence: u64, result: SessionResult<()>) {
        if self.speak_ticket != Some(ticket) {
            debug!(sequence, ticket, "Ignoring completion of superseded speech");
            return;
        }
        self.speak_ticket = None;
        self.last_speak_at = Some(Instant::now());

        let finished = match result {
            Ok(()) => self.queue.complete(sequence),
            Err(err) => {
                warn!(session_id = %self.session.id, sequence, error = %err, "Synthesis failed");
                self.notify(SessionNotice::SynthesisFailed {
                    sequence,
                    message: err.to_string(),
                });
                self.queue.fail(sequence)
            }
        };
        if let Some(utterance) = finished {
            self.notify(SessionNotice::UtteranceFinished {
                sequence,
                status: utterance.status,
            });
        }

        if self.session.state() == SessionState::Active {
            self.speak_next();
        }
    }

    fn interrupt_speech(&mut self) -> Option<Utterance> {
        let outcome = self.queue.interrupt();
        self.speak_ticket = None;
        self.reply_cutoff = self.last_turn;

        if outcome.aborted.is_some() || self.avatar_speaking {
            let synthesis = self.collaborators.synthesis.clone();
            tokio::spawn(async move {
                if let Err(err) = synthesis.stop_speaking().await {
                    warn!(error = %err, "Failed to stop speaking");
                }
            });
        }
        self.avatar_speaking = false;

        let aborted = outcome.aborted.as_ref().map(|u| u.sequence);
        if aborted.is_some() || outcome.discarded > 0 {
            info!(session_id = %self.session.id, ?aborted, discarded = outcome.discarded, "Speech interrupted");
            self.notify(SessionNotice::SpeechInterrupted {
                aborted,
                discarded: outcome.discarded,
            });
        }
        outcome.aborted
    }

    // ---- plumbing --------------------------------------------------------

    fn spawn_completion<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.inputs_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let completion = task.await;
            let _ = tx.send(SessionInput::Completion { epoch, completion });
        });
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn notify_microphone(&self) {
        let microphone = self.input.snapshot();
        self.notify(SessionNotice::MicrophoneChanged {
            listening: microphone.listening,
            input_enabled: microphone.input_enabled,
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id,
            state: self.session.state(),
            started_at: self.session.started_at,
            last_activity_at: self.session.last_activity_at,
            modes: self.session.modes,
            microphone: self.input.snapshot(),
            draft: self.input.draft().map(str::to_string),
            speaking: self.queue.speaking().cloned(),
            pending: self.queue.pending().cloned().collect(),
            recent: self.queue.recent().cloned().collect(),
            reconnect_in_progress: self.supervisor.in_progress(),
            transport_attached: self.transport.is_some(),
            history_len: self.history.len(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Answer a caller. The snapshot is published first so the caller reads
    /// the state its request produced.
    fn reply<T>(&self, reply: Reply<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn respond(&self, reply: Option<Reply<SessionResult<()>>>, result: SessionResult<()>) {
        if let Some(reply) = reply {
            self.reply(reply, result);
        }
    }
}
