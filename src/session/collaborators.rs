//! # Collaborator Contracts
//!
//! The orchestrator never talks to a network, a microphone or a speaker
//! directly. It depends on four narrow async contracts:
//!
//! - **TransportNegotiator**: obtain credentials and open the avatar connection
//! - **RecognizerService**: create a speech recognizer, then start/stop it
//! - **SynthesisService**: speak a text, stop speaking
//! - **QueryService**: turn a user utterance into a reply
//!
//! Collaborators report asynchronous happenings (media started, turn end,
//! partial transcript...) through the event sinks handed to them at creation.
//! Each sink is stamped with the generation of the handle it belongs to, so the
//! orchestrator can ignore events from a handle it has already let go of.

use crate::session::model::ChatMessage;
use crate::session::orchestrator::SessionInput;
use crate::session::settings::TransportSettings;
use crate::session::error::SessionResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle events of one transport handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Remote media is being rendered.
    Started,
    /// The avatar started speaking a turn.
    TurnStart,
    /// The avatar finished speaking a turn.
    TurnEnd,
    /// The connection is gone.
    Ended { reason: Option<String> },
}

/// Events produced by an active recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Partial(String),
    Final(String),
    /// Recognition stopped on its own (service error, device lost).
    Canceled(String),
}

/// Sink a transport handle uses to report its lifecycle.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once the orchestrator has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionInput::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Sink a recognizer uses to report transcripts.
#[derive(Debug, Clone)]
pub struct RecognitionEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl RecognitionEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { epoch, tx }
    }

    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.tx
            .send(SessionInput::Recognition {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Exclusive ownership of one streaming avatar connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Human-readable identifier for logs.
    fn describe(&self) -> String;

    /// Number of media tracks the rendering sink currently shows. Read-only.
    fn rendered_tracks(&self) -> usize;

    /// Tear the connection down. Must be safe to call on an ended connection.
    async fn release(&self);
}

#[async_trait]
pub trait TransportNegotiator: Send + Sync {
    async fn request_transport(
        &self,
        settings: &TransportSettings,
        events: TransportEvents,
    ) -> SessionResult<Box<dyn TransportHandle>>;
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn start(&self) -> SessionResult<()>;
    async fn stop(&self) -> SessionResult<()>;
    async fn close(&self);
}

pub type RecognizerHandle = Arc<dyn Recognizer>;

#[async_trait]
pub trait RecognizerService: Send + Sync {
    async fn create_recognizer(
        &self,
        locales: &[String],
        events: RecognitionEvents,
    ) -> SessionResult<RecognizerHandle>;
}

#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Resolves once the text has been fully spoken.
    async fn speak(&self, text: &str) -> SessionResult<()>;
    async fn stop_speaking(&self) -> SessionResult<()>;
}

#[async_trait]
pub trait QueryService: Send + Sync {
    /// `history` holds the system prompt and earlier turns; `user_text` is the new turn.
    async fn submit(&self, user_text: &str, history: &[ChatMessage]) -> SessionResult<String>;
}

/// The full set of collaborators an orchestrator is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn TransportNegotiator>,
    pub recognizer: Arc<dyn RecognizerService>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub query: Arc<dyn QueryService>,
}
