//! UI-facing handle to a running [`SessionOrchestrator`](super::SessionOrchestrator).
//!
//! Cheap to clone. Every operation is a message to the orchestrator task; the
//! call resolves once the orchestrator has applied it.

use crate::session::error::{SessionError, SessionResult};
use crate::session::model::{ModeFlags, ModeUpdate, SessionNotice, SessionSnapshot, Utterance};
use crate::session::orchestrator::SessionCommand;
use crate::session::settings::SessionSettings;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionController {
    pub(crate) fn new(
        commands: mpsc::Sender<SessionCommand>,
        snapshots: watch::Receiver<SessionSnapshot>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            commands,
            snapshots,
            notices,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Unavailable)?;
        response.await.map_err(|_| SessionError::Unavailable)
    }

    /// Open a session. Fails without a state change when `settings` are incomplete.
    pub async fn start_session(&self, settings: SessionSettings) -> SessionResult<Uuid> {
        let settings = Box::new(settings);
        self.request(|reply| SessionCommand::Start { settings, reply })
            .await?
    }

    /// Close the session. Idempotent; resolves once everything is released.
    pub async fn stop_session(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    /// Abort the speaking utterance and drop pending ones. Returns the aborted utterance.
    pub async fn interrupt_speech(&self) -> SessionResult<Option<Utterance>> {
        self.request(|reply| SessionCommand::Interrupt { reply })
            .await
    }

    pub async fn submit_typed_message(&self, text: impl Into<String>) -> SessionResult<()> {
        let text = text.into();
        self.request(|reply| SessionCommand::SubmitText { text, reply })
            .await?
    }

    /// Start listening. Deferred (and still `Ok`) while the transport is down.
    pub async fn start_microphone(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::StartMicrophone { reply })
            .await?
    }

    pub async fn stop_microphone(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::StopMicrophone { reply })
            .await?
    }

    /// Merge `update` into the live flags. Returns the flags now in effect.
    ///
    /// `ModeUpdate::from(flags)` replaces every flag.
    pub async fn update_modes(&self, update: ModeUpdate) -> SessionResult<ModeFlags> {
        self.request(|reply| SessionCommand::UpdateModes { update, reply })
            .await
    }

    /// Forget earlier turns. The system prompt is kept.
    pub async fn clear_history(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::ClearHistory { reply })
            .await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// False once the orchestrator task has ended.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}
