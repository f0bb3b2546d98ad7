//! # Session Data Model
//!
//! Plain data types shared by every part of the orchestrator: the session
//! entity and its lifecycle states, mode flags, utterances, reconnect
//! bookkeeping, and the read-only snapshot/notice types handed to the UI layer.
//!
//! ## Ownership:
//! Nothing in here holds a collaborator handle. Handles live in the
//! orchestrator, which is the only owner of a `Session`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of a session.
///
/// ## Transitions:
/// - `Idle → Connecting → Active`
/// - `Active → Reconnecting → Active | Closed`
/// - `Active → Standby → Reconnecting` (idle fallback, woken by the next user turn)
/// - any non-`Closed` state `→ Closing → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Standby,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Standby => "standby",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// States in which `start_session` is accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }

    /// States the health monitor polls in.
    pub fn is_monitored(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Reconnecting)
    }

    /// States with a started session that has not begun closing.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Active
                | SessionState::Reconnecting
                | SessionState::Standby
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-selectable behaviour switches.
///
/// ## Fields:
/// - `continuous_conversation`: keep the recognizer listening after a final result
/// - `auto_reconnect`: reconnect on unexpected transport loss or a hung media stream
/// - `idle_fallback`: release the transport after a quiet period (Standby)
/// - `replay_on_reconnect`: re-speak the interrupted utterance after reconnect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    #[serde(default)]
    pub continuous_conversation: bool,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub idle_fallback: bool,
    #[serde(default)]
    pub replay_on_reconnect: bool,
}

/// Partial change to [`ModeFlags`]; absent flags keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeUpdate {
    pub continuous_conversation: Option<bool>,
    pub auto_reconnect: Option<bool>,
    pub idle_fallback: Option<bool>,
    pub replay_on_reconnect: Option<bool>,
}

impl ModeUpdate {
    pub fn apply(&self, current: ModeFlags) -> ModeFlags {
        ModeFlags {
            continuous_conversation: self
                .continuous_conversation
                .unwrap_or(current.continuous_conversation),
            auto_reconnect: self.auto_reconnect.unwrap_or(current.auto_reconnect),
            idle_fallback: self.idle_fallback.unwrap_or(current.idle_fallback),
            replay_on_reconnect: self
                .replay_on_reconnect
                .unwrap_or(current.replay_on_reconnect),
        }
    }
}

impl From<ModeFlags> for ModeUpdate {
    fn from(modes: ModeFlags) -> Self {
        Self {
            continuous_conversation: Some(modes.continuous_conversation),
            auto_reconnect: Some(modes.auto_reconnect),
            idle_fallback: Some(modes.idle_fallback),
            replay_on_reconnect: Some(modes.replay_on_reconnect),
        }
    }
}

/// The one live session of an orchestrator.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub modes: ModeFlags,
    /// Set once the user asked for the session to stop; disables every
    /// automatic recovery path.
    pub user_closed: bool,
}

impl Session {
    pub fn new(modes: ModeFlags) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            started_at: None,
            last_activity_at: Utc::now(),
            modes,
            user_closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, stamping `last_activity_at`. Returns the previous state.
    pub fn transition(&mut self, next: SessionState) -> SessionState {
        let previous = self.state;
        self.state = next;
        self.last_activity_at = Utc::now();
        if next == SessionState::Connecting && self.started_at.is_none() {
            self.started_at = Some(self.last_activity_at);
        }
        previous
    }
}

/// Playback status of one utterance. `Spoken` and `Aborted` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceStatus {
    Pending,
    Speaking,
    Spoken,
    Aborted,
}

/// One unit of agent speech.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub sequence: u64,
    pub text: String,
    pub status: UtteranceStatus,
}

/// Why a reconnect was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    /// The transport reported an unexpected end.
    TransportLost,
    /// The health monitor saw no rendered media.
    Hung,
    /// A user turn arrived while the session was in Standby.
    Wake,
}

impl ReconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectReason::TransportLost => "transport_lost",
            ReconnectReason::Hung => "hung",
            ReconnectReason::Wake => "wake",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub in_progress: bool,
    pub last_trigger_reason: Option<ReconnectReason>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Signals read by one health-monitor tick. Never stored past the tick.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub has_rendered_media: bool,
    pub last_speak_at: Option<Instant>,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MicrophoneSnapshot {
    pub listening: bool,
    pub input_enabled: bool,
    /// A start was requested while the transport was down.
    pub start_deferred: bool,
}

/// Read-only view of the orchestrator for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub modes: ModeFlags,
    pub microphone: MicrophoneSnapshot,
    pub draft: Option<String>,
    pub speaking: Option<Utterance>,
    pub pending: Vec<Utterance>,
    /// Most recent finished utterances, oldest first.
    pub recent: Vec<Utterance>,
    pub reconnect_in_progress: bool,
    pub transport_attached: bool,
    pub history_len: usize,
}

impl SessionSnapshot {
    /// View of a session nothing has happened to yet.
    pub fn idle(session: &Session) -> Self {
        Self {
            session_id: session.id,
            state: session.state(),
            started_at: session.started_at,
            last_activity_at: session.last_activity_at,
            modes: session.modes,
            microphone: MicrophoneSnapshot::default(),
            draft: None,
            speaking: None,
            pending: Vec::new(),
            recent: Vec::new(),
            reconnect_in_progress: false,
            transport_attached: false,
            history_len: 0,
        }
    }

    /// Number of utterances still queued, including the one speaking.
    pub fn queue_len(&self) -> usize {
        self.pending.len() + usize::from(self.speaking.is_some())
    }
}

/// Notices pushed to the UI layer as things happen.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotice {
    StateChanged { from: SessionState, to: SessionState },
    DraftUpdated { text: String },
    UserTurn { text: String },
    AgentReply { sequence: u64, text: String },
    UtteranceStarted { sequence: u64 },
    UtteranceFinished { sequence: u64, status: UtteranceStatus },
    SpeechInterrupted { aborted: Option<u64>, discarded: usize },
    MicrophoneChanged { listening: bool, input_enabled: bool },
    QueryFailed { message: String },
    RecognitionFailed { message: String },
    SynthesisFailed { sequence: u64, message: String },
    Reconnecting { reason: ReconnectReason },
    Reconnected,
    ReconnectFailed { message: String, retry_in_ms: Option<u64> },
    Standby,
    Closed { reason: String, user_initiated: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_update_keeps_absent_flags() {
        let current = ModeFlags {
            auto_reconnect: true,
            replay_on_reconnect: true,
            ..ModeFlags::default()
        };
        let update = ModeUpdate {
            idle_fallback: Some(true),
            replay_on_reconnect: Some(false),
            ..ModeUpdate::default()
        };
        let merged = update.apply(current);
        assert!(merged.auto_reconnect);
        assert!(merged.idle_fallback);
        assert!(!merged.replay_on_reconnect);
        assert!(!merged.continuous_conversation);
        assert_eq!(ModeUpdate::from(current).apply(ModeFlags::default()), current);
    }

    #[test]
    fn test_transition_stamps_activity_and_start() {
        let mut session = Session::new(ModeFlags::default());
        let before = session.last_activity_at;
        assert!(session.started_at.is_none());

        let previous = session.transition(SessionState::Connecting);
        assert_eq!(previous, SessionState::Idle);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.last_activity_at >= before);
        assert!(session.started_at.is_some());
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Closed.can_start());
        assert!(!SessionState::Active.can_start());
        assert!(SessionState::Reconnecting.is_monitored());
        assert!(!SessionState::Standby.is_monitored());
        assert!(SessionState::Standby.is_live());
        assert!(!SessionState::Closing.is_live());
    }

    #[test]
    fn test_notice_serialization_is_tagged() {
        let notice = SessionNotice::StateChanged {
            from: SessionState::Connecting,
            to: SessionState::Active,
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["to"], "active");
    }
}
