//! Errors produced by the session orchestrator and its collaborators.

use crate::session::model::SessionState;
use thiserror::Error;

/// Every failure the orchestrator can observe or report.
///
/// ## Scope of each variant:
/// - `Configuration`: missing credentials or endpoint; raised before any state change
/// - `Transport`: negotiation failed or the connection dropped
/// - `Recognition` / `Synthesis`: local to one operation, never tears down the session
/// - `Query`: reply generation failed; surfaced, nothing is enqueued
/// - `InvalidState`: the operation is not allowed in the current lifecycle state
/// - `Unavailable`: the orchestrator task is gone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("recognition error: {0}")]
    Recognition(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("session orchestrator is not running")]
    Unavailable,
}

impl SessionError {
    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        SessionError::InvalidState { operation, state }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
