//! Real-time avatar session orchestration.
//!
//! [`SessionOrchestrator`] owns one conversational session with a streaming
//! avatar and keeps it consistent while recognition, synthesis, queries and
//! the transport complete in any order. UI code talks to it through a
//! [`SessionController`]; the outside world is reached only through the
//! traits in [`collaborators`].

pub mod collaborators;
pub mod controller;
pub mod error;
pub mod input;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod reconnect;
pub mod settings;

#[cfg(test)]
pub mod testing;

pub use collaborators::Collaborators;
pub use controller::SessionController;
pub use error::{SessionError, SessionResult};
pub use model::{ModeFlags, ModeUpdate, SessionNotice, SessionSnapshot, SessionState};
pub use orchestrator::SessionOrchestrator;
pub use settings::SessionSettings;
