//! # Reconnect Supervisor
//!
//! Owns the reconnection policy: single-flight attempts, exponential backoff
//! between failures, and an upper bound on consecutive failures.
//!
//! The supervisor does not loop. A failed attempt records a retry window and
//! the next trigger (normally the health monitor's hung check) starts the next
//! attempt once that window has passed.

use crate::session::collaborators::{TransportEvents, TransportHandle, TransportNegotiator};
use crate::session::error::SessionResult;
use crate::session::model::{ReconnectReason, ReconnectState};
use crate::session::settings::TransportSettings;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(800);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Wait imposed after the `failures`-th consecutive failure (1-based).
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(10);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Why `begin` refused to start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    InProgress,
    BackingOff { remaining: Duration },
    Exhausted,
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { after: Duration },
    Exhausted,
}

#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    state: ReconnectState,
    retry_at: Option<Instant>,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::default(),
            retry_at: None,
        }
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn in_progress(&self) -> bool {
        self.state.in_progress
    }

    /// Claim the single reconnect slot.
    pub fn begin(&mut self, reason: ReconnectReason, now: Instant) -> Result<(), Refusal> {
        if self.state.in_progress {
            return Err(Refusal::InProgress);
        }
        if self.state.consecutive_failures >= self.policy.max_attempts {
            return Err(Refusal::Exhausted);
        }
        if let Some(retry_at) = self.retry_at {
            if now < retry_at {
                return Err(Refusal::BackingOff {
                    remaining: retry_at - now,
                });
            }
        }

        self.state.in_progress = true;
        self.state.last_trigger_reason = Some(reason);
        self.state.attempt_started_at = Some(Utc::now());
        self.retry_at = None;
        debug!(
            reason = reason.as_str(),
            failures = self.state.consecutive_failures,
            "Reconnect attempt started"
        );
        Ok(())
    }

    pub fn finish_success(&mut self) {
        if self.state.consecutive_failures > 0 {
            info!(
                failures = self.state.consecutive_failures,
                "Reconnected after failed attempts"
            );
        }
        self.reset();
    }

    pub fn finish_failure(&mut self, now: Instant) -> FailureOutcome {
        self.state.in_progress = false;
        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures >= self.policy.max_attempts {
            self.retry_at = None;
            return FailureOutcome::Exhausted;
        }
        let after = self.policy.backoff_delay(self.state.consecutive_failures);
        self.retry_at = Some(now + after);
        FailureOutcome::Retry { after }
    }

    /// Forget every attempt, releasing the slot.
    pub fn reset(&mut self) {
        self.state = ReconnectState::default();
        self.retry_at = None;
    }
}

/// Release the old handle, then negotiate a new one through the start-up path.
///
/// The old handle is fully released before the request goes out, so two
/// handles are never bound to the media sink at once.
pub async fn replace_transport(
    previous: Option<Box<dyn TransportHandle>>,
    negotiator: Arc<dyn TransportNegotiator>,
    settings: TransportSettings,
    events: TransportEvents,
) -> SessionResult<Box<dyn TransportHandle>> {
    if let Some(previous) = previous {
        debug!(handle = %previous.describe(), "Releasing transport before reconnect");
        previous.release().await;
    }
    negotiator.request_transport(&settings, events).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1600));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(3200));
        assert_eq!(policy.backoff_delay(7), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_single_flight() {
        let mut supervisor = ReconnectSupervisor::new(policy(12));
        let now = Instant::now();
        assert!(supervisor.begin(ReconnectReason::Hung, now).is_ok());
        assert_eq!(
            supervisor.begin(ReconnectReason::Hung, now),
            Err(Refusal::InProgress)
        );
        assert_eq!(
            supervisor.state().last_trigger_reason,
            Some(ReconnectReason::Hung)
        );

        supervisor.finish_success();
        assert!(!supervisor.in_progress());
        assert!(supervisor.begin(ReconnectReason::TransportLost, now).is_ok());
    }

    #[test]
    fn test_failure_opens_backoff_window() {
        let mut supervisor = ReconnectSupervisor::new(policy(12));
        let now = Instant::now();
        supervisor.begin(ReconnectReason::TransportLost, now).unwrap();

        let outcome = supervisor.finish_failure(now);
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                after: Duration::from_millis(800)
            }
        );
        assert!(!supervisor.in_progress());
        assert!(matches!(
            supervisor.begin(ReconnectReason::Hung, now + Duration::from_millis(100)),
            Err(Refusal::BackingOff { .. })
        ));
        assert!(supervisor
            .begin(ReconnectReason::Hung, now + Duration::from_millis(800))
            .is_ok());
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut supervisor = ReconnectSupervisor::new(policy(2));
        let mut now = Instant::now();

        supervisor.begin(ReconnectReason::Hung, now).unwrap();
        let FailureOutcome::Retry { after } = supervisor.finish_failure(now) else {
            panic!("first failure should be retried");
        };
        now += after;

        supervisor.begin(ReconnectReason::Hung, now).unwrap();
        assert_eq!(supervisor.finish_failure(now), FailureOutcome::Exhausted);
        assert_eq!(
            supervisor.begin(ReconnectReason::Hung, now + Duration::from_secs(60)),
            Err(Refusal::Exhausted)
        );

        supervisor.reset();
        assert!(supervisor.begin(ReconnectReason::Wake, now).is_ok());
    }
}
