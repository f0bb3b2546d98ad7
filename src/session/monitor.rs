//! # Transport Health Monitor
//!
//! Fixed-interval liveness and idle checks. The monitor only reads a
//! [`HealthSnapshot`] and returns advisory signals; the orchestrator decides
//! what to do with them.

use crate::session::model::{HealthSnapshot, SessionState};
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// No media is being rendered.
    Hung,
    /// No speech activity for longer than the idle threshold.
    Idle,
}

/// Session facts the checks depend on, captured at tick time.
#[derive(Debug, Clone, Copy)]
pub struct MonitorContext {
    pub state: SessionState,
    pub auto_reconnect: bool,
    pub idle_fallback: bool,
    pub user_closed: bool,
    pub idle_threshold: Duration,
}

/// Evaluate both checks. Pure: no timers, no side effects.
pub fn evaluate(snapshot: &HealthSnapshot, ctx: &MonitorContext, now: Instant) -> Vec<HealthSignal> {
    let mut signals = Vec::new();
    if !ctx.state.is_monitored() || ctx.user_closed {
        return signals;
    }

    if ctx.auto_reconnect && !snapshot.has_rendered_media {
        signals.push(HealthSignal::Hung);
    }

    if ctx.idle_fallback
        && ctx.state == SessionState::Active
        && !snapshot.is_speaking
        && snapshot
            .last_speak_at
            .is_some_and(|at| now.saturating_duration_since(at) > ctx.idle_threshold)
    {
        signals.push(HealthSignal::Idle);
    }

    signals
}

/// Owns the poll timer. Stopping drops the timer synchronously.
#[derive(Debug)]
pub struct HealthMonitor {
    period: Duration,
    interval: Option<Interval>,
}

impl HealthMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Start polling. The first tick fires one period from now. No-op when running.
    pub fn start(&mut self) {
        if self.interval.is_some() {
            return;
        }
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next tick. Never resolves while stopped.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(state: SessionState) -> MonitorContext {
        MonitorContext {
            state,
            auto_reconnect: true,
            idle_fallback: true,
            user_closed: false,
            idle_threshold: Duration::from_secs(15),
        }
    }

    fn rendering(last_speak_at: Option<Instant>) -> HealthSnapshot {
        HealthSnapshot {
            has_rendered_media: true,
            last_speak_at,
            is_speaking: false,
        }
    }

    #[test]
    fn test_no_tracks_is_hung() {
        let snapshot = HealthSnapshot {
            has_rendered_media: false,
            last_speak_at: None,
            is_speaking: false,
        };
        let signals = evaluate(&snapshot, &ctx(SessionState::Active), Instant::now());
        assert_eq!(signals, vec![HealthSignal::Hung]);
    }

    #[test]
    fn test_hung_requires_auto_reconnect_and_open_session() {
        let snapshot = HealthSnapshot {
            has_rendered_media: false,
            last_speak_at: None,
            is_speaking: false,
        };
        let mut context = ctx(SessionState::Active);
        context.auto_reconnect = false;
        assert!(evaluate(&snapshot, &context, Instant::now()).is_empty());

        let mut context = ctx(SessionState::Active);
        context.user_closed = true;
        assert!(evaluate(&snapshot, &context, Instant::now()).is_empty());
    }

    #[test]
    fn test_idle_after_threshold() {
        let now = Instant::now();
        let long_ago = now - Duration::from_secs(16);
        let recent = now - Duration::from_secs(3);

        let context = ctx(SessionState::Active);
        assert_eq!(
            evaluate(&rendering(Some(long_ago)), &context, now),
            vec![HealthSignal::Idle]
        );
        assert!(evaluate(&rendering(Some(recent)), &context, now).is_empty());
    }

    #[test]
    fn test_idle_suppressed_while_speaking_or_reconnecting() {
        let now = Instant::now();
        let long_ago = now - Duration::from_secs(60);

        let mut speaking = rendering(Some(long_ago));
        speaking.is_speaking = true;
        assert!(evaluate(&speaking, &ctx(SessionState::Active), now).is_empty());

        assert!(evaluate(&rendering(Some(long_ago)), &ctx(SessionState::Reconnecting), now).is_empty());
    }

    #[test]
    fn test_unmonitored_states_are_silent() {
        let snapshot = HealthSnapshot {
            has_rendered_media: false,
            last_speak_at: None,
            is_speaking: false,
        };
        for state in [SessionState::Idle, SessionState::Standby, SessionState::Closed] {
            assert!(evaluate(&snapshot, &ctx(state), Instant::now()).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_every_period_until_stopped() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(2));
        assert!(!monitor.is_running());

        monitor.start();
        let started = Instant::now();
        monitor.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        monitor.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));

        monitor.stop();
        let stopped = tokio::time::timeout(Duration::from_secs(10), monitor.tick()).await;
        assert!(stopped.is_err());
    }
}
