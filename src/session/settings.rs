//! # Session Settings
//!
//! Everything a session needs from configuration, captured once at
//! `start_session`. Validation here is what turns missing credentials into a
//! `ConfigurationError` before the state machine moves.

use crate::session::error::{SessionError, SessionResult};
use crate::session::reconnect::ReconnectPolicy;
use std::time::Duration;

/// Locales recognised when none are configured.
pub const DEFAULT_LOCALES: &[&str] = &[
    "en-US", "de-DE", "es-ES", "fr-FR", "it-IT", "ja-JP", "ko-KR", "zh-CN",
];

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI assistant that helps people find information.";

/// What the transport negotiator needs to open an avatar connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSettings {
    pub region: String,
    pub api_key: String,
    pub private_endpoint: Option<String>,
    pub avatar_character: String,
    pub avatar_style: String,
    pub customized_avatar: bool,
    pub tts_voice: String,
    pub custom_voice_endpoint_id: Option<String>,
    pub personal_voice_speaker_profile_id: Option<String>,
}

/// Timers driving the health monitor and microphone reactivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSettings {
    /// Health monitor poll period.
    pub health_poll_interval: Duration,
    /// Quiet time before the idle fallback kicks in.
    pub idle_threshold: Duration,
    /// Delay before a deferred microphone start runs once the transport is back.
    pub microphone_grace: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(2),
            idle_threshold: Duration::from_secs(15),
            microphone_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub locales: Vec<String>,
    pub system_prompt: String,
    pub transport: TransportSettings,
    pub timing: TimingSettings,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            locales: DEFAULT_LOCALES.iter().map(|l| l.to_string()).collect(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            transport: TransportSettings::default(),
            timing: TimingSettings::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionSettings {
    /// Check that a session could actually be negotiated with these settings.
    pub fn validate(&self) -> SessionResult<()> {
        let transport = &self.transport;
        if transport.api_key.trim().is_empty() {
            return Err(SessionError::Configuration(
                "speech resource API key is missing".to_string(),
            ));
        }
        let has_endpoint = transport
            .private_endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        if transport.region.trim().is_empty() && !has_endpoint {
            return Err(SessionError::Configuration(
                "speech region or private endpoint is required".to_string(),
            ));
        }
        if self.locales.iter().all(|l| l.trim().is_empty()) {
            return Err(SessionError::Configuration(
                "at least one recognition locale is required".to_string(),
            ));
        }
        if self.timing.health_poll_interval.is_zero() {
            return Err(SessionError::Configuration(
                "health poll interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> SessionSettings {
        let mut settings = SessionSettings::default();
        settings.transport.api_key = "key".to_string();
        settings.transport.region = "westus2".to_string();
        settings
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let settings = SessionSettings::default();
        assert!(matches!(
            settings.validate(),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_private_endpoint_replaces_region() {
        let mut settings = configured();
        settings.transport.region.clear();
        assert!(settings.validate().is_err());

        settings.transport.private_endpoint = Some("my-speech.cognitiveservices.azure.com".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_timers() {
        let settings = configured();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timing.health_poll_interval, Duration::from_secs(2));
        assert_eq!(settings.timing.idle_threshold, Duration::from_secs(15));
        assert_eq!(settings.locales.len(), 8);
    }
}
