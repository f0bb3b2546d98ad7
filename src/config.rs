//! # Configuration Management
//!
//! Loads the service configuration from several sources:
//! - Default values (built into the code)
//! - An optional configuration file (`config.toml`)
//! - Environment variables (with the `APP_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_SPEECH__REGION`, `APP_SESSION__AUTO_RECONNECT`, ...)
//! 2. Configuration file (`config.toml`)
//! 3. Default values (defined in the Default impls)
//!
//! Missing credentials are not a startup error. The server can run without a
//! speech key; `start_session` reports the problem when someone asks for a
//! session.

use crate::session::model::ModeFlags;
use crate::session::reconnect::ReconnectPolicy;
use crate::session::settings::{
    SessionSettings, TimingSettings, TransportSettings, DEFAULT_LOCALES, DEFAULT_SYSTEM_PROMPT,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

const REDACTED: &str = "********";

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where the HTTP server listens
/// - `speech`: Azure Speech resource used for the avatar, recognition and synthesis
/// - `openai`: Azure OpenAI deployment answering user turns
/// - `avatar`: which avatar character and style to render
/// - `session`: default mode flags and orchestrator timers
/// - `bridge`: browser bridge tuning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub openai: OpenAiConfig,
    pub avatar: AvatarConfig,
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
}

/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (containers)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Azure Speech resource settings.
///
/// ## Fields:
/// - `region`: resource region, e.g. `westus2`; ignored when `private_endpoint` is set
/// - `private_endpoint`: host of a private endpoint, e.g. `my-speech.cognitiveservices.azure.com`
/// - `stt_locales`: candidate locales for automatic language detection
/// - `tts_voice`: neural voice the avatar speaks with
/// - `custom_voice_endpoint_id` / `personal_voice_speaker_profile_id`: optional voice customisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub region: String,
    pub api_key: String,
    pub private_endpoint: Option<String>,
    pub stt_locales: Vec<String>,
    pub tts_voice: String,
    pub custom_voice_endpoint_id: Option<String>,
    pub personal_voice_speaker_profile_id: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            region: "westus2".to_string(),
            api_key: String::new(),
            private_endpoint: None,
            stt_locales: DEFAULT_LOCALES.iter().map(|l| l.to_string()).collect(),
            tts_voice: "en-US-AvaMultilingualNeural".to_string(),
            custom_voice_endpoint_id: None,
            personal_voice_speaker_profile_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    pub system_prompt: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment: String::new(),
            api_version: "2024-06-01".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarConfig {
    pub character: String,
    pub style: String,
    /// Set for a custom (customer-trained) avatar.
    pub customized: bool,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            character: "lisa".to_string(),
            style: "casual-sitting".to_string(),
            customized: false,
        }
    }
}

/// Orchestrator defaults.
///
/// The four mode flags seed every new session and can be changed at runtime
/// through `PUT /session/mode`. Timers are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub continuous_conversation: bool,
    pub auto_reconnect: bool,
    pub idle_fallback: bool,
    pub replay_on_reconnect: bool,
    pub health_poll_interval_ms: u64,
    pub idle_threshold_ms: u64,
    /// 0 starts a deferred microphone as soon as the transport is back.
    pub microphone_grace_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuous_conversation: false,
            auto_reconnect: true,
            idle_fallback: false,
            replay_on_reconnect: true,
            health_poll_interval_ms: 2_000,
            idle_threshold_ms: 15_000,
            microphone_grace_ms: 5_000,
            reconnect_base_delay_ms: 800,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long the browser gets to acknowledge a command (speech excepted).
    pub command_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SPEECH__API_KEY=...`: speech resource key
    /// - `APP_SPEECH__STT_LOCALES=en-US,de-DE`: comma separated list
    /// - `APP_SESSION__IDLE_FALLBACK=true`: enable Standby by default
    /// - `HOST=0.0.0.0` / `PORT=3000`: deployment platform overrides
    ///
    /// Sections are separated with a double underscore because many keys
    /// contain a single one.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("speech.stt_locales"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Structural sanity checks run at startup and after every update.
    ///
    /// Credentials are not checked here (see module docs).
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let session = &self.session;
        if session.health_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Health poll interval must be greater than 0"));
        }
        if session.idle_threshold_ms == 0 {
            return Err(anyhow::anyhow!("Idle threshold must be greater than 0"));
        }
        if session.reconnect_max_attempts == 0 {
            return Err(anyhow::anyhow!("Reconnect max attempts must be greater than 0"));
        }
        if session.reconnect_base_delay_ms > session.reconnect_max_delay_ms {
            return Err(anyhow::anyhow!(
                "Reconnect base delay ({} ms) exceeds max delay ({} ms)",
                session.reconnect_base_delay_ms,
                session.reconnect_max_delay_ms
            ));
        }

        if self.bridge.command_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Bridge command timeout must be greater than 0"));
        }

        if self.avatar.character.trim().is_empty() || self.avatar.style.trim().is_empty() {
            return Err(anyhow::anyhow!("Avatar character and style are required"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"session": {"idle_fallback": true}}`.
    ///
    /// The patch is merged into the current configuration; nested objects are
    /// merged key by key, everything else is replaced. Nothing changes if the
    /// result does not deserialize or fails validation.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);
        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }

    /// Copy safe to hand to clients: API keys are masked.
    pub fn redacted(&self) -> AppConfig {
        let mut view = self.clone();
        for key in [&mut view.speech.api_key, &mut view.openai.api_key] {
            if !key.is_empty() {
                *key = REDACTED.to_string();
            }
        }
        view
    }

    pub fn mode_flags(&self) -> ModeFlags {
        ModeFlags {
            continuous_conversation: self.session.continuous_conversation,
            auto_reconnect: self.session.auto_reconnect,
            idle_fallback: self.session.idle_fallback,
            replay_on_reconnect: self.session.replay_on_reconnect,
        }
    }

    /// Settings captured by `start_session`.
    pub fn session_settings(&self) -> SessionSettings {
        let speech = &self.speech;
        let session = &self.session;
        SessionSettings {
            locales: speech.stt_locales.clone(),
            system_prompt: self.openai.system_prompt.clone(),
            transport: TransportSettings {
                region: speech.region.clone(),
                api_key: speech.api_key.clone(),
                private_endpoint: non_empty(&speech.private_endpoint),
                avatar_character: self.avatar.character.clone(),
                avatar_style: self.avatar.style.clone(),
                customized_avatar: self.avatar.customized,
                tts_voice: speech.tts_voice.clone(),
                custom_voice_endpoint_id: non_empty(&speech.custom_voice_endpoint_id),
                personal_voice_speaker_profile_id: non_empty(
                    &speech.personal_voice_speaker_profile_id,
                ),
            },
            timing: TimingSettings {
                health_poll_interval: Duration::from_millis(session.health_poll_interval_ms),
                idle_threshold: Duration::from_millis(session.idle_threshold_ms),
                microphone_grace: Duration::from_millis(session.microphone_grace_ms),
            },
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(session.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(session.reconnect_max_delay_ms),
                max_attempts: session.reconnect_max_attempts,
            },
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.command_timeout_ms)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.speech.stt_locales.len(), 8);
        assert_eq!(config.avatar.character, "lisa");
        // No credentials, still a valid startup configuration
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.reconnect_base_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update_merges_sections() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"idle_fallback": true}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert!(config.session.idle_fallback);
        // Untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.session.auto_reconnect);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        assert!(config
            .update_from_json(r#"{"session": {"health_poll_interval_ms": 0}}"#)
            .is_err());
        assert!(config.update_from_json(r#"{"server": {"port": "x"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_redacted_masks_keys() {
        let mut config = AppConfig::default();
        config.speech.api_key = "secret".to_string();
        let view = config.redacted();
        assert_eq!(view.speech.api_key, REDACTED);
        // Empty keys stay empty so the client can tell they are missing
        assert_eq!(view.openai.api_key, "");
    }

    #[test]
    fn test_session_settings_follow_config() {
        let mut config = AppConfig::default();
        config.speech.api_key = "key".to_string();
        config.speech.private_endpoint = Some("  ".to_string());
        config.session.microphone_grace_ms = 0;

        let settings = config.session_settings();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.transport.private_endpoint, None);
        assert_eq!(settings.timing.microphone_grace, Duration::ZERO);
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
        assert_eq!(settings.transport.tts_voice, "en-US-AvaMultilingualNeural");
    }

    #[test]
    fn test_missing_key_fails_at_session_start_only() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.session_settings().validate().is_err());
    }
}
