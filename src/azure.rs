//! # Azure Service Clients
//!
//! Outbound HTTP calls made by the server itself:
//! - **RelayTokenClient**: fetches ICE relay credentials for the avatar connection
//! - **AzureOpenAiClient**: answers user turns through Azure OpenAI chat completions
//!
//! Both use one shared `reqwest::Client`. Failures are mapped onto the
//! session error kinds the orchestrator understands (Transport, Query).

use crate::config::{AppConfig, OpenAiConfig};
use crate::session::collaborators::QueryService;
use crate::session::error::{SessionError, SessionResult};
use crate::session::model::ChatMessage;
use crate::session::settings::TransportSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared HTTP client with the service-wide timeout.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// ICE server credentials handed to the browser for the avatar connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Deserialize)]
struct RelayTokenResponse {
    #[serde(rename = "Urls")]
    urls: Vec<String>,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Password")]
    password: String,
}

impl From<RelayTokenResponse> for IceCredentials {
    fn from(token: RelayTokenResponse) -> Self {
        Self {
            urls: token.urls,
            username: token.username,
            credential: token.password,
        }
    }
}

#[derive(Clone)]
pub struct RelayTokenClient {
    client: reqwest::Client,
}

impl RelayTokenClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Relay token endpoint for a speech resource. A private endpoint, when
    /// set, replaces the regional host.
    pub fn token_url(settings: &TransportSettings) -> String {
        match settings.private_endpoint.as_deref() {
            Some(endpoint) => format!(
                "https://{}/tts/cognitiveservices/avatar/relay/token/v1",
                endpoint.trim_end_matches('/')
            ),
            None => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1",
                settings.region
            ),
        }
    }

    pub async fn fetch(&self, settings: &TransportSettings) -> SessionResult<IceCredentials> {
        let url = Self::token_url(settings);
        debug!(url = %url, "Requesting avatar relay token");

        let response = self
            .client
            .get(&url)
            .header("Ocp-Apim-Subscription-Key", &settings.api_key)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("relay token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Relay token request rejected");
            return Err(SessionError::Transport(format!(
                "relay token request returned {}: {}",
                status, body
            )));
        }

        let token: RelayTokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Transport(format!("relay token response invalid: {}", e)))?;
        if token.urls.is_empty() {
            return Err(SessionError::Transport(
                "relay token response has no ICE urls".to_string(),
            ));
        }
        Ok(token.into())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: Vec<&'a ChatMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Azure OpenAI chat completions as the session's [`QueryService`].
///
/// Reads the `openai` config section on every call, so `PUT /config`
/// changes take effect on the next turn.
pub struct AzureOpenAiClient {
    client: reqwest::Client,
    config: Arc<RwLock<AppConfig>>,
}

impl AzureOpenAiClient {
    pub fn new(client: reqwest::Client, config: Arc<RwLock<AppConfig>>) -> Self {
        Self { client, config }
    }

    fn openai_config(&self) -> OpenAiConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .openai
            .clone()
    }

    pub fn completions_url(config: &OpenAiConfig) -> SessionResult<String> {
        let endpoint = config.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() || config.deployment.trim().is_empty() {
            return Err(SessionError::Configuration(
                "Azure OpenAI endpoint and deployment are required".to_string(),
            ));
        }
        Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint,
            config.deployment.trim(),
            config.api_version
        ))
    }
}

fn parse_reply(response: ChatResponse) -> SessionResult<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| SessionError::Query("chat completion returned no content".to_string()))
}

#[async_trait]
impl QueryService for AzureOpenAiClient {
    async fn submit(&self, user_text: &str, history: &[ChatMessage]) -> SessionResult<String> {
        let config = self.openai_config();
        let url = Self::completions_url(&config)?;
        if config.api_key.trim().is_empty() {
            return Err(SessionError::Configuration(
                "Azure OpenAI API key is missing".to_string(),
            ));
        }

        let turn = ChatMessage::user(user_text);
        let body = ChatRequest {
            messages: history.iter().chain(std::iter::once(&turn)).collect(),
        };
        debug!(messages = body.messages.len(), deployment = %config.deployment, "Submitting chat completion");

        let response = self
            .client
            .post(&url)
            .header("api-key", config.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Query(format!("chat completion request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Query(format!(
                "chat completion returned {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Query(format!("chat completion response invalid: {}", e)))?;
        parse_reply(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(region: &str, endpoint: Option<&str>) -> TransportSettings {
        TransportSettings {
            region: region.to_string(),
            private_endpoint: endpoint.map(str::to_string),
            ..TransportSettings::default()
        }
    }

    #[test]
    fn test_token_url_uses_region_or_private_endpoint() {
        assert_eq!(
            RelayTokenClient::token_url(&transport("westus2", None)),
            "https://westus2.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1"
        );
        assert_eq!(
            RelayTokenClient::token_url(&transport("", Some("my-speech.cognitiveservices.azure.com/"))),
            "https://my-speech.cognitiveservices.azure.com/tts/cognitiveservices/avatar/relay/token/v1"
        );
    }

    #[test]
    fn test_relay_token_maps_to_ice_credentials() {
        let json = r#"{"Urls": ["turn:relay.communication.microsoft.com:3478"], "Username": "user", "Password": "pass"}"#;
        let token: RelayTokenResponse = serde_json::from_str(json).unwrap();
        let ice = IceCredentials::from(token);
        assert_eq!(ice.urls.len(), 1);
        assert_eq!(ice.username, "user");
        assert_eq!(ice.credential, "pass");
    }

    #[test]
    fn test_completions_url() {
        let config = OpenAiConfig {
            endpoint: "https://res.openai.azure.com/".to_string(),
            deployment: "gpt-4o".to_string(),
            ..OpenAiConfig::default()
        };
        assert_eq!(
            AzureOpenAiClient::completions_url(&config).unwrap(),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );

        let missing = OpenAiConfig::default();
        assert!(matches!(
            AzureOpenAiClient::completions_url(&missing),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_reply_takes_first_choice() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": " Hello there. "}}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parse_reply(response).unwrap(), "Hello there.");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(parse_reply(empty), Err(SessionError::Query(_))));
    }

    #[test]
    fn test_request_body_appends_user_turn() {
        let history = vec![ChatMessage::system("Be brief.")];
        let turn = ChatMessage::user("hi");
        let body = ChatRequest {
            messages: history.iter().chain(std::iter::once(&turn)).collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn test_submit_without_endpoint_is_configuration_error() {
        let client = AzureOpenAiClient::new(http_client(), Arc::new(RwLock::new(AppConfig::default())));
        let result = client.submit("hello", &[]).await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }
}
