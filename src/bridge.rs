//! # Browser Bridge
//!
//! Media stays in the browser: the avatar video, the microphone and the
//! speaker all live in the attached web client. The types in this module
//! implement the orchestrator's collaborator contracts by sending commands to
//! that client over the `/ws/session` WebSocket and routing its replies and
//! events back.
//!
//! ## Protocol:
//! - server → client: [`BridgeCommand`], each with a `request_id`
//! - client → server: [`ClientMessage`], either an `ack` for a request or an
//!   event (media started, turn end, partial transcript...)
//!
//! `speak` is acknowledged when the avatar finishes speaking, so it has no
//! timeout. Every other command must be acknowledged within
//! `bridge.command_timeout_ms`.
//!
//! One client is attached at a time. When it goes away every outstanding
//! request fails and the live avatar connection is reported as ended.

use crate::azure::{IceCredentials, RelayTokenClient};
use crate::config::AppConfig;
use crate::session::collaborators::{
    RecognitionEvent, RecognitionEvents, Recognizer, RecognizerHandle, RecognizerService,
    SynthesisService, TransportEvent, TransportEvents, TransportHandle, TransportNegotiator,
};
use crate::session::error::{SessionError, SessionResult};
use crate::session::settings::TransportSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Speech service credentials the browser SDK connects with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechAuth {
    pub region: String,
    pub api_key: String,
    /// Full WebSocket URL when a private endpoint replaces the region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvatarSpec {
    pub character: String,
    pub style: String,
    pub customized: bool,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_voice_endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_voice_speaker_profile_id: Option<String>,
}

/// Commands sent to the attached browser client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    ConnectAvatar {
        request_id: u64,
        handle_id: u64,
        ice: IceCredentials,
        speech: SpeechAuth,
        avatar: AvatarSpec,
    },
    ReleaseAvatar {
        request_id: u64,
        handle_id: u64,
    },
    CreateRecognizer {
        request_id: u64,
        recognizer_id: u64,
        locales: Vec<String>,
        speech: SpeechAuth,
    },
    StartRecognition {
        request_id: u64,
        recognizer_id: u64,
    },
    StopRecognition {
        request_id: u64,
        recognizer_id: u64,
    },
    CloseRecognizer {
        request_id: u64,
        recognizer_id: u64,
    },
    Speak {
        request_id: u64,
        text: String,
    },
    StopSpeaking {
        request_id: u64,
    },
}

/// Messages received from the browser client.
///
/// Transport events may name the avatar connection they belong to; events
/// for a connection that is no longer live are dropped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ack {
        request_id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    MediaStarted {
        #[serde(default)]
        handle_id: Option<u64>,
    },
    TrackCount {
        #[serde(default)]
        handle_id: Option<u64>,
        count: usize,
    },
    TurnStart {
        #[serde(default)]
        handle_id: Option<u64>,
    },
    TurnEnd {
        #[serde(default)]
        handle_id: Option<u64>,
    },
    TransportEnded {
        #[serde(default)]
        handle_id: Option<u64>,
        #[serde(default)]
        reason: Option<String>,
    },
    RecognitionPartial {
        text: String,
    },
    RecognitionFinal {
        text: String,
    },
    RecognitionCanceled {
        #[serde(default)]
        reason: Option<String>,
    },
}

type AckSender = oneshot::Sender<Result<(), String>>;

struct AttachedClient {
    id: u64,
    outbound: mpsc::UnboundedSender<BridgeCommand>,
}

struct LiveTransport {
    handle_id: u64,
    events: TransportEvents,
    tracks: Arc<AtomicUsize>,
}

struct LiveRecognizer {
    recognizer_id: u64,
    events: RecognitionEvents,
}

#[derive(Default)]
struct BridgeInner {
    client: Option<AttachedClient>,
    pending: HashMap<u64, AckSender>,
    transport: Option<LiveTransport>,
    recognizer: Option<LiveRecognizer>,
    next_id: u64,
}

impl BridgeInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Fail every outstanding request and report the live connection as ended.
    fn drop_client(&mut self, reason: &str) {
        self.client = None;
        for (_, ack) in self.pending.drain() {
            let _ = ack.send(Err(reason.to_string()));
        }
        if let Some(transport) = self.transport.take() {
            transport.tracks.store(0, Ordering::SeqCst);
            transport.events.emit(TransportEvent::Ended {
                reason: Some(reason.to_string()),
            });
        }
    }

    fn live_transport(&self, handle_id: Option<u64>) -> Option<&LiveTransport> {
        self.transport
            .as_ref()
            .filter(|t| handle_id.map_or(true, |id| id == t.handle_id))
    }
}

/// Shared connection to the attached browser client. Cheap to clone.
#[derive(Clone)]
pub struct ClientBridge {
    inner: Arc<Mutex<BridgeInner>>,
    config: Arc<RwLock<AppConfig>>,
}

impl ClientBridge {
    pub fn new(config: Arc<RwLock<AppConfig>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BridgeInner::default())),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn command_timeout(&self) -> Duration {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .command_timeout()
    }

    fn speech_auth(&self) -> SpeechAuth {
        let config = self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        speech_auth(
            &config.speech.region,
            &config.speech.api_key,
            config.speech.private_endpoint.as_deref(),
        )
    }

    /// Attach a client, replacing any previous one.
    ///
    /// Returns the client id to pass to [`detach`](Self::detach) and
    /// [`handle_message`](Self::handle_message), plus the stream of commands
    /// to forward to it.
    pub fn attach(&self) -> (u64, mpsc::UnboundedReceiver<BridgeCommand>) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if inner.client.is_some() {
            warn!("Replacing attached browser client");
            inner.drop_client("browser client replaced");
        }
        let id = inner.next_id();
        inner.client = Some(AttachedClient { id, outbound });
        info!(client_id = id, "Browser client attached");
        (id, commands)
    }

    /// Detach `client_id` if it is still the attached client.
    pub fn detach(&self, client_id: u64) {
        let mut inner = self.lock();
        if inner.client.as_ref().is_some_and(|c| c.id == client_id) {
            inner.drop_client("browser client detached");
            info!(client_id, "Browser client detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().client.is_some()
    }

    /// Route a message from `client_id`. Messages from a replaced client are ignored.
    pub fn handle_message(&self, client_id: u64, message: ClientMessage) {
        let mut inner = self.lock();
        if !inner.client.as_ref().is_some_and(|c| c.id == client_id) {
            debug!(client_id, "Ignoring message from stale client");
            return;
        }

        match message {
            ClientMessage::Ack {
                request_id,
                ok,
                error,
            } => {
                let Some(ack) = inner.pending.remove(&request_id) else {
                    debug!(request_id, "Ack for unknown request");
                    return;
                };
                let result = if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "request failed".to_string()))
                };
                let _ = ack.send(result);
            }
            ClientMessage::MediaStarted { handle_id } => {
                if let Some(transport) = inner.live_transport(handle_id) {
                    transport.events.emit(TransportEvent::Started);
                }
            }
            ClientMessage::TrackCount { handle_id, count } => {
                if let Some(transport) = inner.live_transport(handle_id) {
                    transport.tracks.store(count, Ordering::SeqCst);
                }
            }
            ClientMessage::TurnStart { handle_id } => {
                if let Some(transport) = inner.live_transport(handle_id) {
                    transport.events.emit(TransportEvent::TurnStart);
                }
            }
            ClientMessage::TurnEnd { handle_id } => {
                if let Some(transport) = inner.live_transport(handle_id) {
                    transport.events.emit(TransportEvent::TurnEnd);
                }
            }
            ClientMessage::TransportEnded { handle_id, reason } => {
                if let Some(transport) = inner.live_transport(handle_id) {
                    transport.tracks.store(0, Ordering::SeqCst);
                    transport.events.emit(TransportEvent::Ended { reason });
                }
            }
            ClientMessage::RecognitionPartial { text } => {
                if let Some(recognizer) = &inner.recognizer {
                    recognizer.events.emit(RecognitionEvent::Partial(text));
                }
            }
            ClientMessage::RecognitionFinal { text } => {
                if let Some(recognizer) = &inner.recognizer {
                    recognizer.events.emit(RecognitionEvent::Final(text));
                }
            }
            ClientMessage::RecognitionCanceled { reason } => {
                if let Some(recognizer) = &inner.recognizer {
                    let reason = reason.unwrap_or_else(|| "recognition canceled".to_string());
                    recognizer.events.emit(RecognitionEvent::Canceled(reason));
                }
            }
        }
    }

    /// Send a command and wait for its ack.
    ///
    /// `error` builds the session error kind for whichever collaborator is
    /// asking. `timeout` of `None` waits as long as the client stays attached.
    async fn request(
        &self,
        command: impl FnOnce(u64) -> BridgeCommand,
        timeout: Option<Duration>,
        error: fn(String) -> SessionError,
    ) -> SessionResult<()> {
        let (request_id, response) = {
            let mut inner = self.lock();
            let Some(outbound) = inner.client.as_ref().map(|c| c.outbound.clone()) else {
                return Err(error("no browser client attached".to_string()));
            };
            let request_id = inner.next_id();
            let (ack, response) = oneshot::channel();
            inner.pending.insert(request_id, ack);
            if outbound.send(command(request_id)).is_err() {
                inner.pending.remove(&request_id);
                return Err(error("browser client is gone".to_string()));
            }
            (request_id, response)
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.lock().pending.remove(&request_id);
                    return Err(error(format!(
                        "browser client did not answer within {} ms",
                        limit.as_millis()
                    )));
                }
            },
            None => response.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(error(message)),
            Err(_) => Err(error("browser client is gone".to_string())),
        }
    }

    async fn release_transport(&self, handle_id: u64) {
        {
            let mut inner = self.lock();
            if inner
                .transport
                .as_ref()
                .is_some_and(|t| t.handle_id == handle_id)
            {
                inner.transport = None;
            }
        }
        let result = self
            .request(
                |request_id| BridgeCommand::ReleaseAvatar {
                    request_id,
                    handle_id,
                },
                Some(self.command_timeout()),
                SessionError::Transport,
            )
            .await;
        if let Err(e) = result {
            debug!(handle_id, error = %e, "Avatar release not acknowledged");
        }
    }
}

fn speech_auth(region: &str, api_key: &str, private_endpoint: Option<&str>) -> SpeechAuth {
    SpeechAuth {
        region: region.to_string(),
        api_key: api_key.to_string(),
        endpoint: private_endpoint.map(|endpoint| {
            format!(
                "wss://{}/tts/cognitiveservices/websocket/v1?enableTalkingAvatar=true",
                endpoint.trim_end_matches('/')
            )
        }),
    }
}

/// One avatar connection living in the browser.
pub struct BridgeTransport {
    bridge: ClientBridge,
    handle_id: u64,
    tracks: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportHandle for BridgeTransport {
    fn describe(&self) -> String {
        format!("avatar-{}", self.handle_id)
    }

    fn rendered_tracks(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.bridge.release_transport(self.handle_id).await;
    }
}

/// Opens avatar connections: relay token from Azure, then `connect_avatar`
/// on the browser.
pub struct AvatarNegotiator {
    bridge: ClientBridge,
    relay: RelayTokenClient,
}

impl AvatarNegotiator {
    pub fn new(bridge: ClientBridge, relay: RelayTokenClient) -> Self {
        Self { bridge, relay }
    }
}

#[async_trait]
impl TransportNegotiator for AvatarNegotiator {
    async fn request_transport(
        &self,
        settings: &TransportSettings,
        events: TransportEvents,
    ) -> SessionResult<Box<dyn TransportHandle>> {
        if !self.bridge.is_attached() {
            return Err(SessionError::Transport(
                "no browser client attached".to_string(),
            ));
        }
        let ice = self.relay.fetch(settings).await?;

        let tracks = Arc::new(AtomicUsize::new(0));
        let handle_id = {
            let mut inner = self.bridge.lock();
            let handle_id = inner.next_id();
            inner.transport = Some(LiveTransport {
                handle_id,
                events,
                tracks: tracks.clone(),
            });
            handle_id
        };

        let speech = speech_auth(
            &settings.region,
            &settings.api_key,
            settings.private_endpoint.as_deref(),
        );
        let avatar = AvatarSpec {
            character: settings.avatar_character.clone(),
            style: settings.avatar_style.clone(),
            customized: settings.customized_avatar,
            voice: settings.tts_voice.clone(),
            custom_voice_endpoint_id: settings.custom_voice_endpoint_id.clone(),
            personal_voice_speaker_profile_id: settings.personal_voice_speaker_profile_id.clone(),
        };

        let result = self
            .bridge
            .request(
                |request_id| BridgeCommand::ConnectAvatar {
                    request_id,
                    handle_id,
                    ice,
                    speech,
                    avatar,
                },
                Some(self.bridge.command_timeout()),
                SessionError::Transport,
            )
            .await;

        match result {
            Ok(()) => {
                info!(handle_id, "Avatar connection established");
                Ok(Box::new(BridgeTransport {
                    bridge: self.bridge.clone(),
                    handle_id,
                    tracks,
                }))
            }
            Err(e) => {
                let mut inner = self.bridge.lock();
                if inner
                    .transport
                    .as_ref()
                    .is_some_and(|t| t.handle_id == handle_id)
                {
                    inner.transport = None;
                }
                Err(e)
            }
        }
    }
}

/// A speech recognizer running in the browser.
pub struct BridgeRecognizer {
    bridge: ClientBridge,
    recognizer_id: u64,
}

#[async_trait]
impl Recognizer for BridgeRecognizer {
    async fn start(&self) -> SessionResult<()> {
        let recognizer_id = self.recognizer_id;
        self.bridge
            .request(
                |request_id| BridgeCommand::StartRecognition {
                    request_id,
                    recognizer_id,
                },
                Some(self.bridge.command_timeout()),
                SessionError::Recognition,
            )
            .await
    }

    async fn stop(&self) -> SessionResult<()> {
        let recognizer_id = self.recognizer_id;
        self.bridge
            .request(
                |request_id| BridgeCommand::StopRecognition {
                    request_id,
                    recognizer_id,
                },
                Some(self.bridge.command_timeout()),
                SessionError::Recognition,
            )
            .await
    }

    async fn close(&self) {
        let recognizer_id = self.recognizer_id;
        {
            let mut inner = self.bridge.lock();
            if inner
                .recognizer
                .as_ref()
                .is_some_and(|r| r.recognizer_id == recognizer_id)
            {
                inner.recognizer = None;
            }
        }
        let result = self
            .bridge
            .request(
                |request_id| BridgeCommand::CloseRecognizer {
                    request_id,
                    recognizer_id,
                },
                Some(self.bridge.command_timeout()),
                SessionError::Recognition,
            )
            .await;
        if let Err(e) = result {
            debug!(recognizer_id, error = %e, "Recognizer close not acknowledged");
        }
    }
}

#[async_trait]
impl RecognizerService for ClientBridge {
    async fn create_recognizer(
        &self,
        locales: &[String],
        events: RecognitionEvents,
    ) -> SessionResult<RecognizerHandle> {
        let recognizer_id = {
            let mut inner = self.lock();
            let recognizer_id = inner.next_id();
            inner.recognizer = Some(LiveRecognizer {
                recognizer_id,
                events,
            });
            recognizer_id
        };

        let locales = locales.to_vec();
        let speech = self.speech_auth();
        self.request(
            |request_id| BridgeCommand::CreateRecognizer {
                request_id,
                recognizer_id,
                locales,
                speech,
            },
            Some(self.command_timeout()),
            SessionError::Recognition,
        )
        .await?;

        Ok(Arc::new(BridgeRecognizer {
            bridge: self.clone(),
            recognizer_id,
        }))
    }
}

#[async_trait]
impl SynthesisService for ClientBridge {
    async fn speak(&self, text: &str) -> SessionResult<()> {
        let text = text.to_string();
        self.request(
            |request_id| BridgeCommand::Speak { request_id, text },
            None,
            SessionError::Synthesis,
        )
        .await
    }

    async fn stop_speaking(&self) -> SessionResult<()> {
        self.request(
            |request_id| BridgeCommand::StopSpeaking { request_id },
            Some(self.command_timeout()),
            SessionError::Synthesis,
        )
        .await
    }
}
