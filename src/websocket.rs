//! # Session WebSocket
//!
//! The browser client connects to `/api/v1/ws/session`. The connection does
//! two jobs:
//! 1. **Bridge**: it carries [`BridgeCommand`]s to the browser and the
//!    browser's acks and media/recognition events back (see [`crate::bridge`])
//! 2. **Live view**: it pushes every session notice and each new snapshot
//!
//! ## Message Format:
//! - **Client → Server**: JSON [`ClientMessage`]
//! - **Server → Client**: JSON, either a bridge command (`connect_avatar`,
//!   `speak`...) or a [`ServerEvent`] (`notice`, `snapshot`, `error`)
//!
//! Only one browser is attached at a time; a new connection replaces the old
//! one, whose command stream then ends and closes it.

use crate::bridge::{BridgeCommand, ClientBridge, ClientMessage};
use crate::session::{SessionController, SessionNotice, SessionSnapshot};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream, WatchStream};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-originated messages that are not bridge commands.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Notice { notice: SessionNotice },
    Snapshot { snapshot: SessionSnapshot },
    Error { code: String, message: String },
}

pub struct SessionSocket {
    bridge: ClientBridge,
    controller: SessionController,
    client_id: Option<u64>,
    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(bridge: ClientBridge, controller: SessionController) -> Self {
        Self {
            bridge,
            controller,
            client_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json<T: Serialize>(ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize outbound message"),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        Self::send_json(
            ctx,
            &ServerEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (client_id, commands) = self.bridge.attach();
        self.client_id = Some(client_id);
        info!(client_id, "Session WebSocket started");

        ctx.add_stream(UnboundedReceiverStream::new(commands));
        ctx.add_stream(BroadcastStream::new(self.controller.subscribe()));
        ctx.add_stream(WatchStream::new(self.controller.watch()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = ?act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(client_id) = self.client_id.take() {
            self.bridge.detach(client_id);
            info!(client_id, "Session WebSocket stopped");
        }
    }
}

/// Frames from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let Some(client_id) = self.client_id else {
                    return;
                };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.bridge.handle_message(client_id, message),
                    Err(err) => {
                        debug!(error = %err, "Invalid client message");
                        Self::send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send_error(ctx, "unsupported", "binary frames are not supported");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Commands the bridge wants delivered. The stream ends when another client
/// replaces this one.
impl StreamHandler<BridgeCommand> for SessionSocket {
    fn handle(&mut self, command: BridgeCommand, ctx: &mut Self::Context) {
        Self::send_json(ctx, &command);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        info!(client_id = ?self.client_id, "Replaced by another browser client");
        self.client_id = None;
        ctx.stop();
    }
}

impl StreamHandler<Result<SessionNotice, BroadcastStreamRecvError>> for SessionSocket {
    fn handle(
        &mut self,
        notice: Result<SessionNotice, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        match notice {
            Ok(notice) => Self::send_json(ctx, &ServerEvent::Notice { notice }),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "WebSocket fell behind on session notices");
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Session notice stream ended");
    }
}

impl StreamHandler<SessionSnapshot> for SessionSocket {
    fn handle(&mut self, snapshot: SessionSnapshot, ctx: &mut Self::Context) {
        Self::send_json(ctx, &ServerEvent::Snapshot { snapshot });
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Session snapshot stream ended");
    }
}

/// `GET /api/v1/ws/session`: upgrade to the session WebSocket.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New session WebSocket request");

    let socket = SessionSocket::new(app_state.bridge.clone(), app_state.session.clone());
    ws::start(socket, &req, stream)
}
