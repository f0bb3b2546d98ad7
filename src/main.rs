//! # Avatar Session Backend
//!
//! Orchestrates real-time sessions with a streaming talking avatar: speech
//! recognition, an Azure OpenAI chat deployment, queued speech synthesis, and
//! automatic recovery of the avatar connection.
//!
//! ## Application Architecture:
//! - **session**: the session orchestrator and its collaborator contracts
//! - **bridge**: collaborator adapters talking to the browser over WebSocket
//! - **azure**: relay-token and chat-completion clients
//! - **config**: configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics
//! - **handlers**: HTTP handlers for session control and configuration
//! - **websocket**: the browser WebSocket endpoint
//! - **error**: HTTP error responses

mod azure;
mod bridge;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use azure::{AzureOpenAiClient, RelayTokenClient};
use bridge::{AvatarNegotiator, ClientBridge};
use crate::config::AppConfig;
use session::{Collaborators, SessionOrchestrator};
use state::AppState;
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting avatar-session-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.speech.api_key.trim().is_empty() {
        info!("No speech API key configured; sessions cannot start until one is set");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let settings = config.session_settings();
    let modes = config.mode_flags();
    let config = Arc::new(RwLock::new(config));

    // Wire the orchestrator to the browser bridge and the Azure clients
    let http = azure::http_client();
    let bridge = ClientBridge::new(config.clone());
    let collaborators = Collaborators {
        transport: Arc::new(AvatarNegotiator::new(
            bridge.clone(),
            RelayTokenClient::new(http.clone()),
        )),
        recognizer: Arc::new(bridge.clone()),
        synthesis: Arc::new(bridge.clone()),
        query: Arc::new(AzureOpenAiClient::new(http, config.clone())),
    };
    let (orchestrator, controller) = SessionOrchestrator::new(collaborators, settings, modes);
    tokio::spawn(orchestrator.run());

    let app_state = AppState::new(config, controller.clone(), bridge);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::RequestTelemetry)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/ws/session", web::get().to(websocket::session_websocket))
                    .configure(handlers::session::configure),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the avatar connection and recognizer before exiting
    if let Err(e) = controller.stop_session().await {
        error!("Failed to stop session: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatar_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
