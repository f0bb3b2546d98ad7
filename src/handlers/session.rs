//! Session control endpoints.
//!
//! Thin wrappers over [`SessionController`](crate::session::SessionController):
//! each handler forwards one operation to the orchestrator and answers with
//! the outcome. Session errors become HTTP errors through `From<SessionError>`.

use crate::session::ModeUpdate;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct TypedMessage {
    pub text: String,
}

/// `GET /api/v1/session`
pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.session.snapshot())
}

/// `POST /api/v1/session/start`
///
/// Settings come from the current configuration. Missing credentials answer
/// 400 and leave the session where it was.
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let settings = state.session_settings();
    let session_id = state.session.start_session(settings).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "session_id": session_id,
        "state": state.session.snapshot().state
    })))
}

/// `POST /api/v1/session/stop`. Returns once everything is released.
pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.stop_session().await?;
    Ok(HttpResponse::Ok().json(state.session.snapshot()))
}

/// `POST /api/v1/session/interrupt`
pub async fn interrupt_speech(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let aborted = state.session.interrupt_speech().await?;
    Ok(HttpResponse::Ok().json(json!({ "aborted": aborted })))
}

/// `POST /api/v1/session/messages`
pub async fn submit_message(
    state: web::Data<AppState>,
    body: web::Json<TypedMessage>,
) -> Result<HttpResponse, AppError> {
    state.session.submit_typed_message(body.into_inner().text).await?;
    Ok(HttpResponse::Accepted().json(json!({ "status": "accepted" })))
}

/// `POST /api/v1/session/microphone/start`
pub async fn start_microphone(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.start_microphone().await?;
    Ok(HttpResponse::Ok().json(state.session.snapshot().microphone))
}

/// `POST /api/v1/session/microphone/stop`
pub async fn stop_microphone(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.stop_microphone().await?;
    Ok(HttpResponse::Ok().json(state.session.snapshot().microphone))
}

/// `PUT /api/v1/session/mode` with any subset of the flags; absent ones keep
/// their current value.
pub async fn set_mode(
    state: web::Data<AppState>,
    body: web::Json<ModeUpdate>,
) -> Result<HttpResponse, AppError> {
    let modes = state.session.update_modes(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "modes": modes })))
}

/// `DELETE /api/v1/session/history`
pub async fn clear_history(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.clear_history().await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Routes under `/session`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/session")
            .route("", web::get().to(get_session))
            .route("/start", web::post().to(start_session))
            .route("/stop", web::post().to(stop_session))
            .route("/interrupt", web::post().to(interrupt_speech))
            .route("/messages", web::post().to(submit_message))
            .route("/microphone/start", web::post().to(start_microphone))
            .route("/microphone/stop", web::post().to(stop_microphone))
            .route("/mode", web::put().to(set_mode))
            .route("/history", web::delete().to(clear_history)),
    );
}
