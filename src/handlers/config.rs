//! Runtime configuration endpoints.
//!
//! API keys are never echoed back. Changes apply to the next session and to
//! the next chat completion; a running session keeps the settings it was
//! started with.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/config`
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// `PUT /api/v1/config` with a partial document, e.g.
/// `{"session": {"idle_fallback": true}}`.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let updated = state
        .update_config(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    info!("Configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_update_then_read_redacted() {
        let (state, _harness) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let request = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"speech": {"api_key": "secret", "region": "eastus"}}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.get_config().speech.api_key, "secret");

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request())
                .await;
        assert_eq!(body["config"]["speech"]["region"], "eastus");
        assert_ne!(body["config"]["speech"]["api_key"], "secret");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let (state, _harness) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let request = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"session": {"reconnect_max_attempts": 0}}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().session.reconnect_max_attempts, 12);
    }
}
