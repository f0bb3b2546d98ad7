//! # Health and Metrics Endpoints
//!
//! - `GET /api/v1/health`: is the service up, is the orchestrator running,
//!   is a browser client attached, and what state is the session in
//! - `GET /api/v1/metrics`: request counters per endpoint plus queue and
//!   reconnect figures from the latest session snapshot

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let snapshot = state.session.snapshot();
    let orchestrator_running = state.session.is_running();

    // Without the orchestrator nothing works; a missing browser only blocks media.
    let status = if !orchestrator_running {
        "unhealthy"
    } else if !state.bridge.is_attached() {
        "degraded"
    } else {
        "healthy"
    };

    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "orchestrator_running": orchestrator_running,
            "client_attached": state.bridge.is_attached(),
            "session_id": snapshot.session_id,
            "state": snapshot.state,
            "transport_attached": snapshot.transport_attached,
            "reconnect_in_progress": snapshot.reconnect_in_progress,
            "credentials_configured": !config.speech.api_key.trim().is_empty()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "memory": get_memory_info()
    });

    if orchestrator_running {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let snapshot = state.session.snapshot();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "session": {
            "state": snapshot.state,
            "queue_length": snapshot.queue_len(),
            "speaking": snapshot.speaking.as_ref().map(|u| u.sequence),
            "history_length": snapshot.history_len,
            "listening": snapshot.microphone.listening
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

/// Process memory from `/proc/self/status` (Linux only).
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_session_state() {
        let (state, _harness) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request())
                .await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["session"]["state"], "idle");
        assert_eq!(body["session"]["credentials_configured"], false);
    }

    #[actix_web::test]
    async fn test_metrics_include_queue() {
        let (state, _harness) = test_state();
        state.record_request("GET /api/v1/session", 4, false);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request())
                .await;
        assert_eq!(body["overall"]["total_requests"], 1);
        assert_eq!(body["session"]["queue_length"], 0);
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /api/v1/session");
    }
}
