//! # Request Telemetry Middleware
//!
//! Logs every request and records it in [`AppMetrics`](crate::state::AppMetrics).
//!
//! ## How Actix middleware works:
//! 1. `Transform` is the factory; Actix calls `new_transform` once per worker
//! 2. The returned service wraps the next one in the chain
//! 3. `call` runs for each request and returns a future resolving to the response
//!
//! Endpoints are keyed by their route pattern (`/api/v1/session/{...}` style)
//! so per-endpoint metrics do not grow with distinct URLs.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};

pub struct RequestTelemetry;

impl<S, B> Transform<S, ServiceRequest> for RequestTelemetry
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestTelemetryService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestTelemetryService { service }))
    }
}

pub struct RequestTelemetryService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestTelemetryService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let endpoint = format!(
            "{} {}",
            method,
            req.match_pattern().unwrap_or_else(|| path.clone())
        );
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let state = req.app_data::<web::Data<AppState>>().cloned();

        debug!(method = %method, path = %path, remote_addr = %remote_addr, "Request started");

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        warn!(method = %method, path = %path, status = status.as_u16(), duration_ms, "Request completed with server error");
                    } else {
                        info!(method = %method, path = %path, status = status.as_u16(), duration_ms, "Request completed");
                    }
                    status.is_client_error() || status.is_server_error()
                }
                Err(err) => {
                    error!(method = %method, path = %path, duration_ms, error = %err, "Request failed");
                    true
                }
            };

            if let Some(state) = state {
                state.record_request(&endpoint, duration_ms, is_error);
            }

            result
        })
    }
}
