use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatch::{self, Dispatcher, InFlight};
use crate::store::postgres::PgStore;
use crate::store::{CredentialBackend, HistoryBackend};
use crate::vault::CredentialStore;

pub mod analytics;
pub mod auth;
pub mod handlers;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub dispatcher: Dispatcher,
    pub history: Arc<dyn HistoryBackend>,
    pub inflight: InFlight,
    pub verifier: auth::TokenVerifier,
    /// Set when running against Postgres; checked by `/readyz`.
    pub db: Option<PgStore>,
}

impl AppState {
    /// Wire the services together once at startup.
    pub fn build(
        config: Config,
        credential_backend: Arc<dyn CredentialBackend>,
        history: Arc<dyn HistoryBackend>,
        db: Option<PgStore>,
    ) -> anyhow::Result<Self> {
        let verifier = auth::TokenVerifier::new(config.jwt_secret()?, config.jwt_audience.as_deref());
        let (credentials, dispatcher) = dispatch::build_services(&config, credential_backend)?;

        Ok(Self {
            config,
            credentials,
            dispatcher,
            history,
            inflight: InFlight::new(),
            verifier,
            db,
        })
    }
}

/// Build the API router.
/// All routes are relative; `router` mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/frameworks", get(handlers::list_frameworks))
        .route("/frameworks/:id", get(handlers::get_framework))
        .route("/frameworks/:id/preview", get(handlers::preview_framework))
        .route("/credentials", get(handlers::list_credentials))
        .route("/credentials/status", get(handlers::credential_status))
        .route(
            "/credentials/:provider",
            put(handlers::save_credential).delete(handlers::delete_credential),
        )
        .route(
            "/credentials/:provider/activate",
            post(handlers::activate_credential),
        )
        .route(
            "/credentials/:provider/validate",
            post(handlers::validate_credential),
        )
        .route("/generate", post(handlers::generate))
        .route("/generate/cancel", post(handlers::cancel_generation))
        .route("/history", get(handlers::list_history))
        .route("/analytics/summary", get(analytics::get_summary))
        .layer(middleware::from_fn_with_state(state, auth::require_user))
        .fallback(fallback_404)
}

/// The full HTTP app: health probes, the authenticated API, and the
/// cross-cutting layers.
pub fn router(state: Arc<AppState>) -> Router {
    let dashboard_origin = state.config.dashboard_origin.clone();

    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == dashboard_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                // AllowHeaders::any() cannot be combined with credentials.
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    if let Some(db) = &state.db {
        db.ping().await.map_err(|e| {
            tracing::error!("readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    }
    Ok("ok")
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers on every response. API responses carry
/// key metadata, so nothing is cached.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove("server");

    resp
}
