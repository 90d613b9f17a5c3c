//! HTTP boundary for the gateway.
//!
//! Thin glue over the core: JSON SDP exchange for calls, multipart upload
//! for clip playback, a bulk abort, and a device-reachability health
//! probe. Browsers on the LAN talk to this directly, so responses carry
//! permissive CORS headers.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Notify;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::call::CallController;
use crate::config::Config;
use crate::device::DeviceClient;
use crate::error::Error;
use crate::ops::OperationRegistry;
use crate::playfile;
use crate::session::{DeviceSessionManager, SessionManager};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub client: Arc<DeviceClient>,
    pub sessions: Arc<dyn SessionManager>,
    pub registry: Arc<OperationRegistry>,
    pub calls: CallController,
}

impl AppState {
    pub fn from_config(cfg: &Config) -> crate::error::Result<Arc<Self>> {
        let client = Arc::new(DeviceClient::new(
            &cfg.device_host,
            &cfg.device_username,
            &cfg.device_password,
        )?);
        let sessions: Arc<dyn SessionManager> =
            Arc::new(DeviceSessionManager::new(client.clone()));
        let registry = Arc::new(OperationRegistry::new(sessions.clone()));
        let calls = CallController::new(
            cfg.webrtc.clone(),
            client.clone(),
            sessions.clone(),
            registry.clone(),
        );
        Ok(Arc::new(AppState {
            client,
            sessions,
            registry,
            calls,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/webrtc/offer", post(webrtc_offer))
        .route("/api/audio/play-file", post(play_file))
        .route("/api/abort", post(abort))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(axum::middleware::from_fn(cors_middleware))
        .with_state(state)
}

/// Runs the gateway until `shutdown` is notified, then aborts whatever is
/// still in flight so the device channel is not left open.
pub async fn serve(cfg: &Config, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let state = AppState::from_config(cfg)?;
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            server_shutdown.notified().await;
        })
        .await?;

    tracing::info!("shutting down, aborting active operations");
    if let Err(err) = state.registry.abort_all().await {
        tracing::warn!(error = %err, "final abort failed");
    }
    Ok(())
}

/// Allow all origins: the gateway serves LAN dashboards and local tooling.
async fn cors_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    if req.method() == Method::OPTIONS {
        return cors_headers(StatusCode::OK.into_response());
    }
    cors_headers(next.run(req).await)
}

fn cors_headers(mut resp: axum::response::Response) -> axum::response::Response {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type"),
    );
    resp
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.client.list_channels().await {
        Ok(_) => (StatusCode::OK, "healthy"),
        Err(err) => {
            tracing::warn!(error = %err, "health probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    }
}

async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(offer): Json<RTCSessionDescription>,
) -> impl IntoResponse {
    match state.calls.handle_offer(offer).await {
        Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn play_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut audio = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("audio") {
                    match field.bytes().await {
                        Ok(bytes) => audio = Some(bytes),
                        Err(err) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                format!("failed to read audio field: {err}"),
                            )
                                .into_response()
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("bad multipart form: {err}"))
                    .into_response()
            }
        }
    }
    let Some(audio) = audio else {
        return (StatusCode::BAD_REQUEST, "no audio file provided").into_response();
    };

    match playfile::play_file(&state.client, &state.sessions, &state.registry, audio).await {
        Ok(()) => (StatusCode::OK, "audio played successfully").into_response(),
        Err(err) => error_response(err),
    }
}

async fn abort(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("abort requested, stopping all operations");
    match state.registry.abort_all().await {
        Ok(()) => (StatusCode::OK, "all operations aborted").into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> axum::response::Response {
    let status = error_status(&err);
    (status, err.to_string()).into_response()
}

/// Maps the crate taxonomy onto caller-visible statuses. Device
/// unreachability is kept distinct from protocol-level failures so
/// operators can tell network trouble from firmware quirks.
fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
        Error::NoAvailableChannels => StatusCode::SERVICE_UNAVAILABLE,
        Error::Unreachable(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Protocol(_) | Error::Closed | Error::Io(_) | Error::WebRtc(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_distinct_statuses() {
        assert_eq!(
            error_status(&Error::Conflict("busy")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&Error::Interrupted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&Error::NoAvailableChannels),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&Error::Unreachable("refused".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(error_status(&Error::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            error_status(&Error::Protocol("bad xml".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
