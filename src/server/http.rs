// server/http.rs - HTTP surface of the coordinator
//
// Protocol endpoints carry the binary map encoding; health, version, and
// stats answer in plain text; /v1/events is the streaming text channel.

use crate::codec::{decode_from_slice, encode_to_vec, WireMessage};
use crate::config::ServerConfig;
use crate::metrics::SyncMetrics;
use crate::protocol::ErrorResponse;
use crate::server::broadcaster::EventBroadcaster;
use crate::server::service::ReplicationService;
use crate::Error;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub service: Arc<ReplicationService>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub metrics: Arc<SyncMetrics>,
    pub config: Arc<ServerConfig>,
}

/// Builds the coordinator router.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/version", get(version))
        .route("/v1/handshake", post(handshake))
        .route("/v1/pull", post(pull))
        .route("/v1/push", post(push))
        .route("/v1/stats", get(stats))
        .route("/v1/events", get(events))
        .with_state(ctx)
}

async fn health() -> impl IntoResponse {
    r#"{"status":"ok"}"#
}

async fn version(State(ctx): State<AppContext>) -> impl IntoResponse {
    let info = ctx.service.version();
    serde_json::json!({
        "current": info.current,
        "minSupported": info.min_supported,
    })
    .to_string()
}

async fn handshake(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&ctx, &headers) {
        return error_response(&e);
    }
    let request: crate::protocol::HandshakeRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match ctx.service.handshake(&request).await {
        Ok(response) => cbor_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}

async fn pull(State(ctx): State<AppContext>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = check_auth(&ctx, &headers) {
        return error_response(&e);
    }
    let request: crate::protocol::PullRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match ctx.service.pull(&request).await {
        Ok(response) => cbor_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}

async fn push(State(ctx): State<AppContext>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = check_auth(&ctx, &headers) {
        return error_response(&e);
    }
    let request: crate::protocol::PushRequest = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match ctx.service.push(&request).await {
        Ok(response) => cbor_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}

async fn stats(State(ctx): State<AppContext>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&ctx, &headers) {
        return error_response(&e);
    }
    serde_json::json!({
        "dbs": ctx.service.stats(),
        "broadcaster": ctx.broadcaster.stats(),
        "metrics": ctx.metrics.snapshot(),
    })
    .to_string()
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    device_id: String,
    /// Comma-separated collection filter.
    collections: Option<String>,
    /// Database whose cursor seeds the connected event.
    db_id: Option<String>,
}

async fn events(
    State(ctx): State<AppContext>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&ctx, &headers) {
        return error_response(&e);
    }

    let collections = query.collections.as_deref().map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok());
    let cursor = query
        .db_id
        .as_deref()
        .map(|db_id| ctx.service.cursor(db_id))
        .unwrap_or(0);

    let handle = match ctx
        .broadcaster
        .subscribe(query.device_id, collections, cursor, last_event_id)
    {
        Ok(handle) => handle,
        Err(e) => return error_response(&e),
    };

    let stream = futures_util::stream::unfold(handle, |handle| async move {
        let frame = handle.next_frame().await?;
        Some((
            Ok::<Bytes, std::convert::Infallible>(Bytes::from(frame.render())),
            handle,
        ))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The codec only raises Format; this boundary reports it as a bad request.
fn decode_request<M: WireMessage>(body: &Bytes) -> crate::Result<M> {
    decode_from_slice(body).map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Gate for protected endpoints. Token *verification* belongs to deployment
/// middleware; this only refuses unauthenticated traffic when a secret is
/// configured.
fn check_auth(ctx: &AppContext, headers: &HeaderMap) -> crate::Result<()> {
    if ctx.config.jwt_secret.is_none() {
        return Ok(());
    }
    match headers.get(header::AUTHORIZATION) {
        Some(value) if !value.is_empty() => Ok(()),
        _ => Err(Error::Auth("missing Authorization header".to_string())),
    }
}

fn cbor_response<M: WireMessage>(status: StatusCode, message: &M) -> Response {
    match encode_to_vec(message) {
        Ok(bytes) => (
            status,
            [(header::CONTENT_TYPE, CONTENT_TYPE_CBOR)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Response encoding failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::VersionMismatch(_) | Error::InvalidRequest(_) | Error::Format(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::UnknownDatabase(_) => StatusCode::NOT_FOUND,
        Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse::new(error.code(), error.to_string());
    cbor_response(status, &body)
}
