//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::{Broker, BrokerReply, create_sse_response};
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, McpMessage, RequestHeaders, SESSION_HEADER};

/// Build the broker router.
///
/// `mcp_path` is where the MCP endpoint is mounted (usually `/mcp`).
pub fn create_router(broker: Arc<Broker>, mcp_path: &str, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route(
            mcp_path,
            get(sse_handler).post(post_handler).delete(delete_handler),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .with_state(broker)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status_handler(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    Json(broker.status())
}

/// POST: one JSON-RPC message per request
async fn post_handler(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match McpMessage::parse(&body, RequestHeaders::from_http(&headers)) {
        Ok(message) => message,
        Err(e) => return rpc_error(StatusCode::BAD_REQUEST, rpc_codes::PARSE_ERROR, &e.to_string()),
    };
    if let Err(e) = message.validate() {
        return rpc_error(StatusCode::BAD_REQUEST, e.to_rpc_code(), &e.to_string());
    }

    match broker.dispatch(&message) {
        BrokerReply::Accepted => StatusCode::ACCEPTED.into_response(),
        BrokerReply::Response {
            status,
            body,
            session,
        } => {
            let mut response = (status, Json(body)).into_response();
            if let Some(token) = session
                && let Ok(value) = HeaderValue::from_str(&token)
            {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
    }
}

/// GET: SSE stream of downstream notifications for the session
async fn sse_handler(State(broker): State<Arc<Broker>>, headers: HeaderMap) -> Response {
    let accepts_sse = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));
    if !accepts_sse {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({ "error": "Must accept text/event-stream for notifications" })),
        )
            .into_response();
    }

    let session = match broker.verify_header(&RequestHeaders::from_http(&headers)) {
        Ok(session) => session,
        Err(e) => {
            let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
            return rpc_error(status, e.to_rpc_code(), &e.to_string());
        }
    };

    info!(sessions = broker.hub().session_count() + 1, "Client connected to notification stream");
    let mut response =
        create_sse_response(Arc::clone(broker.hub()), session.clone(), broker.keep_alive)
            .into_response();
    if let Ok(value) = HeaderValue::from_str(&session) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// DELETE: terminate the session
async fn delete_handler(State(broker): State<Arc<Broker>>, headers: HeaderMap) -> StatusCode {
    let Some(token) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    if broker.terminate(token) {
        info!("Session terminated by client");
        StatusCode::NO_CONTENT
    } else {
        debug!("DELETE for unknown session");
        StatusCode::NOT_FOUND
    }
}

fn rpc_error(status: StatusCode, code: i32, message: &str) -> Response {
    if status.is_server_error() {
        warn!(status = %status, error = message, "Broker request failed");
    }
    (status, Json(JsonRpcResponse::error(None, code, message))).into_response()
}
