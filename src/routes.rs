//! HTTP route handlers for the Pulse relay server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /socket` - WebSocket endpoint for the real-time relay
//! - `POST /refresh-token` - Rotate a refresh token for a new token pair
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which holds the
//! [`RelayServer`] and the server start time. The WebSocket handler runs the
//! connection handshake against the relay server, then drives two flows per
//! connection: an inbound loop dispatching client frames and a forward task
//! draining the connection's outbound queue into the socket.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulse_server::config::Config;
//! use pulse_server::routes::{create_router, AppState};
//! use pulse_server::server::RelayServer;
//! use pulse_server::session::MemoryIdentityStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let server = RelayServer::new(config, Arc::new(MemoryIdentityStore::new()));
//!     let app = create_router(AppState::new(Arc::new(server)));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::{gateway_code, ApiError};
use crate::gateway::GatewayError;
use crate::server::RelayServer;
use crate::session::TokenPair;
use crate::types::{ClientFrame, ConnectionId, ServerFrame};

// ============================================================================
// Constants
// ============================================================================

/// Deadline for flushing a terminal frame to an unresponsive transport.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay server instance.
    pub server: Arc<RelayServer>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state around a relay server.
    #[must_use]
    pub fn new(server: Arc<RelayServer>) -> Self {
        Self {
            server,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("server", &"<RelayServer>")
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// When the configuration names an allowed origin, a CORS layer restricted
/// to that origin is applied; otherwise cross-origin requests are left to
/// the browser's defaults.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/socket", get(get_socket))
        .route("/refresh-token", post(post_refresh_token))
        .route("/health", get(get_health));

    if let Some(origin) = &state.server.config().allowed_origin {
        match origin.parse::<HeaderValue>() {
            Ok(value) => {
                router = router.layer(
                    CorsLayer::new()
                        .allow_origin(value)
                        .allow_methods([Method::GET, Method::POST])
                        .allow_headers(Any),
                );
            }
            Err(_) => {
                warn!(origin = %origin, "allowed origin is not a valid header value, ignoring");
            }
        }
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

// ============================================================================
// POST /refresh-token - Token Rotation
// ============================================================================

/// Request body for token rotation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

/// POST /refresh-token - Rotate a refresh token.
///
/// Verifies the presented refresh token, checks it against the identity's
/// single stored slot, and replaces the slot with a freshly issued pair.
/// Presenting a superseded token fails; the client must authenticate from
/// scratch.
///
/// # Responses
///
/// - `200 OK` - `{ "accessToken", "refreshToken" }`
/// - `401 Unauthorized` - invalid, expired, stale, or unknown token
/// - `500 Internal Server Error` - signing or backing-store failure
async fn post_refresh_token(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let pair = state.server.rotate(&body.refresh_token).await?;
    Ok(Json(pair))
}

// ============================================================================
// GET /socket - WebSocket Relay Endpoint
// ============================================================================

/// Query parameters for the socket endpoint.
#[derive(Debug, Deserialize)]
pub struct SocketQueryParams {
    /// Bearer access token. Fallback for browser WebSocket clients, which
    /// cannot set request headers.
    pub token: Option<String>,
}

/// GET /socket - WebSocket endpoint for the real-time relay.
///
/// # Authentication
///
/// The bearer access token is handshake metadata: either an
/// `Authorization: Bearer <token>` header or a `token` query parameter. It
/// is verified immediately after the upgrade; a missing or invalid token
/// produces a single `auth-error` frame and the connection is closed. No
/// other frame is processed before authentication succeeds.
///
/// # WebSocket Protocol
///
/// Frames are `type`-tagged JSON text messages; see [`ClientFrame`] and
/// [`ServerFrame`].
async fn get_socket(
    State(state): State<AppState>,
    Query(params): Query<SocketQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = bearer_token(&headers, &params);
    ws.on_upgrade(move |socket| handle_socket(socket, state.server, bearer))
}

/// Extracts the bearer access token from handshake metadata.
fn bearer_token(headers: &HeaderMap, params: &SocketQueryParams) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.token.clone().filter(|token| !token.is_empty()))
}

/// Drives one relay connection over an established WebSocket.
async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    server: Arc<RelayServer>,
    bearer: Option<String>,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (id, mut outbound_rx) = server.connect();
    let (mut sink, mut stream) = socket.split();

    // The deadline covers verification and, on failure, flushing the
    // auth-error frame; a transport that stalls here is torn down the same
    // way as one that presented a bad token.
    let handshake = async {
        match server.authenticate(id, bearer.as_deref()) {
            Ok(claims) => Ok(claims),
            Err(err) => {
                let frame = ServerFrame::auth_error(gateway_code(&err));
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = sink.send(Message::Text(json.into())).await;
                }
                let _ = sink.close().await;
                Err(err)
            }
        }
    };

    let claims = match timeout(server.config().handshake_timeout, handshake).await {
        Ok(Ok(claims)) => claims,
        Ok(Err(err)) => {
            debug!(connection = %id, error = %err, "handshake failed");
            server.disconnect(id);
            return;
        }
        Err(_) => {
            warn!(connection = %id, "handshake timed out");
            // Best-effort, bounded: the transport may be the thing that
            // stalled in the first place.
            let frame = ServerFrame::auth_error(gateway_code(&GatewayError::HandshakeTimeout));
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = timeout(FLUSH_TIMEOUT, sink.send(Message::Text(json.into()))).await;
            }
            let _ = timeout(FLUSH_TIMEOUT, sink.close()).await;
            server.disconnect(id);
            return;
        }
    };

    info!(
        connection = %id,
        identity = %claims.sub,
        username = %claims.username,
        "socket session started"
    );

    // Forward queued frames into the socket until the queue closes
    // (disconnect drops the sender) or the transport errors.
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if let Err(err) = sink.send(Message::Text(json.into())).await {
                        debug!(error = %err, "failed to write frame to socket");
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to serialize server frame");
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&server, id, text.as_str()),
            Ok(Message::Close(_)) => {
                debug!(connection = %id, "client sent close frame");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // axum answers pings automatically.
            }
            Ok(_) => {
                // Binary frames are not part of the protocol.
            }
            Err(err) => {
                debug!(connection = %id, error = %err, "socket error");
                break;
            }
        }
    }

    // Transport gone: room cleanup runs before connection state is
    // discarded, and dropping the queue discards undelivered frames.
    server.disconnect(id);
    forward_task.abort();
    info!(connection = %id, "socket session ended");
}

/// Dispatches one inbound client frame.
///
/// Rejections are reported with a non-fatal `error` frame; the connection
/// stays open.
fn handle_frame(server: &RelayServer, id: ConnectionId, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(connection = %id, error = %err, "unparseable client frame");
            server.notify(id, ServerFrame::error("invalid_frame"));
            return;
        }
    };

    let result = match frame {
        ClientFrame::JoinRoom { room } => server.join_room(id, &room),
        ClientFrame::LeaveRoom { room } => server.leave_room(id, &room),
        ClientFrame::Message { target, payload } => {
            server.send(id, &target, payload).map(|_delivered| ())
        }
    };

    if let Err(err) = result {
        server.notify(id, ServerFrame::error(gateway_code(&err)));
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live relay connections.
    pub connections: usize,

    /// Number of rooms with at least one member.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.server.connection_count(),
        rooms: state.server.room_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
