// =============================================================================
// REST API endpoints — Axum
// =============================================================================
//
// A thin request/response shell: every handler validates the API key,
// forwards to the smart queue, and formats the result. The health endpoints
// (`/`, `/status`) are public.
//
// CORS origins come from `ALLOWED_ORIGINS` (comma-separated); `*` opens the
// API for development.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::ApiKey;
use crate::error::GatewayError;
use crate::queue::SmartQueue;
use crate::types::Credentials;

/// Service name reported by the banner endpoint.
const SERVICE_NAME: &str = "MT5 Gateway";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Shared API state
// =============================================================================

/// A registered terminal connection, for operator visibility only.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub login: i64,
    pub server: String,
    pub connected_at: String,
    pub last_activity: String,
}

/// State shared by every handler.
pub struct ApiContext {
    pub queue: Arc<SmartQueue>,
    pub connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl ApiContext {
    pub fn new(queue: Arc<SmartQueue>) -> Self {
        Self {
            queue,
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn touch_connection(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().get_mut(connection_id) {
            conn.last_activity = Utc::now().to_rfc3339();
        }
    }
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/", get(root))
        .route("/status", get(status))
        // ── Authenticated ───────────────────────────────────────────
        .route("/mt5/connect", post(connect))
        .route("/mt5/account", post(account))
        .route("/mt5/positions", post(positions))
        .route("/mt5/trades", post(trades))
        .route("/mt5/disconnect", post(disconnect))
        .route("/mt5/connections", get(connections))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors_layer())
        .with_state(ctx)
}

/// CORS policy from the `ALLOWED_ORIGINS` environment variable.
fn cors_layer() -> CorsLayer {
    let origins = std::env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".into());

    if origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    login: i64,
    password: String,
    server: String,
}

impl CredentialsRequest {
    fn into_credentials(self) -> Credentials {
        Credentials {
            login: self.login,
            password: self.password,
            server: self.server,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionsRequest {
    login: i64,
    password: String,
    server: String,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradesRequest {
    login: i64,
    password: String,
    server: String,
    #[serde(default)]
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    connection_id: String,
}

// =============================================================================
// Error mapping
// =============================================================================

fn error_response(error: GatewayError) -> (StatusCode, axum::Json<serde_json::Value>) {
    let status = match &error {
        GatewayError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
        GatewayError::InitFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::CallerTimeout => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Driver(_) | GatewayError::WorkerGone => StatusCode::BAD_GATEWAY,
    };
    (status, axum::Json(json!({ "detail": error.to_string() })))
}

// =============================================================================
// Public endpoints
// =============================================================================

async fn root() -> impl IntoResponse {
    axum::Json(json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "status": "running",
        "description": "Self-hosted MetaTrader 5 integration API",
    }))
}

async fn status(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": if ctx.queue.is_worker_running() { "ok" } else { "error" },
        "message": format!("{SERVICE_NAME} is running"),
        "terminal_ready": ctx.queue.is_terminal_ready(),
        "worker_running": ctx.queue.is_worker_running(),
        "queue_depth": ctx.queue.queue_depth(),
        "active_connections": ctx.connections.read().len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// =============================================================================
// Terminal endpoints (authenticated)
// =============================================================================

/// Log in, return the account summary, and register the connection.
async fn connect(
    _key: ApiKey,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<CredentialsRequest>,
) -> impl IntoResponse {
    let credentials = body.into_credentials();
    let connection_id = credentials.connection_id();
    info!(%connection_id, "connection request");

    match ctx.queue.account_summary(credentials.clone()).await {
        Ok(summary) => {
            let now = Utc::now().to_rfc3339();
            ctx.connections.write().insert(
                connection_id.clone(),
                ConnectionInfo {
                    login: credentials.login,
                    server: credentials.server.clone(),
                    connected_at: now.clone(),
                    last_activity: now,
                },
            );
            info!(%connection_id, "connected successfully");
            axum::Json(json!({
                "success": true,
                "connection_id": connection_id,
                "account": summary,
            }))
            .into_response()
        }
        Err(error) => {
            warn!(%connection_id, error = %error, "connection failed");
            error_response(error).into_response()
        }
    }
}

/// Account summary without registering a connection.
async fn account(
    _key: ApiKey,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<CredentialsRequest>,
) -> impl IntoResponse {
    match ctx.queue.account_summary(body.into_credentials()).await {
        Ok(summary) => axum::Json(json!({ "success": true, "account": summary })).into_response(),
        Err(error) => error_response(error).into_response(),
    }
}

/// Open positions via the read-through cache. This is the endpoint that
/// drives poll cycles and therefore closed-trade detection.
async fn positions(
    _key: ApiKey,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<PositionsRequest>,
) -> impl IntoResponse {
    let credentials = Credentials {
        login: body.login,
        password: body.password,
        server: body.server,
    };
    let user_id = credentials.connection_id();
    ctx.touch_connection(&user_id);

    let positions = ctx
        .queue
        .get_positions(&user_id, credentials, body.account_id)
        .await;

    axum::Json(json!({
        "success": true,
        "count": positions.len(),
        "positions": positions,
    }))
}

/// Closed trades over the requested window, grouped from deal history.
async fn trades(
    _key: ApiKey,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<TradesRequest>,
) -> impl IntoResponse {
    let credentials = Credentials {
        login: body.login,
        password: body.password,
        server: body.server,
    };
    let days = ctx.queue.history_window_days(body.days);

    match ctx.queue.trade_history(credentials, Some(days)).await {
        Ok(trades) => {
            let to_date = Utc::now();
            let from_date = to_date - Duration::days(days);
            axum::Json(json!({
                "success": true,
                "count": trades.len(),
                "trades": trades,
                "from_date": from_date.to_rfc3339(),
                "to_date": to_date.to_rfc3339(),
            }))
            .into_response()
        }
        Err(error) => error_response(error).into_response(),
    }
}

/// Remove a registered connection.
async fn disconnect(
    _key: ApiKey,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<DisconnectRequest>,
) -> impl IntoResponse {
    let removed = ctx.connections.write().remove(&body.connection_id).is_some();
    if removed {
        info!(connection_id = %body.connection_id, "disconnected");
        axum::Json(json!({
            "success": true,
            "message": format!("Disconnected {}", body.connection_id),
        }))
    } else {
        axum::Json(json!({
            "success": false,
            "message": "Connection not found",
        }))
    }
}

/// List registered connections.
async fn connections(_key: ApiKey, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let connections = ctx.connections.read().clone();
    axum::Json(json!({
        "success": true,
        "count": connections.len(),
        "connections": connections,
    }))
}
