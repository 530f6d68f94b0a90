// =============================================================================
// API-key authentication — Axum extractor
// =============================================================================
//
// Every terminal endpoint requires an `X-API-Key` header matching the
// `MT5_GATEWAY_API_KEY` environment variable. Comparison is performed in
// constant time to prevent timing side-channels. A server with no key
// configured rejects everything with a 500 so a deployment mistake cannot
// silently open the API.
//
// Usage as an Axum extractor:
//
//   async fn handler(_key: ApiKey, ...) { ... }
//
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

/// Environment variable holding the expected API key.
const API_KEY_ENV: &str = "MT5_GATEWAY_API_KEY";

// =============================================================================
// Key comparison
// =============================================================================

/// Whether the presented key matches the configured one, in constant time.
///
/// The fold accumulates the XOR of every byte pair and the length
/// difference, and only inspects the accumulator at the end. Response time
/// therefore depends on the key lengths alone, not on where the first
/// mismatching byte sits, which is what a timing probe would measure.
fn keys_match(presented: &[u8], expected: &[u8]) -> bool {
    let length_diff = presented.len() ^ expected.len();

    let byte_diff = presented
        .iter()
        .zip(expected.iter())
        .fold(0usize, |acc, (p, e)| acc | usize::from(p ^ e));

    (length_diff | byte_diff) == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor that validates the `X-API-Key` header. Rejects before the
/// handler body runs.
pub struct ApiKey;

/// Rejection returned when authentication fails.
pub struct ApiKeyRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for ApiKeyRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = ApiKeyRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so key rotation does not require a restart.
        let expected = std::env::var(API_KEY_ENV).unwrap_or_default();

        if expected.is_empty() {
            error!("{API_KEY_ENV} is not set, rejecting all authenticated requests");
            return Err(ApiKeyRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Server configuration error",
            });
        }

        let provided = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !keys_match(provided.as_bytes(), expected.as_bytes()) {
            warn!("invalid API key presented");
            return Err(ApiKeyRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid API Key",
            });
        }

        Ok(ApiKey)
    }
}

// =============================================================================
// Tests
// =============================================================================
