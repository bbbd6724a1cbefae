//! Mock API server used to exercise the resilience pipeline.
//!
//! Endpoints:
//! - `GET /api` - endpoint listing
//! - `GET /api/users`, `GET /api/users/:id`
//! - `GET /api/slow?delay=ms` - responds after a delay (default 2000ms)
//! - `GET /api/error?code=n` - always fails with the given status (default 500)
//! - `GET /api/random-fail` - odd-numbered calls fail with 500

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

const DEFAULT_SLOW_DELAY_MS: u64 = 2000;
const DEFAULT_ERROR_CODE: u16 = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: u32,
    pub name: String,
    pub email: String,
    pub is_active: bool,
}

/// State shared across mock handlers.
pub struct MockState {
    users: Vec<User>,
    random_fail_calls: AtomicU64,
}

impl Default for MockState {
    fn default() -> Self {
        let user = |id, name: &str, email: &str, is_active| User {
            id,
            name: name.to_string(),
            email: email.to_string(),
            is_active,
        };
        Self {
            users: vec![
                user(1, "John Doe", "john@example.com", true),
                user(2, "Alice Johnson", "alice@example.com", true),
                user(3, "Bob Smith", "bob@example.com", false),
            ],
            random_fail_calls: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DelayParams {
    delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorParams {
    code: Option<u16>,
}

/// Build the mock API router.
pub fn router(state: Arc<MockState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api", get(handle_index))
        .route("/api/users", get(handle_users))
        .route("/api/users/:id", get(handle_user))
        .route("/api/slow", get(handle_slow))
        .route("/api/error", get(handle_error))
        .route("/api/random-fail", get(handle_random_fail))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the mock server in the background.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_mock_server(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(MockState::default()));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Mock API listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Mock API server error: {}", e);
        }
    });

    Ok(actual_addr)
}

async fn handle_index() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Bulwark mock API",
        "endpoints": {
            "users": "/api/users",
            "slow": "/api/slow?delay=2000",
            "error": "/api/error?code=500",
            "randomFail": "/api/random-fail"
        }
    }))
}

async fn handle_users(State(state): State<Arc<MockState>>) -> Json<Vec<User>> {
    Json(state.users.clone())
}

async fn handle_user(State(state): State<Arc<MockState>>, Path(id): Path<u32>) -> Response {
    match state.users.iter().find(|u| u.id == id) {
        Some(user) => Json(user.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "User not found" })),
        )
            .into_response(),
    }
}

async fn handle_slow(Query(params): Query<DelayParams>) -> Json<serde_json::Value> {
    let delay = params
        .delay
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_SLOW_DELAY_MS);
    debug!("Slow endpoint waiting {}ms", delay);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    Json(json!({
        "message": "This response was delayed!",
        "delay": delay,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn handle_error(Query(params): Query<ErrorParams>) -> Response {
    let code = params
        .code
        .filter(|c| *c != 0)
        .unwrap_or(DEFAULT_ERROR_CODE);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (
        status,
        Json(json!({
            "error": error_text(status.as_u16()),
            "code": status.as_u16(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

async fn handle_random_fail(State(state): State<Arc<MockState>>) -> Response {
    let attempt = state.random_fail_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt % 2 == 0 {
        Json(json!({ "message": "Success!", "attempt": attempt })).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Random failure", "attempt": attempt })),
        )
            .into_response()
    }
}

async fn handle_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Endpoint not found" })),
    )
        .into_response()
}

fn error_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request - Invalid parameters",
        401 => "Unauthorized - Please login",
        403 => "Forbidden - Access denied",
        404 => "Not Found - Resource does not exist",
        500 => "Internal Server Error - Something went wrong",
        503 => "Service Unavailable - Try again later",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
        let response = reqwest::get(format!("http://{}{}", addr, path))
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json::<Value>().await.unwrap())
    }

    #[tokio::test]
    async fn test_server_starts() {
        let addr = start_mock_server("127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);

        let (status, body) = get(addr, "/api/users").await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().map(|a| a.len()), Some(3));
    }

    #[tokio::test]
    async fn test_error_endpoint_uses_requested_code() {
        let addr = start_mock_server("127.0.0.1", 0).await.unwrap();

        let (status, body) = get(addr, "/api/error?code=503").await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "Service Unavailable - Try again later");

        let (status, _) = get(addr, "/api/error").await;
        assert_eq!(status, 500);
    }

    #[tokio::test]
    async fn test_random_fail_alternates() {
        let addr = start_mock_server("127.0.0.1", 0).await.unwrap();

        assert_eq!(get(addr, "/api/random-fail").await.0, 500);
        let (status, body) = get(addr, "/api/random-fail").await;
        assert_eq!(status, 200);
        assert_eq!(body["attempt"], 2);
        assert_eq!(get(addr, "/api/random-fail").await.0, 500);
    }

    #[tokio::test]
    async fn test_unknown_user_and_route_are_404() {
        let addr = start_mock_server("127.0.0.1", 0).await.unwrap();
        assert_eq!(get(addr, "/api/users/2").await.1["name"], "Alice Johnson");
        assert_eq!(get(addr, "/api/users/99").await.0, 404);
        assert_eq!(get(addr, "/nope").await.0, 404);
    }

    #[tokio::test]
    async fn test_slow_endpoint_reports_delay() {
        let addr = start_mock_server("127.0.0.1", 0).await.unwrap();
        let (status, body) = get(addr, "/api/slow?delay=20").await;
        assert_eq!(status, 200);
        assert_eq!(body["delay"], 20);
    }
}
