//! `RefinoreClient` against an in-process HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use automine::error::{ApiError, ErrorKind};
use automine::transport::{Endpoint, MiningApi, RefinoreClient, RetryPolicy};
use automine::types::{Credentials, SessionConfig, TileSelection};

#[derive(Debug, Clone)]
struct Captured {
    path: &'static str,
    headers: HeaderMap,
    body: Value,
}

#[derive(Clone, Default)]
struct Backend {
    seen: Arc<Mutex<Vec<Captured>>>,
    history_hits: Arc<AtomicUsize>,
    stop_hits: Arc<AtomicUsize>,
}

impl Backend {
    fn captured(&self) -> Vec<Captured> {
        self.seen.lock().unwrap().clone()
    }
}

async fn start_strategy(
    State(b): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    b.seen.lock().unwrap().push(Captured {
        path: "/mining/start-strategy",
        headers,
        body,
    });
    Json(json!({ "success": true, "data": { "sessionId": "s-42", "status": "active" } }))
}

async fn session() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn balance() -> impl IntoResponse {
    (StatusCode::UNAUTHORIZED, "token expired")
}

async fn current_round() -> impl IntoResponse {
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "3")], "slow down")
}

async fn session_rounds() -> Json<Value> {
    Json(json!({
        "rounds": [
            { "round": 12, "won": false, "solDeployed": 0.01 },
            { "round": 10, "won": true, "solDeployed": 0.01, "solEarned": 0.02 },
            { "round": 11, "won": false, "solDeployed": 0.01 }
        ]
    }))
}

/// 503 once, then a real answer.
async fn history(State(b): State<Backend>) -> axum::response::Response {
    if b.history_hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
    }
    Json(json!([{ "id": "s-1", "roundsPlayed": 7, "netPnlSol": -0.02 }])).into_response()
}

async fn stop(State(b): State<Backend>) -> impl IntoResponse {
    b.stop_hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_GATEWAY, "upstream gone")
}

async fn sse() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        concat!(
            ": keep-alive\n\n",
            "event: round_start\ndata: {\"round\":77}\n\n",
            "event: claim\ndata: {\"round\":76,\"sol\":0.02}\n\n",
        ),
    )
}

async fn serve(backend: Backend) -> String {
    let app = Router::new()
        .route("/api/mining/start-strategy", post(start_strategy))
        .route("/api/mining/stop", post(stop))
        .route("/api/mining/session", get(session))
        .route("/api/mining/session-rounds", get(session_rounds))
        .route("/api/mining/history", get(history))
        .route("/api/wallet/balance", get(balance))
        .route("/api/rounds/current", get(current_round))
        .route("/api/sse", get(sse))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        max_attempts: 3,
        request_timeout: Duration::from_secs(5),
        total_deadline: Duration::from_secs(5),
    }
}

async fn client(key: &str) -> (RefinoreClient, Backend) {
    let backend = Backend::default();
    let base = serve(backend.clone()).await;
    let client = RefinoreClient::new(&base, Credentials::from_secret(key), fast_retry()).unwrap();
    (client, backend)
}

#[tokio::test]
async fn test_start_strategy_sends_explicit_tiles() {
    let (client, backend) = client("rsk_live_key").await;
    let client = client.with_explicit_tiles_field("custom_tiles");
    let mut cfg = SessionConfig::new(dec!(0.005), 5);
    cfg.tile_selection = TileSelection::Explicit(vec![0, 6, 12, 18, 24]);

    let handle = client.start_explicit(&cfg, &[0, 6, 12, 18, 24]).await.unwrap();
    assert_eq!(handle.session_id, "s-42");

    let seen = backend.captured();
    assert_eq!(seen.len(), 1);
    let req = &seen[0];
    assert_eq!(req.path, "/mining/start-strategy");
    assert_eq!(req.body["custom_tiles"], json!([0, 6, 12, 18, 24]));
    assert_eq!(req.body["tile_selection_mode"], "custom");
    assert_eq!(req.body["num_tiles"], 5);
    assert_eq!(req.headers.get("x-api-key").unwrap(), "rsk_live_key");
    assert!(req.headers.get(header::AUTHORIZATION).is_none());
    assert!(req.headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn test_legacy_token_uses_bearer() {
    let (client, backend) = client("legacy-token").await;
    let cfg = SessionConfig::new(dec!(0.01), 25);
    client.start_explicit(&cfg, &[1]).await.unwrap();

    let seen = backend.captured();
    assert_eq!(
        seen[0].headers.get(header::AUTHORIZATION).unwrap(),
        "Bearer legacy-token"
    );
    assert!(seen[0].headers.get("x-api-key").is_none());
}

#[tokio::test]
async fn test_status_classification() {
    let (client, _) = client("rsk_k").await;

    let err = client.current_session().await.unwrap_err();
    assert_eq!(err, ApiError::NotFound { endpoint: Endpoint::Session });

    let err = client.balances().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthExpired);

    // Retry-After exceeds the total deadline, so the error surfaces.
    let slow = RefinoreClient::new(
        client.base_url(),
        Credentials::from_secret("rsk_k"),
        RetryPolicy {
            total_deadline: Duration::from_secs(1),
            ..fast_retry()
        },
    )
    .unwrap();
    let err = slow.current_round().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_reads_retry_but_ambiguous_writes_do_not() {
    let (client, backend) = client("rsk_k").await;

    let history = client.history(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rounds_played, 7);
    assert_eq!(history[0].net_pnl_sol, dec!(-0.02));
    assert_eq!(backend.history_hits.load(Ordering::SeqCst), 2);

    let err = client.stop().await.unwrap_err();
    assert!(err.is_ambiguous());
    assert_eq!(backend.stop_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_rounds_sorted_and_filtered() {
    let (client, _) = client("rsk_k").await;
    let rounds = client.session_rounds(Some(11)).await.unwrap();
    let numbers: Vec<u64> = rounds.iter().map(|r| r.round_number).collect();
    assert_eq!(numbers, vec![11, 12]);

    let all = client.session_rounds(None).await.unwrap();
    assert_eq!(all[0].round_number, 10);
    assert!(all[0].won);
    assert_eq!(all[0].sol_earned, dec!(0.02));
}

#[tokio::test]
async fn test_sse_stream_decoded() {
    let (client, _) = client("rsk_k").await;
    let events: Vec<_> = client.events().await.unwrap().collect().await;
    let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event, "round_start");
    assert_eq!(events[0].data, r#"{"round":77}"#);
    assert_eq!(events[1].event, "claim");
}
