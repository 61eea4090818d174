use super::*;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::StatusCode as HttpStatus,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::Barrier};

#[derive(Clone)]
struct AuthServerState {
    session_valid: Arc<AtomicBool>,
    refresh_succeeds: Arc<AtomicBool>,
    refresh_calls: Arc<AtomicUsize>,
    protected_hits: Arc<AtomicUsize>,
    rejecting_hits: Arc<AtomicUsize>,
    first_wave: Option<Arc<Barrier>>,
}

async fn protected(State(state): State<AuthServerState>) -> impl IntoResponse {
    state.protected_hits.fetch_add(1, Ordering::SeqCst);
    if state.session_valid.load(Ordering::SeqCst) {
        return (HttpStatus::OK, Json(json!({"status": "ok"})));
    }
    // Hold every expired request until the whole wave has arrived, so all of
    // them are rejected before any refresh starts.
    if let Some(barrier) = &state.first_wave {
        barrier.wait().await;
    }
    (
        HttpStatus::UNAUTHORIZED,
        Json(json!({"detail": "Token expired"})),
    )
}

async fn always_rejects(State(state): State<AuthServerState>) -> impl IntoResponse {
    state.rejecting_hits.fetch_add(1, Ordering::SeqCst);
    (
        HttpStatus::UNAUTHORIZED,
        Json(json!({"detail": "Not authenticated"})),
    )
}

async fn refresh(State(state): State<AuthServerState>) -> impl IntoResponse {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    if state.refresh_succeeds.load(Ordering::SeqCst) {
        state.session_valid.store(true, Ordering::SeqCst);
        (HttpStatus::OK, Json(json!({"status": "refreshed"})))
    } else {
        (
            HttpStatus::UNAUTHORIZED,
            Json(json!({"detail": "Refresh token expired"})),
        )
    }
}

async fn ws_token() -> impl IntoResponse {
    Json(json!({"access_token": "rt-123"}))
}

async fn spawn_auth_server(
    refresh_succeeds: bool,
    first_wave: Option<usize>,
) -> anyhow::Result<(String, AuthServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AuthServerState {
        session_valid: Arc::new(AtomicBool::new(false)),
        refresh_succeeds: Arc::new(AtomicBool::new(refresh_succeeds)),
        refresh_calls: Arc::new(AtomicUsize::new(0)),
        protected_hits: Arc::new(AtomicUsize::new(0)),
        rejecting_hits: Arc::new(AtomicUsize::new(0)),
        first_wave: first_wave.map(|size| Arc::new(Barrier::new(size))),
    };
    let app = Router::new()
        .route("/api/v1/protected", get(protected))
        .route("/api/v1/rejecting", get(always_rejects))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/ws-token", get(ws_token))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api/v1"), state))
}

fn gateway_for(api_base_url: String) -> Arc<SessionGateway> {
    let settings = ClientSettings {
        api_base_url,
        ..ClientSettings::default()
    };
    Arc::new(SessionGateway::new(&settings).expect("gateway"))
}

async fn fire_concurrently(
    gateway: &Arc<SessionGateway>,
    count: usize,
    path: &'static str,
) -> Vec<Result<ApiResponse, SessionError>> {
    let mut tasks = Vec::new();
    for _ in 0..count {
        let gateway = Arc::clone(gateway);
        tasks.push(tokio::spawn(async move {
            gateway.send(ApiRequest::get(path)).await
        }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.expect("join"));
    }
    outcomes
}

#[tokio::test]
async fn two_expired_requests_share_one_refresh_and_each_succeed_once() {
    let (api_base_url, server) = spawn_auth_server(true, Some(2)).await.expect("spawn server");
    let gateway = gateway_for(api_base_url);

    let outcomes = fire_concurrently(&gateway, 2, "/protected").await;

    for outcome in outcomes {
        let response = outcome.expect("request recovers");
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.refresh_count(), 1);
    // Two rejected first attempts, then exactly one replay each.
    assert_eq!(server.protected_hits.load(Ordering::SeqCst), 4);
    assert_eq!(gateway.status(), SessionStatus::Authenticated);
    assert!(!gateway.is_refresh_in_flight());
}

#[tokio::test]
async fn many_expired_requests_trigger_exactly_one_refresh() {
    const WAVE: usize = 6;
    let (api_base_url, server) = spawn_auth_server(true, Some(WAVE))
        .await
        .expect("spawn server");
    let gateway = gateway_for(api_base_url);

    let outcomes = fire_concurrently(&gateway, WAVE, "/protected").await;

    assert!(outcomes.iter().all(|outcome| outcome.is_ok()));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.protected_hits.load(Ordering::SeqCst), WAVE * 2);
}

#[tokio::test]
async fn failed_refresh_rejects_every_queued_request() {
    const WAVE: usize = 3;
    let (api_base_url, server) = spawn_auth_server(false, Some(WAVE))
        .await
        .expect("spawn server");
    let gateway = gateway_for(api_base_url);
    let mut status = gateway.subscribe_status();

    let outcomes = fire_concurrently(&gateway, WAVE, "/protected").await;

    for outcome in outcomes {
        let err = outcome.expect_err("refresh failure is terminal");
        assert_eq!(
            err,
            SessionError::RefreshRejected {
                status: StatusCode::UNAUTHORIZED
            }
        );
        assert!(err.is_terminal_auth_failure());
    }
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    // No replay happened after the failed refresh.
    assert_eq!(server.protected_hits.load(Ordering::SeqCst), WAVE);
    assert!(!gateway.is_refresh_in_flight());
    assert!(status.has_changed().expect("status channel"));
    assert_eq!(*status.borrow_and_update(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn replayed_request_rejected_again_is_not_retried() {
    let (api_base_url, server) = spawn_auth_server(true, None).await.expect("spawn server");
    let gateway = gateway_for(api_base_url);

    let err = gateway
        .send(ApiRequest::get("/rejecting"))
        .await
        .expect_err("second 401 propagates");

    assert_eq!(
        err,
        SessionError::Unauthorized {
            path: "/rejecting".into()
        }
    );
    assert_eq!(server.rejecting_hits.load(Ordering::SeqCst), 2);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unauthorized_refresh_endpoint_is_returned_as_is() {
    let (api_base_url, server) = spawn_auth_server(false, None).await.expect("spawn server");
    let gateway = gateway_for(api_base_url);

    let response = gateway
        .send(ApiRequest::post("/auth/refresh"))
        .await
        .expect("401 on refresh endpoint is a plain response");

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.refresh_count(), 0);
}

#[tokio::test]
async fn non_unauthorized_errors_pass_through_without_refresh() {
    let (api_base_url, server) = spawn_auth_server(true, None).await.expect("spawn server");
    let gateway = gateway_for(api_base_url);

    let response = gateway
        .send(ApiRequest::get("/missing"))
        .await
        .expect("404 is a response");
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    let err = response
        .error_for_status("/missing")
        .expect_err("404 maps to a status error");
    assert!(matches!(
        err,
        SessionError::Status {
            status: StatusCode::NOT_FOUND,
            ..
        }
    ));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn realtime_token_is_fetched_through_the_gateway() {
    let (api_base_url, _server) = spawn_auth_server(true, None).await.expect("spawn server");
    let gateway = gateway_for(api_base_url);

    assert_eq!(gateway.realtime_token().await.expect("token"), "rt-123");
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let gateway = gateway_for(format!("http://{addr}/api/v1"));

    let err = gateway
        .send(ApiRequest::get("/protected"))
        .await
        .expect_err("nothing is listening");
    assert!(matches!(err, SessionError::Transport { .. }));
    assert_eq!(gateway.refresh_count(), 0);
}

#[test]
fn replay_marker_is_only_set_on_the_replay() {
    let request = ApiRequest::get("/protected").query("page", 2);
    assert!(!request.is_replay());
    let replay = request.clone().into_replay();
    assert!(replay.is_replay());
    assert_eq!(replay.path(), request.path());
}
