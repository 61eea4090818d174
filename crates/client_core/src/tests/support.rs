//! In-process backend double: realtime credential endpoint plus a chat socket
//! that can close with a chosen code and acknowledges sent messages.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast};

use crate::channel::ChannelEvent;

#[derive(Clone, Default)]
pub struct SocketBehavior {
    /// Close the first connection with this code right after the upgrade.
    pub close_first_with: Option<u16>,
    /// Close every connection with this code right after the upgrade.
    pub close_all_with: Option<u16>,
    /// Raw text frames sent on every successful connection before echoing.
    pub greeting: Vec<String>,
    /// Sender id stamped on acknowledged messages.
    pub sender_id: i64,
    /// Answer the realtime credential endpoint with 401.
    pub reject_ws_token: bool,
}

#[derive(Clone)]
pub struct BackendDouble {
    pub upgrades: Arc<AtomicUsize>,
    pub tokens: Arc<Mutex<Vec<String>>>,
    pub received: Arc<Mutex<Vec<Value>>>,
    issued_tokens: Arc<AtomicUsize>,
    next_message_id: Arc<AtomicI64>,
    behavior: Arc<SocketBehavior>,
}

impl BackendDouble {
    pub fn upgrade_count(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("tokens").clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("received").clone()
    }
}

pub struct SpawnedBackend {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub backend: BackendDouble,
}

impl SpawnedBackend {
    pub fn chat_url(&self, chat_id: i64) -> String {
        format!("{}/ws/service-chats/{chat_id}?token=static", self.ws_base_url)
    }
}

async fn issue_ws_token(State(backend): State<BackendDouble>) -> impl IntoResponse {
    if backend.behavior.reject_ws_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Not authenticated"})),
        );
    }
    let n = backend.issued_tokens.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, Json(json!({"access_token": format!("rt-{n}")})))
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(chat_id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
    State(backend): State<BackendDouble>,
) -> impl IntoResponse {
    let connection = backend.upgrades.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(token) = query.get("token") {
        backend.tokens.lock().expect("tokens").push(token.clone());
    }
    ws.on_upgrade(move |socket| serve_chat_socket(socket, backend, chat_id, connection))
}

async fn serve_chat_socket(
    mut socket: WebSocket,
    backend: BackendDouble,
    chat_id: i64,
    connection: usize,
) {
    let close_code = match backend.behavior.close_all_with {
        Some(code) => Some(code),
        None if connection == 1 => backend.behavior.close_first_with,
        None => None,
    };
    if let Some(code) = close_code {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "closing".into(),
            })))
            .await;
        return;
    }

    for frame in &backend.behavior.greeting {
        if socket.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                return;
            }
            continue;
        };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        backend
            .received
            .lock()
            .expect("received")
            .push(payload.clone());

        let reply = match payload.get("type").and_then(Value::as_str) {
            Some("message") => {
                let id = backend.next_message_id.fetch_add(1, Ordering::SeqCst);
                json!({
                    "type": "message_sent",
                    "message": {
                        "type": "message",
                        "id": id,
                        "content": payload.get("content").cloned().unwrap_or(Value::Null),
                        "sender_id": backend.behavior.sender_id,
                        "chat_id": chat_id,
                        "created_at": "2025-03-01T10:15:00.000000",
                    }
                })
            }
            Some("ping") => json!({"type": "pong"}),
            other => json!({"type": "error", "message": format!("Unknown message type: {other:?}")}),
        };
        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            return;
        }
    }
}

pub async fn spawn_backend(behavior: SocketBehavior) -> anyhow::Result<SpawnedBackend> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let backend = BackendDouble {
        upgrades: Arc::new(AtomicUsize::new(0)),
        tokens: Arc::new(Mutex::new(Vec::new())),
        received: Arc::new(Mutex::new(Vec::new())),
        issued_tokens: Arc::new(AtomicUsize::new(0)),
        next_message_id: Arc::new(AtomicI64::new(100)),
        behavior: Arc::new(behavior),
    };
    let app = Router::new()
        .route("/api/v1/auth/ws-token", get(issue_ws_token))
        .route("/ws/service-chats/:chat_id", get(chat_socket))
        .with_state(backend.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(SpawnedBackend {
        api_base_url: format!("http://{addr}/api/v1"),
        ws_base_url: format!("ws://{addr}"),
        backend,
    })
}

pub async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("channel event in time")
        .expect("channel event")
}

pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<ChannelEvent>,
    mut predicate: F,
) -> ChannelEvent
where
    F: FnMut(&ChannelEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}
