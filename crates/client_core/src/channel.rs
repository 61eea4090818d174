//! Realtime channel: one managed WebSocket lifecycle bound to one chat.
//!
//! A channel owns at most one live transport handle. The handle's task holds
//! the channel's [`FlightPermit`] from `Connecting` until it observes the
//! close, so a redundant `connect()` can never open a second socket. Closes
//! are classified by code; normal closure (1000), policy violation (1008) and
//! abnormal closure without a close frame (1006) are never retried.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{
    domain::{ChatId, ChatKind},
    protocol::{InboundFrame, OutboundFrame},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    session::SessionGateway,
    single_flight::{FlightPermit, SingleFlight},
};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Closes that reconnecting cannot fix or that signal an intentional close.
pub fn suppresses_reconnect(code: u16) -> bool {
    matches!(
        code,
        CLOSE_NORMAL | CLOSE_ABNORMAL | CLOSE_POLICY_VIOLATION
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// Doubles per consecutive failed attempt up to `max`, with ±10% jitter.
    Jittered { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_millis(3000))
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(interval) => interval,
            ReconnectPolicy::Jittered { base, max } => {
                let base_ms = base.as_millis() as u64;
                let max_ms = (max.as_millis() as u64).max(base_ms);
                let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
                let delay_ms = base_ms.saturating_mul(pow).min(max_ms);
                let jitter_window = (delay_ms / 10).max(1);
                let jitter_offset = rand::rng().random_range(0..=(jitter_window * 2));
                Duration::from_millis(
                    delay_ms
                        .saturating_sub(jitter_window)
                        .saturating_add(jitter_offset),
                )
            }
        }
    }

    /// How long a connection must stay open before the attempt counter resets.
    pub fn stable_after(&self) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(interval) => interval,
            ReconnectPolicy::Jittered { base, .. } => base,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub reconnect: bool,
    pub policy: ReconnectPolicy,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            policy: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed {
        code: Option<u16>,
        reconnecting: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed { code: Option<u16>, reconnecting: bool },
    Frame(InboundFrame),
    /// The connection URL could not be produced (e.g. credential fetch failed).
    EndpointFailed(String),
}

/// Produces the URL for one connection attempt.
#[async_trait]
pub trait ChannelEndpoint: Send + Sync {
    /// `Ok(None)` (or an empty string) means there is nothing to connect to yet.
    async fn connection_url(&self) -> anyhow::Result<Option<String>>;
}

pub struct StaticEndpoint(pub String);

#[async_trait]
impl ChannelEndpoint for StaticEndpoint {
    async fn connection_url(&self) -> anyhow::Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// Chat socket authorized by a realtime credential fetched per attempt.
pub struct ChatEndpoint {
    ws_base_url: String,
    kind: ChatKind,
    chat_id: ChatId,
    gateway: Arc<SessionGateway>,
}

impl ChatEndpoint {
    pub fn new(
        ws_base_url: impl Into<String>,
        kind: ChatKind,
        chat_id: ChatId,
        gateway: Arc<SessionGateway>,
    ) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
            kind,
            chat_id,
            gateway,
        }
    }
}

#[async_trait]
impl ChannelEndpoint for ChatEndpoint {
    async fn connection_url(&self) -> anyhow::Result<Option<String>> {
        let token = self.gateway.realtime_token().await?;
        realtime_url(&self.ws_base_url, self.kind, self.chat_id, &token).map(Some)
    }
}

/// `<ws-base>/ws/<kind>/<chat_id>?token=<credential>`
pub fn realtime_url(
    ws_base_url: &str,
    kind: ChatKind,
    chat_id: ChatId,
    token: &str,
) -> anyhow::Result<String> {
    let mut url = url::Url::parse(&format!(
        "{}/ws/{}/{}",
        ws_base_url.trim_end_matches('/'),
        kind.path_segment(),
        chat_id
    ))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

struct LiveLink {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: oneshot::Sender<()>,
}

struct ChannelShared {
    label: String,
    endpoint: Arc<dyn ChannelEndpoint>,
    options: ChannelOptions,
    flight: SingleFlight<()>,
    should_reconnect: AtomicBool,
    failed_attempts: AtomicU32,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    link: Mutex<Option<LiveLink>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn new(
        label: impl Into<String>,
        endpoint: Arc<dyn ChannelEndpoint>,
        options: ChannelOptions,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(ChannelShared {
                label: label.into(),
                endpoint,
                options,
                flight: SingleFlight::new(),
                should_reconnect: AtomicBool::new(true),
                failed_attempts: AtomicU32::new(0),
                state,
                events,
                link: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
            }),
        }
    }

    pub fn for_chat(
        gateway: Arc<SessionGateway>,
        ws_base_url: impl Into<String>,
        kind: ChatKind,
        chat_id: ChatId,
        options: ChannelOptions,
    ) -> Self {
        let endpoint = ChatEndpoint::new(ws_base_url, kind, chat_id, gateway);
        Self::new(
            format!("{}/{}", kind.path_segment(), chat_id),
            Arc::new(endpoint),
            options,
        )
    }

    /// Starts a connection attempt. Returns false when one is already
    /// connecting or open, or the channel was torn down.
    pub fn connect(&self) -> bool {
        self.shared.start()
    }

    /// Transmits `frame` if the channel is open; otherwise drops it.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        if self.state() != ChannelState::Open {
            debug!(channel = %self.shared.label, "channel: dropping frame, not open");
            return false;
        }
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(channel = %self.shared.label, "channel: unserializable frame: {err}");
                return false;
            }
        };
        let link = lock(&self.shared.link);
        match link.as_ref() {
            Some(link) => link.outbound.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    pub fn ping(&self) -> bool {
        self.send(&OutboundFrame::Ping)
    }

    /// Terminal teardown: no further reconnects, pending timer cancelled,
    /// socket closed. Idempotent.
    pub fn disconnect(&self) {
        let was_live = self.shared.should_reconnect.swap(false, Ordering::SeqCst);
        if let Some(timer) = lock(&self.shared.reconnect_timer).take() {
            timer.abort();
            debug!(channel = %self.shared.label, "channel: cancelled pending reconnect");
        }
        if let Some(link) = lock(&self.shared.link).take() {
            let _ = link.shutdown.send(());
        }
        if was_live {
            info!(channel = %self.shared.label, "channel: torn down");
            self.shared.set_state(ChannelState::Closed {
                code: Some(CLOSE_NORMAL),
                reconnecting: false,
            });
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_torn_down(&self) -> bool {
        !self.shared.should_reconnect.load(Ordering::SeqCst)
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.shared.reconnect_timer)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ChannelShared {
    fn start(self: &Arc<Self>) -> bool {
        if !self.should_reconnect.load(Ordering::SeqCst) {
            debug!(channel = %self.label, "channel: connect ignored after teardown");
            return false;
        }
        let Some(permit) = self.flight.try_acquire() else {
            debug!(channel = %self.label, "channel: connect ignored, already active");
            return false;
        };
        self.set_state(ChannelState::Connecting);
        tokio::spawn(Arc::clone(self).run(permit));
        true
    }

    async fn run(self: Arc<Self>, permit: FlightPermit<()>) {
        let url = match self.endpoint.connection_url().await {
            Ok(Some(url)) if !url.trim().is_empty() => url,
            Ok(_) => {
                debug!(channel = %self.label, "channel: no connection url, staying idle");
                self.set_state(ChannelState::Idle);
                return;
            }
            Err(err) => {
                // Only a rejected session is final; anything else is retried.
                let terminal = err
                    .downcast_ref::<SessionError>()
                    .is_some_and(SessionError::is_terminal_auth_failure);
                warn!(channel = %self.label, terminal, "channel: could not resolve endpoint: {err:#}");
                let _ = self.events.send(ChannelEvent::EndpointFailed(format!("{err:#}")));
                self.finish(permit, None, !terminal);
                return;
            }
        };
        if !self.should_reconnect.load(Ordering::SeqCst) {
            return;
        }

        info!(channel = %self.label, "channel: connecting");
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(channel = %self.label, "channel: handshake failed: {err}");
                self.finish(permit, Some(CLOSE_ABNORMAL), true);
                return;
            }
        };
        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        // Teardown takes the same lock, so it either sees the link or stops us
        // from ever reporting Open.
        let installed = {
            let mut link = lock(&self.link);
            let live = self.should_reconnect.load(Ordering::SeqCst);
            if live {
                *link = Some(LiveLink {
                    outbound: outbound_tx,
                    shutdown: shutdown_tx,
                });
                self.set_state(ChannelState::Open);
                let _ = self.events.send(ChannelEvent::Opened);
            }
            live
        };
        if !installed {
            // Torn down while the handshake was in flight.
            let _ = writer.send(normal_close()).await;
            return;
        }
        info!(channel = %self.label, "channel: open");
        let opened_at = Instant::now();

        let code = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = writer.send(normal_close()).await;
                    break CLOSE_NORMAL;
                }
                Some(message) = outbound_rx.recv() => {
                    if let Err(err) = writer.send(message).await {
                        warn!(channel = %self.label, "channel: send failed: {err}");
                        break CLOSE_ABNORMAL;
                    }
                }
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or(CLOSE_NO_STATUS, |frame| u16::from(frame.code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(channel = %self.label, "channel: receive failed: {err}");
                        break CLOSE_ABNORMAL;
                    }
                    None => break CLOSE_ABNORMAL,
                },
            }
        };

        lock(&self.link).take();
        if opened_at.elapsed() >= self.options.policy.stable_after() {
            self.failed_attempts.store(0, Ordering::SeqCst);
        }
        self.finish(permit, Some(code), true);
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Unknown) => {
                debug!(channel = %self.label, "channel: ignoring unrecognized frame");
            }
            Ok(frame) => {
                let _ = self.events.send(ChannelEvent::Frame(frame));
            }
            Err(err) => {
                debug!(channel = %self.label, "channel: dropping malformed frame: {err}");
            }
        }
    }

    /// Records the close, releases the connection slot and decides on a
    /// reconnect.
    fn finish(self: &Arc<Self>, permit: FlightPermit<()>, code: Option<u16>, retryable: bool) {
        let reconnecting = retryable
            && self.options.reconnect
            && self.should_reconnect.load(Ordering::SeqCst)
            && !code.is_some_and(suppresses_reconnect);

        self.set_state(ChannelState::Closed { code, reconnecting });
        drop(permit);
        info!(channel = %self.label, code = ?code, reconnecting, "channel: closed");
        if reconnecting {
            self.schedule_reconnect();
        }
        let _ = self.events.send(ChannelEvent::Closed { code, reconnecting });
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.options.policy.delay(attempt);
        debug!(
            channel = %self.label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "channel: reconnect scheduled"
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.start();
            }
        });

        let mut slot = lock(&self.reconnect_timer);
        if !self.should_reconnect.load(Ordering::SeqCst) {
            timer.abort();
            return;
        }
        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
    }

    fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
