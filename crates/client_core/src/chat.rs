//! One open chat view: the realtime channel plus its reconciled timeline.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    protocol::{ChatMessage, InboundFrame, OutboundFrame},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, ChannelEvent},
    error::{ChatError, SessionError},
    reconcile::{MessageTimeline, Reconciliation, TimelineEntry},
    session::SessionGateway,
};

/// Longest message body the backend accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The timeline gained, replaced or retired an entry.
    TimelineChanged,
    Connected,
    Disconnected { reconnecting: bool },
    /// An `error` frame from the server.
    ServerError(String),
    /// The channel could not be pointed anywhere (credential fetch failed).
    Unavailable(String),
    /// Frames were dropped before reaching the timeline; re-fetch the history.
    ResyncNeeded,
}

pub struct ChatSession {
    chat_id: ChatId,
    user_id: UserId,
    channel: Channel,
    timeline: Arc<Mutex<MessageTimeline>>,
    events: broadcast::Sender<ChatEvent>,
    pump: JoinHandle<()>,
}

impl ChatSession {
    /// Seeds the timeline from `history` and starts connecting `channel`.
    pub fn open(
        channel: Channel,
        chat_id: ChatId,
        user_id: UserId,
        history: Vec<ChatMessage>,
    ) -> Self {
        let timeline = Arc::new(Mutex::new(MessageTimeline::from_history(history)));
        let (events, _) = broadcast::channel(256);
        let pump = tokio::spawn(pump_channel_events(
            chat_id,
            channel.subscribe_events(),
            Arc::clone(&timeline),
            events.clone(),
        ));
        channel.connect();
        Self {
            chat_id,
            user_id,
            channel,
            timeline,
            events,
            pump,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Shows `content` immediately as a provisional entry and transmits it.
    /// Returns the provisional id.
    pub async fn send_text(&self, content: &str) -> Result<MessageId, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong {
                max: MAX_MESSAGE_CHARS,
            });
        }

        // Held across the send so the acknowledgment cannot be applied before
        // its provisional entry exists.
        let mut timeline = self.timeline.lock().await;
        let frame = OutboundFrame::Message {
            content: content.to_string(),
        };
        if !self.channel.send(&frame) {
            return Err(ChatError::NotConnected);
        }
        let id = timeline.push_provisional(self.chat_id, self.user_id, content, Utc::now());
        drop(timeline);

        let _ = self.events.send(ChatEvent::TimelineChanged);
        Ok(id)
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.timeline.lock().await.messages()
    }

    pub async fn entries(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.entries().to_vec()
    }

    pub async fn pending_count(&self) -> usize {
        self.timeline.lock().await.pending_count()
    }

    /// Installs a re-fetched history, keeping local entries it does not confirm.
    pub async fn replace_history(&self, history: Vec<ChatMessage>) {
        self.timeline.lock().await.replace_history(history);
        let _ = self.events.send(ChatEvent::TimelineChanged);
    }

    /// Re-fetches the chat detail and installs its messages.
    pub async fn resync(
        &self,
        gateway: &SessionGateway,
        kind: ChatKind,
    ) -> Result<(), SessionError> {
        let detail = gateway.chat_detail(kind, self.chat_id).await?;
        self.replace_history(detail.messages).await;
        Ok(())
    }

    /// Tears the channel down. The timeline stays readable.
    pub fn close(&self) {
        self.channel.disconnect();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.channel.disconnect();
        self.pump.abort();
    }
}

async fn pump_channel_events(
    chat_id: ChatId,
    mut channel_events: broadcast::Receiver<ChannelEvent>,
    timeline: Arc<Mutex<MessageTimeline>>,
    events: broadcast::Sender<ChatEvent>,
) {
    loop {
        let event = match channel_events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(chat_id = chat_id.0, skipped, "chat: channel events lagged");
                let _ = events.send(ChatEvent::ResyncNeeded);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let chat_event = match event {
            ChannelEvent::Opened => ChatEvent::Connected,
            ChannelEvent::Closed { reconnecting, .. } => ChatEvent::Disconnected { reconnecting },
            ChannelEvent::EndpointFailed(reason) => ChatEvent::Unavailable(reason),
            ChannelEvent::Frame(InboundFrame::Error { message }) => ChatEvent::ServerError(
                message.unwrap_or_else(|| "unknown server error".to_string()),
            ),
            ChannelEvent::Frame(frame) => {
                let decision = timeline.lock().await.apply_frame(&frame);
                match decision {
                    None | Some(Reconciliation::Duplicate) => continue,
                    Some(decision) => {
                        debug!(chat_id = chat_id.0, ?decision, "chat: timeline updated");
                        ChatEvent::TimelineChanged
                    }
                }
            }
        };
        let _ = events.send(chat_event);
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
