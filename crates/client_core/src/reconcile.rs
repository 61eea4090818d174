//! Message reconciliation.
//!
//! The timeline is append-ordered by arrival. Entries shown before the server
//! confirmed them are explicitly tagged provisional; ids at or above
//! [`PROVISIONAL_ID_FLOOR`] are also treated as provisional so histories built
//! from untagged local entries still reconcile.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatMessage, InboundFrame},
};

/// Millisecond timestamps are above this; server ids are not expected to reach it.
pub const PROVISIONAL_ID_FLOOR: i64 = 1_000_000_000_000;

/// How far the server clock may lag ours when matching a re-fetched history
/// against still-pending local entries.
const HISTORY_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    provisional: bool,
}

impl TimelineEntry {
    pub fn confirmed(message: ChatMessage) -> Self {
        Self {
            message,
            provisional: false,
        }
    }

    pub fn provisional(message: ChatMessage) -> Self {
        Self {
            message,
            provisional: true,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional || self.message.id.0 >= PROVISIONAL_ID_FLOOR
    }

    fn stands_in_for(&self, confirmed: &ChatMessage) -> bool {
        self.is_provisional()
            && self.message.content == confirmed.content
            && self.message.sender_id == confirmed.sender_id
    }
}

/// Incoming events the policy understands.
#[derive(Debug, Clone, Copy)]
pub enum Incoming<'a> {
    /// Fan-out of a persisted message.
    Broadcast(&'a ChatMessage),
    /// The server confirming this client's own message.
    Acknowledged(&'a ChatMessage),
}

impl<'a> Incoming<'a> {
    pub fn from_frame(frame: &'a InboundFrame) -> Option<Self> {
        match frame {
            InboundFrame::Message(message) => Some(Incoming::Broadcast(message)),
            InboundFrame::MessageSent { message } => Some(Incoming::Acknowledged(message)),
            _ => None,
        }
    }

    fn message(&self) -> &'a ChatMessage {
        match self {
            Incoming::Broadcast(message) | Incoming::Acknowledged(message) => message,
        }
    }
}

/// What applying an event does to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Server id already present and nothing provisional to retire.
    Duplicate,
    Append,
    /// The provisional entry at `index` becomes the confirmed message.
    Replace { index: usize },
    /// Server id already present; the stale provisional at `index` goes away.
    Retire { index: usize },
}

/// Decides how `incoming` merges into `entries`. Pure.
pub fn decide(entries: &[TimelineEntry], incoming: Incoming<'_>) -> Reconciliation {
    let message = incoming.message();
    let already_present = entries
        .iter()
        .any(|entry| !entry.is_provisional() && entry.message.id == message.id);

    match incoming {
        Incoming::Broadcast(_) if already_present => Reconciliation::Duplicate,
        Incoming::Broadcast(_) => Reconciliation::Append,
        Incoming::Acknowledged(_) => {
            let stand_in = entries
                .iter()
                .position(|entry| entry.stands_in_for(message));
            match (stand_in, already_present) {
                (Some(index), true) => Reconciliation::Retire { index },
                (Some(index), false) => Reconciliation::Replace { index },
                (None, true) => Reconciliation::Duplicate,
                (None, false) => Reconciliation::Append,
            }
        }
    }
}

/// The ordered, de-duplicated message list of one chat view.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    entries: Vec<TimelineEntry>,
    last_local_id: i64,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(history: Vec<ChatMessage>) -> Self {
        let mut timeline = Self::new();
        timeline.replace_history(history);
        timeline
    }

    /// Installs a freshly fetched history. A provisional entry is dropped when
    /// the history holds a matching message from the same sender that is not
    /// older than it; the rest stay pending at the tail.
    pub fn replace_history(&mut self, history: Vec<ChatMessage>) {
        let pending: Vec<TimelineEntry> = self
            .entries
            .drain(..)
            .filter(TimelineEntry::is_provisional)
            .collect();

        for message in history {
            let incoming = Incoming::Broadcast(&message);
            if decide(&self.entries, incoming) == Reconciliation::Append {
                self.entries.push(TimelineEntry::confirmed(message));
            }
        }
        let mut claimed = HashSet::new();
        for entry in pending {
            let skew = Duration::seconds(HISTORY_CLOCK_SKEW_SECS);
            let confirmation = self
                .entries
                .iter()
                .find(|existing| {
                    !existing.is_provisional()
                        && !claimed.contains(&existing.message.id)
                        && entry.stands_in_for(&existing.message)
                        && existing.message.created_at + skew >= entry.message.created_at
                })
                .map(|existing| existing.message.id);
            match confirmation {
                Some(id) => {
                    claimed.insert(id);
                }
                None => self.entries.push(entry),
            }
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_provisional()).count()
    }

    /// Appends an optimistic entry and returns its local id.
    pub fn push_provisional(
        &mut self,
        chat_id: ChatId,
        sender_id: UserId,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> MessageId {
        let local_id = now
            .timestamp_millis()
            .max(self.last_local_id + 1)
            .max(PROVISIONAL_ID_FLOOR);
        self.last_local_id = local_id;

        let id = MessageId(local_id);
        self.entries.push(TimelineEntry::provisional(ChatMessage {
            id,
            content: content.into(),
            sender_id,
            chat_id,
            created_at: now,
        }));
        id
    }

    pub fn apply(&mut self, incoming: Incoming<'_>) -> Reconciliation {
        let decision = decide(&self.entries, incoming);
        match decision {
            Reconciliation::Duplicate => {}
            Reconciliation::Append => self
                .entries
                .push(TimelineEntry::confirmed(incoming.message().clone())),
            Reconciliation::Replace { index } => {
                self.entries[index] = TimelineEntry::confirmed(incoming.message().clone());
            }
            Reconciliation::Retire { index } => {
                self.entries.remove(index);
            }
        }
        decision
    }

    /// Applies a raw inbound frame; frames that carry no message are ignored.
    pub fn apply_frame(&mut self, frame: &InboundFrame) -> Option<Reconciliation> {
        Incoming::from_frame(frame).map(|incoming| self.apply(incoming))
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
