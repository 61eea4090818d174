//! Client-side session resilience and realtime sync.
//!
//! [`SessionGateway`] runs every REST call through a refresh-and-replay path
//! with at most one refresh in flight. [`Channel`] manages one chat socket with
//! close-code aware reconnects, and [`ChatSession`] reconciles what that socket
//! delivers into a [`MessageTimeline`].

mod api;
pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod single_flight;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use channel::{
    realtime_url, Channel, ChannelEndpoint, ChannelEvent, ChannelOptions, ChannelState,
    ChatEndpoint, ReconnectPolicy, StaticEndpoint,
};
pub use chat::{ChatEvent, ChatSession, MAX_MESSAGE_CHARS};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use error::{ChatError, SessionError};
pub use reconcile::{MessageTimeline, Reconciliation, TimelineEntry};
pub use session::{ApiRequest, ApiResponse, SessionGateway, SessionStatus};
