//! Realtime notification client for the benefits portal.
//!
//! The crate is organized by concern:
//! - `stream`: server-sent event connection, reconnect policy, and the
//!   stream client state machine.
//! - `bridge`: applies pushed notifications to the UI query cache.
//! - `binding`: mount/unmount guard for consuming components.
//! - `api`: REST companion endpoints (unread count, mark as read).
//! - `config`: endpoint and timing configuration.
//! - `retry`: bounded retries for REST calls.

/// Notifications REST client.
pub mod api;
/// Component lifecycle binding.
pub mod binding;
/// Query cache bridge.
pub mod bridge;
/// Portal configuration and environment loading.
pub mod config;
/// Retry helpers for request/response calls.
pub mod retry;
/// Realtime stream client, transport, and protocol types.
pub mod stream;

pub use binding::MountedStream;
pub use bridge::{InMemoryCache, NotificationCacheBridge, QueryCache};
pub use config::PortalConfig;
pub use stream::client::{ConnectionState, StreamClient, StreamClientOptions};
pub use stream::proto::NotificationEvent;
pub use stream::registry::StreamClientRegistry;
