//! Realtime notification stream modules.
//!
//! - `transport`: server-push connection primitive and the SSE implementation.
//! - `reconnect`: linear backoff and give-up decisions.
//! - `client`: connection state machine, reconnect timer, and subscribers.
//! - `proto`: event names and the notification payload schema.
//! - `registry`: explicit holder for the one shared client.

/// Stream client state machine and subscriber dispatch.
pub mod client;
/// Stream event names and payload decoding.
pub mod proto;
/// Reconnect backoff policy.
pub mod reconnect;
/// Shared client registry.
pub mod registry;
/// Server-push transports.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
