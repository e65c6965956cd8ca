//! Lifecycle binding for a consuming component.
//!
//! A view that shows live notifications mounts the stream for as long as it
//! is on screen. Mounting connects; dropping the guard detaches the bridge
//! and disconnects.

use tracing::debug;

use crate::bridge::{BridgeAttachment, NotificationCacheBridge};
use crate::stream::client::{ConnectionState, StreamClient};

/// Guard that keeps a [`StreamClient`] connected while alive.
#[derive(Debug)]
pub struct MountedStream {
    client: StreamClient,
    attachment: Option<BridgeAttachment>,
}

impl MountedStream {
    /// Connects `client` for the lifetime of the guard.
    pub fn mount(client: StreamClient) -> Self {
        debug!(event = "stream_mount", endpoint = client.endpoint());
        client.connect();
        Self {
            client,
            attachment: None,
        }
    }

    /// Attaches `bridge` first so no event between connect and attach is lost.
    pub fn mount_with_bridge(client: StreamClient, bridge: &NotificationCacheBridge) -> Self {
        let attachment = bridge.attach(&client);
        let mut mounted = Self::mount(client);
        mounted.attachment = Some(attachment);
        mounted
    }

    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn unmount(self) {}
}

impl Drop for MountedStream {
    fn drop(&mut self) {
        debug!(event = "stream_unmount", endpoint = self.client.endpoint());
        self.attachment.take();
        self.client.disconnect();
    }
}
