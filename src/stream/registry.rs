//! Process-wide access to one shared [`StreamClient`].
//!
//! The registry is created by application bootstrap code and passed to
//! whatever needs the client; there is no hidden global.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::stream::client::StreamClient;

type ClientFactory = Box<dyn Fn() -> StreamClient + Send + Sync>;

/// Holds at most one live [`StreamClient`], created on first use.
pub struct StreamClientRegistry {
    factory: ClientFactory,
    slot: Mutex<Option<StreamClient>>,
}

impl StreamClientRegistry {
    pub fn new(factory: impl Fn() -> StreamClient + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    /// Returns the shared client, creating it if needed.
    ///
    /// Every caller gets a handle to the same instance until [`reset`] runs.
    ///
    /// [`reset`]: StreamClientRegistry::reset
    pub fn get(&self) -> StreamClient {
        self.slot()
            .get_or_insert_with(|| {
                debug!(event = "stream_registry_create");
                (self.factory)()
            })
            .clone()
    }

    /// Returns the shared client without creating one.
    pub fn current(&self) -> Option<StreamClient> {
        self.slot().clone()
    }

    /// Disconnects and discards the shared client.
    ///
    /// The next [`get`](StreamClientRegistry::get) builds a fresh instance.
    pub fn reset(&self) {
        let previous = self.slot().take();
        if let Some(client) = previous {
            debug!(event = "stream_registry_reset", state = %client.state());
            client.disconnect();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<StreamClient>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StreamClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClientRegistry")
            .field("current", &self.current())
            .finish()
    }
}
