use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::stream::transport::{
    EventTransport, SignalSink, TransportError, TransportHandle, TransportSignal,
};

/// In-memory transport that records every `open` and lets tests emit
/// signals on any recorded connection.
#[derive(Default)]
pub(crate) struct MockTransport {
    connections: Mutex<Vec<MockConnection>>,
}

#[derive(Clone)]
pub(crate) struct MockConnection {
    url: String,
    sink: SignalSink,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub(crate) fn emit(&self, signal: TransportSignal) {
        (self.sink)(signal);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn open_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|connection| !connection.is_closed())
            .count()
    }

    pub(crate) fn connection(&self, index: usize) -> MockConnection {
        self.connections.lock().unwrap()[index].clone()
    }

    pub(crate) fn latest(&self) -> MockConnection {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened yet")
    }
}

impl EventTransport for MockTransport {
    fn open(&self, url: &str, sink: SignalSink) -> Result<TransportHandle, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        self.connections.lock().unwrap().push(MockConnection {
            url: url.to_string(),
            sink,
            closed: Arc::clone(&closed),
        });
        Ok(TransportHandle::new(move || closed.store(true, Ordering::SeqCst)))
    }
}

pub(crate) fn notification_payload(id: &str) -> String {
    format!(
        r#"{{"id":"{id}","category":"application_status","title":"Application updated","body":"Your housing assistance application moved to review.","isRead":false,"createdAt":"2026-03-01T09:30:00Z","linkTarget":"/applications/{id}"}}"#
    )
}
