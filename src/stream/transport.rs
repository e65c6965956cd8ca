//! Server-push transport used by the stream client.
//!
//! A transport opens exactly one connection per [`EventTransport::open`] call
//! and reports what happens on it through a [`SignalSink`]. It never retries:
//! reconnect decisions belong to the stream client.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, COOKIE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tracing::{debug, warn};

use crate::config::PortalConfig;
use crate::stream::client::StreamClientError;

/// Event name used for frames without an `event:` field.
const DEFAULT_EVENT_NAME: &str = "message";

/// Lifecycle and message signals emitted by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Opened,
    Errored,
    Message { name: String, data: String },
}

/// Receives signals for one transport connection, in arrival order.
pub type SignalSink = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// Opens server-push connections.
///
/// `open` must not invoke `sink` before it returns. It fails only when the
/// connection cannot be started at all; failures of a started connection are
/// reported later as [`TransportSignal::Errored`].
pub trait EventTransport: Send + Sync + 'static {
    fn open(&self, url: &str, sink: SignalSink) -> Result<TransportHandle, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no tokio runtime to drive the connection: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Owner handle of one open transport connection.
///
/// Closing is idempotent and also happens on drop.
pub struct TransportHandle {
    closed: Arc<AtomicBool>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportHandle {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Server-Sent Events transport over `reqwest`.
///
/// Each connection runs on its own tokio task; closing the handle aborts it.
#[derive(Clone)]
pub struct SseTransport {
    http: Client,
    headers: HeaderMap,
    idle_timeout: Option<Duration>,
}

impl SseTransport {
    /// Builds a transport carrying the configured session cookie.
    ///
    /// Fails when the HTTP client cannot be built or the cookie is not a
    /// valid header value.
    pub fn new(config: &PortalConfig) -> Result<Self, StreamClientError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(StreamClientError::Http)?;
        Ok(Self {
            http,
            headers: stream_headers(config.session_cookie.as_ref())?,
            idle_timeout: config.idle_timeout,
        })
    }
}

fn stream_headers(session_cookie: Option<&SecretString>) -> Result<HeaderMap, StreamClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(cookie) = session_cookie {
        let mut value = HeaderValue::from_str(cookie.expose_secret())?;
        value.set_sensitive(true);
        headers.insert(COOKIE, value);
    }
    Ok(headers)
}

impl EventTransport for SseTransport {
    fn open(&self, url: &str, sink: SignalSink) -> Result<TransportHandle, TransportError> {
        let runtime = Handle::try_current()?;
        let url = url.to_string();
        let transport = self.clone();
        let task = runtime.spawn(async move {
            run_event_stream(transport, url, sink).await;
        });
        Ok(TransportHandle::new(move || task.abort()))
    }
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("session_cookie", &self.headers.contains_key(COOKIE))
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

async fn run_event_stream(transport: SseTransport, url: String, sink: SignalSink) {
    let request = transport.http.get(&url).headers(transport.headers.clone());
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(event = "stream_request_failed", url = %url, error = %err);
            sink(TransportSignal::Errored);
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!(event = "stream_http_status", url = %url, status = status.as_u16());
        sink(TransportSignal::Errored);
        return;
    }

    sink(TransportSignal::Opened);

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    loop {
        let next = match transport.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        event = "stream_idle_timeout",
                        idle_ms = idle.as_millis() as u64
                    );
                    sink(TransportSignal::Errored);
                    return;
                }
            },
            None => body.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.feed(&chunk) {
                    sink(TransportSignal::Message {
                        name: frame.name,
                        data: frame.data,
                    });
                }
            }
            Some(Err(err)) => {
                warn!(event = "stream_body_error", error = %err);
                sink(TransportSignal::Errored);
                return;
            }
            None => {
                debug!(event = "stream_body_ended", url = %url);
                sink(TransportSignal::Errored);
                return;
            }
        }
    }
}

/// One dispatched Server-Sent Events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub name: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event_name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds a chunk and returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `id` and `retry` are ignored: reconnect timing is owned by the
            // stream client.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let name = self.event_name.take();
        let data = std::mem::take(&mut self.data);
        if name.is_none() && data.is_empty() {
            return None;
        }
        Some(SseFrame {
            name: name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: data.join("\n"),
        })
    }
}
