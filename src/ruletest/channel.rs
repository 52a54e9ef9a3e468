//! Live channel to a single remote observer of a test run.
//!
//! A [`LiveChannel`] is a cheap, cloneable sending handle. The transport
//! (a WebSocket in the server) owns the receiving end and marks the channel
//! closed when the observer goes away. Sends on a closed channel are dropped.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::telemetry::TelemetrySample;

/// Envelope sent to live observers: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Host CPU / memory utilization.
    Stats(TelemetrySample),
    /// Cleaned engine stdout.
    Result(String),
    /// Engine stderr (progress logging).
    Progress(String),
}

impl StreamEvent {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "failed to encode stream event");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveChannel {
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl LiveChannel {
    /// Create a channel and the receiving end the transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Send an event. Returns `false` if the channel is closed.
    pub fn send(&self, event: &StreamEvent) -> bool {
        match event.to_json() {
            Some(text) => self.send_text(text),
            None => self.is_open(),
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(text).is_ok()
    }

    /// Mark the channel closed. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token that closes this channel when cancelled, for the transport's
    /// read side. Holding it does not keep the channel's sender alive.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolves once the channel is closed, either explicitly or because
    /// the receiving end was dropped.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}
