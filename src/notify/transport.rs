//! Subscriber transports

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Outbound half of a subscriber connection
///
/// Implementations must deliver payloads in the order `send` is called.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier of this connection
    fn id(&self) -> &str;

    /// Deliver one serialized event
    async fn send(&self, payload: &str) -> Result<()>;

    /// Close the connection; further sends fail
    async fn close(&self);
}

/// Transport backed by a bounded queue drained by a single writer task
///
/// The receiving half is handed to whoever owns the socket (the WebSocket
/// handler), which writes payloads out in queue order. A full queue makes
/// `send` wait, so a slow consumer runs into the hub's send timeout.
pub struct ChannelTransport {
    id: String,
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelTransport {
    /// Create a transport and the queue its writer task should drain
    #[must_use]
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: id.into(),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &str) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(Error::Internal(format!("transport '{}' is closed", self.id)));
        };

        tx.send(payload.to_string())
            .await
            .map_err(|_| Error::Internal(format!("transport '{}' writer has gone away", self.id)))
    }

    async fn close(&self) {
        // Dropping the sender ends the writer task once the queue drains
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
