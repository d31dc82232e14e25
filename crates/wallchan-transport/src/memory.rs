use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::event::{Emitter, Subscription};
use crate::protocol::{ClientConnection, MessagePassingProtocol};

/// One end of an in-process message pipe.
///
/// Buffers sent on one end are delivered asynchronously, in order, to the
/// listeners of the other end. Buffers that arrive before anyone listens are
/// kept for the first listener.
pub struct MemoryProtocol {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Emitter<Bytes>,
    closed: CancellationToken,
}

impl MemoryProtocol {
    /// Create a connected pair. Must be called from within a tokio runtime.
    pub fn pair() -> (Arc<MemoryProtocol>, Arc<MemoryProtocol>) {
        let closed = CancellationToken::new();
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let left = Arc::new(MemoryProtocol {
            outbound: left_tx,
            inbound: Emitter::buffered(),
            closed: closed.clone(),
        });
        let right = Arc::new(MemoryProtocol {
            outbound: right_tx,
            inbound: Emitter::buffered(),
            closed,
        });

        spawn_pump(left_rx, right.inbound.clone(), right.closed.clone());
        spawn_pump(right_rx, left.inbound.clone(), left.closed.clone());

        (left, right)
    }

    /// Cancelled when either end disconnects.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wrap this end as a connection announcement for a registry.
    pub fn into_connection(self: Arc<Self>, label: impl Into<String>) -> ClientConnection {
        let closed = self.closed.clone();
        ClientConnection::new(self, closed, label)
    }
}

impl MessagePassingProtocol for MemoryProtocol {
    fn send(&self, buffer: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(buffer)
            .map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, listener: Box<dyn Fn(Bytes) + Send + Sync>) -> Subscription {
        self.inbound.subscribe(listener)
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}

fn spawn_pump(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    inbound: Emitter<Bytes>,
    closed: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    // Buffers sent before the close still go through.
                    rx.close();
                    while let Ok(buffer) = rx.try_recv() {
                        inbound.fire(buffer);
                    }
                    break;
                }
                buffer = rx.recv() => match buffer {
                    Some(buffer) => {
                        trace!(size = buffer.len(), "memory pipe delivered buffer");
                        inbound.fire(buffer);
                    }
                    None => break,
                },
            }
        }
        closed.cancel();
    });
}
