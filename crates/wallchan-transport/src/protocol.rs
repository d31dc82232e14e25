use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::Subscription;

/// The minimal contract the channel layer needs from a transport.
///
/// One call to [`send`](Self::send) delivers one buffer to the remote side,
/// and each buffer arriving from the remote side is handed to every listener
/// registered with [`on_message`](Self::on_message). Implementations deliver
/// inbound buffers from a single task, in arrival order.
pub trait MessagePassingProtocol: Send + Sync + 'static {
    /// Queue `buffer` for delivery. Never blocks on acknowledgement.
    fn send(&self, buffer: Bytes) -> Result<()>;

    /// Observe buffers arriving from the remote side.
    fn on_message(&self, listener: Box<dyn Fn(Bytes) + Send + Sync>) -> Subscription;

    /// Tear the connection down. The disconnect signal of the owning
    /// [`ClientConnection`] fires once the transport has stopped.
    fn disconnect(&self);
}

/// Shared handle to a protocol implementation.
pub type SharedProtocol = Arc<dyn MessagePassingProtocol>;

/// A newly announced remote party.
#[derive(Clone)]
pub struct ClientConnection {
    /// Message passing bound to this party only.
    pub protocol: SharedProtocol,
    /// Cancelled once the party has disconnected.
    pub disconnected: CancellationToken,
    /// Transport-level label used in logs (peer id, socket credentials).
    pub label: String,
}

impl ClientConnection {
    pub fn new(
        protocol: SharedProtocol,
        disconnected: CancellationToken,
        label: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            disconnected,
            label: label.into(),
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("label", &self.label)
            .field("disconnected", &self.disconnected.is_cancelled())
            .finish()
    }
}
