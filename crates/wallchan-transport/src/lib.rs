//! Message-passing transports for wallchan.
//!
//! This is the lowest layer. It knows nothing about channels or values: it
//! moves opaque byte buffers between two processes and tells the layers above
//! when a peer is gone.
//!
//! - [`MessagePassingProtocol`]: the contract everything above depends on
//! - [`MemoryProtocol`]: in-process pairs
//! - [`StreamProtocol`] + [`UnixDomainSocket`]: framed Unix sockets
//! - [`PeerHub`]: per-peer protocols over a shared fan-out host primitive

pub mod error;
pub mod event;
pub mod framing;
pub mod hub;
pub mod memory;
pub mod protocol;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use event::{Emitter, Listener, Subscription, WeakEmitter};
pub use framing::{FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD};
pub use hub::{HubEvent, PeerHub, PeerId, PeerSender};
pub use memory::MemoryProtocol;
pub use protocol::{ClientConnection, MessagePassingProtocol, SharedProtocol};
pub use stream::StreamProtocol;

#[cfg(unix)]
pub use uds::{PeerCredentials, UnixDomainSocket};
