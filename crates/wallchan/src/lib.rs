//! Host/front-end channel protocol for interactive wallpaper processes.
//!
//! The host process owns a [`ConnectionRegistry`](channel::ConnectionRegistry)
//! and serves channels to every connected front-end; each front-end connects
//! with an [`IpcClient`](channel::IpcClient), announces who it is, and serves
//! channels back.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-buffer transports (Unix sockets, in-memory pairs)
//! - [`codec`]: the compact value codec and channel frames
//! - [`channel`]: servers, clients, the registry and the front-end connector

/// Re-export transport types.
pub mod transport {
    pub use wallchan_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use wallchan_codec::*;
}

/// Re-export channel types.
pub mod channel {
    pub use wallchan_channel::*;
}
