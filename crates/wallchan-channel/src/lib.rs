//! Remote calls and event subscriptions over a message-passing transport.
//!
//! A connection carries two independent halves. The [`ChannelServer`] serves
//! named [`ServerChannel`]s to the remote side; the [`ChannelClient`] calls the
//! remote side's channels through [`ChannelProxy`] handles. Front-ends use
//! [`IpcClient`] to announce themselves and get both halves; the host keeps a
//! [`ConnectionRegistry`] that does the same for every front-end, keyed by the
//! context each one announced.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures_util::FutureExt;
//! use tokio_util::sync::CancellationToken;
//! use wallchan_channel::{
//!     CallFuture, ChannelError, ConnectionRegistry, EventStream, ServerChannel,
//! };
//! use wallchan_codec::Value;
//!
//! struct Echo;
//!
//! impl ServerChannel<String> for Echo {
//!     fn call(&self, _: &String, _: &str, arg: Value, _: CancellationToken) -> CallFuture {
//!         async move { Ok(arg) }.boxed()
//!     }
//!
//!     fn listen(&self, _: &String, event: &str, _: Value) -> Result<EventStream, ChannelError> {
//!         Err(ChannelError::NotFound(event.to_string()))
//!     }
//! }
//!
//! # async fn run(path: &str) -> wallchan_channel::Result<()> {
//! let registry = ConnectionRegistry::<String>::default();
//! registry.register_channel("echo", Arc::new(Echo));
//! let socket = wallchan_transport::UnixDomainSocket::bind(path)?;
//! registry.serve(socket.serve(Default::default())).await.ok();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod registry;
pub mod server;

mod pending;
mod router;

pub use channel::{CallFuture, EventStream, ServerChannel, SharedChannel};
pub use client::{ChannelClient, ChannelProxy, RemoteEvent, RemoteEventStream};
pub use config::{ChannelConfig, RegistryConfig};
pub use connector::IpcClient;
pub use error::{ChannelError, RemoteError, Result};
pub use registry::{ConnectionContext, ConnectionRegistry};
pub use server::ChannelServer;
