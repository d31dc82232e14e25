use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use wallchan_codec::Value;

use crate::error::ChannelError;

/// Result of a channel call.
pub type CallFuture = BoxFuture<'static, Result<Value, ChannelError>>;

/// Items pushed to a remote listener, one `EventFire` each.
pub type EventStream = BoxStream<'static, Value>;

/// A named capability served to remote callers.
///
/// `C` is the context the connection announced when it was established; the
/// server passes it to every call so one channel instance can serve many
/// connections.
pub trait ServerChannel<C>: Send + Sync + 'static {
    /// Start a call. `cancel` fires when the caller cancels or the
    /// connection goes away; honoring it is up to the implementation.
    fn call(&self, ctx: &C, command: &str, arg: Value, cancel: CancellationToken) -> CallFuture;

    /// Open an event subscription. The stream is dropped when the caller
    /// unsubscribes.
    fn listen(&self, ctx: &C, event: &str, arg: Value) -> Result<EventStream, ChannelError>;
}

/// Shared handle to a channel implementation.
pub type SharedChannel<C> = Arc<dyn ServerChannel<C>>;
