use std::fmt;

use wallchan_codec::{CodecError, ErrorPayload, Value};
use wallchan_transport::TransportError;

/// Error name used on the wire for cancellation.
pub const CANCELED_NAME: &str = "Canceled";

/// Error name used on the wire when a channel never got registered.
pub const UNKNOWN_CHANNEL_NAME: &str = "UnknownChannel";

/// A structured rejection raised by a remote channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<Vec<String>>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorPayload> for RemoteError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            name: payload.name,
            message: payload.message,
            stack: payload.stack,
        }
    }
}

impl From<RemoteError> for ErrorPayload {
    fn from(error: RemoteError) -> Self {
        Self {
            name: error.name,
            message: error.message,
            stack: error.stack,
        }
    }
}

/// Errors surfaced by channel calls, listens and registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The call was cancelled locally, or its client/connection went away.
    #[error("canceled")]
    Canceled,

    /// The remote channel rejected with a structured error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The remote channel rejected with a plain value.
    #[error("remote rejected with a {} value", .0.type_name())]
    Rejected(Value),

    /// Nobody registered the requested channel in time.
    #[error("{0}")]
    UnknownChannel(String),

    /// No live connection matched the requested context.
    #[error("no connection for context {0}")]
    NotFound(String),

    /// Encoding a frame or converting a typed value failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport refused a buffer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection announced a context that could not be decoded.
    #[error("invalid connection context: {0}")]
    InvalidContext(String),
}

impl ChannelError {
    /// Shorthand for a structured rejection from a channel implementation.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError::Remote(RemoteError::new(name, message))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ChannelError::Canceled)
    }

    /// Rebuild the caller-side error from a `PromiseError` body.
    pub(crate) fn from_payload(payload: ErrorPayload) -> Self {
        match payload.name.as_str() {
            CANCELED_NAME => ChannelError::Canceled,
            UNKNOWN_CHANNEL_NAME => ChannelError::UnknownChannel(payload.message),
            _ => ChannelError::Remote(payload.into()),
        }
    }
}

/// How a failed call is reported to the remote caller.
pub(crate) enum Rejection {
    Error(ErrorPayload),
    Value(Value),
}

impl From<ChannelError> for Rejection {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Rejected(value) => Rejection::Value(value),
            ChannelError::Remote(remote) => Rejection::Error(remote.into()),
            ChannelError::Canceled => {
                Rejection::Error(ErrorPayload::new(CANCELED_NAME, CANCELED_NAME))
            }
            ChannelError::UnknownChannel(message) => {
                Rejection::Error(ErrorPayload::new(UNKNOWN_CHANNEL_NAME, message))
            }
            other => Rejection::Error(ErrorPayload::new("Error", other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
