/// Errors that can occur while encoding or decoding values and frames.
///
/// Any decode error means the byte stream can no longer be trusted; callers
/// treat it as fatal for the connection that produced it.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input (needed {needed} bytes, {remaining} remaining)")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A value started with a tag this codec does not know.
    #[error("unknown value tag {0}")]
    UnknownTag(u8),

    /// A string value was not valid UTF-8.
    #[error("string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A varint ran past 10 bytes or overflowed 64 bits.
    #[error("varint overflows 64 bits")]
    VarintOverflow,

    /// Values were nested deeper than the codec allows.
    #[error("nesting deeper than {max} levels")]
    DepthExceeded { max: usize },

    /// A single-value buffer had bytes left over after the value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// A frame header did not have the shape its kind requires.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// Conversion between a typed value and the codec's value model failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
