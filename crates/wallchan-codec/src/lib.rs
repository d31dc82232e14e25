//! Compact binary value codec and channel frames for wallchan.
//!
//! Layers, bottom up:
//!
//! - [`buffer`]: the [`Envelope`] handed to a transport and the cursor
//!   [`BufferWriter`] / [`BufferReader`] over it
//! - [`codec`]: tagged encoding of JSON-like [`Value`]s
//! - [`message`]: header/body frames for the channel protocol

pub mod buffer;
pub mod codec;
pub mod error;
pub mod message;
pub mod value;

pub use buffer::{BufferReader, BufferWriter, Envelope};
pub use codec::{decode, deserialize, encode, serialize, serialize_array, MAX_DEPTH};
pub use error::{CodecError, Result};
pub use message::{
    decode_message, encode_message, ErrorPayload, Message, Request, RequestId, Response,
};
pub use value::{from_value, to_value, Object, Value};
