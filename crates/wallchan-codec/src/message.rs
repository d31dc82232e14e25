//! Channel frames: a header tuple plus a body value in one envelope.
//!
//! | Kind | Header |
//! |---|---|
//! | Promise | `[100, id, channel, method]` |
//! | PromiseCancel | `[101, id]` |
//! | EventListen | `[102, id, channel, event]` |
//! | EventDispose | `[103, id]` |
//! | Initialize | `[200]` |
//! | PromiseSuccess | `[201, id]` |
//! | PromiseError | `[202, id]` |
//! | PromiseErrorObj | `[203, id]` |
//! | EventFire | `[204, id]` |
//!
//! Kinds without a payload carry an `Undefined` body.

use crate::buffer::{BufferReader, BufferWriter, Envelope};
use crate::codec::{deserialize, serialize, serialize_array};
use crate::error::{CodecError, Result};
use crate::value::{Object, Value};

/// Request ids are allocated by the calling side and never reused.
pub type RequestId = u64;

/// Numeric message kinds, the first header element.
pub mod kind {
    pub const PROMISE: i64 = 100;
    pub const PROMISE_CANCEL: i64 = 101;
    pub const EVENT_LISTEN: i64 = 102;
    pub const EVENT_DISPOSE: i64 = 103;

    pub const INITIALIZE: i64 = 200;
    pub const PROMISE_SUCCESS: i64 = 201;
    pub const PROMISE_ERROR: i64 = 202;
    pub const PROMISE_ERROR_OBJ: i64 = 203;
    pub const EVENT_FIRE: i64 = 204;
}

/// Sent by a channel client.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Promise {
        id: RequestId,
        channel: String,
        method: String,
        arg: Value,
    },
    PromiseCancel {
        id: RequestId,
    },
    EventListen {
        id: RequestId,
        channel: String,
        event: String,
        arg: Value,
    },
    EventDispose {
        id: RequestId,
    },
}

impl Request {
    pub fn id(&self) -> RequestId {
        match self {
            Request::Promise { id, .. }
            | Request::PromiseCancel { id }
            | Request::EventListen { id, .. }
            | Request::EventDispose { id } => *id,
        }
    }

    /// Channel addressed by the request, if it addresses one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Request::Promise { channel, .. } | Request::EventListen { channel, .. } => {
                Some(channel)
            }
            _ => None,
        }
    }
}

/// Sent by a channel server.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Initialize,
    PromiseSuccess { id: RequestId, data: Value },
    PromiseError { id: RequestId, error: ErrorPayload },
    PromiseErrorObj { id: RequestId, error: Value },
    EventFire { id: RequestId, data: Value },
}

/// Any frame seen on a connection. Both halves of a connection share one
/// transport, so each half picks out the variant it handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Structured rejection carried by `PromiseError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    /// One entry per stack line.
    pub stack: Option<Vec<String>>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stack = Some(stack.into_iter().map(Into::into).collect());
        self
    }

    /// `{ message, name, stack? }`
    pub fn to_value(&self) -> Value {
        let mut map = Object::new();
        map.insert("message".into(), self.message.as_str().into());
        map.insert("name".into(), self.name.as_str().into());
        if let Some(stack) = &self.stack {
            map.insert(
                "stack".into(),
                stack.iter().map(|line| Value::from(line.as_str())).collect(),
            );
        }
        Value::Object(map)
    }

    /// Lenient inverse of [`to_value`](Self::to_value): missing fields fall
    /// back to `"Error"` and an empty message, a string stack is split into
    /// lines.
    pub fn from_value(value: &Value) -> Self {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Error")
            .to_owned();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let stack = match value.get("stack") {
            Some(Value::Array(lines)) => Some(
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect(),
            ),
            Some(Value::String(text)) => Some(text.lines().map(str::to_owned).collect()),
            _ => None,
        };
        Self {
            name,
            message,
            stack,
        }
    }
}

/// Encode a frame into one envelope.
pub fn encode_message(message: &Message) -> Result<Envelope> {
    match message {
        Message::Request(request) => request.encode(),
        Message::Response(response) => response.encode(),
    }
}

/// Decode one envelope into a frame.
pub fn decode_message(envelope: impl Into<Envelope>) -> Result<Message> {
    let mut reader = BufferReader::new(envelope);
    let header = deserialize(&mut reader)?;
    let body = if reader.is_empty() {
        Value::Undefined
    } else {
        deserialize(&mut reader)?
    };
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }

    let Value::Array(header) = header else {
        return Err(CodecError::InvalidHeader(format!(
            "expected array, found {}",
            header.type_name()
        )));
    };
    let mut fields = HeaderFields::new(header);
    let code = fields.int("kind")?;

    let message = match code {
        kind::PROMISE => Request::Promise {
            id: fields.id()?,
            channel: fields.string("channel")?,
            method: fields.string("method")?,
            arg: body,
        }
        .into(),
        kind::PROMISE_CANCEL => Request::PromiseCancel { id: fields.id()? }.into(),
        kind::EVENT_LISTEN => Request::EventListen {
            id: fields.id()?,
            channel: fields.string("channel")?,
            event: fields.string("event")?,
            arg: body,
        }
        .into(),
        kind::EVENT_DISPOSE => Request::EventDispose { id: fields.id()? }.into(),
        kind::INITIALIZE => Response::Initialize.into(),
        kind::PROMISE_SUCCESS => Response::PromiseSuccess {
            id: fields.id()?,
            data: body,
        }
        .into(),
        kind::PROMISE_ERROR => Response::PromiseError {
            id: fields.id()?,
            error: ErrorPayload::from_value(&body),
        }
        .into(),
        kind::PROMISE_ERROR_OBJ => Response::PromiseErrorObj {
            id: fields.id()?,
            error: body,
        }
        .into(),
        kind::EVENT_FIRE => Response::EventFire {
            id: fields.id()?,
            data: body,
        }
        .into(),
        other => {
            return Err(CodecError::InvalidHeader(format!("unknown message kind {other}")));
        }
    };
    Ok(message)
}

impl Request {
    /// Encode without copying the argument.
    pub fn encode(&self) -> Result<Envelope> {
        match self {
            Request::Promise {
                id,
                channel,
                method,
                arg,
            } => write_frame(
                &[
                    Value::Int(kind::PROMISE),
                    id_value(*id),
                    channel.as_str().into(),
                    method.as_str().into(),
                ],
                arg,
            ),
            Request::PromiseCancel { id } => write_frame(
                &[Value::Int(kind::PROMISE_CANCEL), id_value(*id)],
                &Value::Undefined,
            ),
            Request::EventListen {
                id,
                channel,
                event,
                arg,
            } => write_frame(
                &[
                    Value::Int(kind::EVENT_LISTEN),
                    id_value(*id),
                    channel.as_str().into(),
                    event.as_str().into(),
                ],
                arg,
            ),
            Request::EventDispose { id } => write_frame(
                &[Value::Int(kind::EVENT_DISPOSE), id_value(*id)],
                &Value::Undefined,
            ),
        }
    }
}

impl Response {
    /// Encode without copying the payload.
    pub fn encode(&self) -> Result<Envelope> {
        match self {
            Response::Initialize => {
                write_frame(&[Value::Int(kind::INITIALIZE)], &Value::Undefined)
            }
            Response::PromiseSuccess { id, data } => {
                write_frame(&[Value::Int(kind::PROMISE_SUCCESS), id_value(*id)], data)
            }
            Response::PromiseError { id, error } => write_frame(
                &[Value::Int(kind::PROMISE_ERROR), id_value(*id)],
                &error.to_value(),
            ),
            Response::PromiseErrorObj { id, error } => {
                write_frame(&[Value::Int(kind::PROMISE_ERROR_OBJ), id_value(*id)], error)
            }
            Response::EventFire { id, data } => {
                write_frame(&[Value::Int(kind::EVENT_FIRE), id_value(*id)], data)
            }
        }
    }
}

fn id_value(id: RequestId) -> Value {
    Value::Int(id as i64)
}

/// Header array then body, both serialized from borrowed values.
fn write_frame(header: &[Value], body: &Value) -> Result<Envelope> {
    let mut writer = BufferWriter::new();
    serialize_array(&mut writer, header)?;
    serialize(&mut writer, body)?;
    Ok(writer.finish())
}

/// Positional access to header elements with shape errors.
struct HeaderFields {
    fields: std::vec::IntoIter<Value>,
}

impl HeaderFields {
    fn new(fields: Vec<Value>) -> Self {
        Self {
            fields: fields.into_iter(),
        }
    }

    fn next(&mut self, name: &str) -> Result<Value> {
        self.fields
            .next()
            .ok_or_else(|| CodecError::InvalidHeader(format!("missing {name}")))
    }

    fn int(&mut self, name: &str) -> Result<i64> {
        match self.next(name)? {
            Value::Int(n) => Ok(n),
            other => Err(CodecError::InvalidHeader(format!(
                "{name} must be an integer, found {}",
                other.type_name()
            ))),
        }
    }

    fn id(&mut self) -> Result<RequestId> {
        let id = self.int("id")?;
        RequestId::try_from(id)
            .map_err(|_| CodecError::InvalidHeader(format!("negative request id {id}")))
    }

    fn string(&mut self, name: &str) -> Result<String> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            other => Err(CodecError::InvalidHeader(format!(
                "{name} must be a string, found {}",
                other.type_name()
            ))),
        }
    }
}
