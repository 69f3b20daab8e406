//! Message envelope and typed payload records.
//!
//! Every exchange between workers is a [`Message`]: a type tag, an opaque
//! payload and a list of auxiliary binary segments. The tag alone decides how
//! the payload is read; segments are only touched by payload decoders.
//!
//! Payloads are JSON. Binary values ([`Value::Blob`]) are lifted out of the
//! JSON into the segment list and referenced by index, so large data never
//! goes through the JSON encoder.
//!
//! On a TCP connection each message travels as one frame:
//!
//! ```text
//! u32 frame_len | u64 id | u8 tag | u32 payload_len | payload
//!               | u32 segment_count | (u32 len | bytes)*
//! ```
//!
//! All integers are big-endian.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_types::error::{TandemError, TandemResult};
use tandem_types::ids::{ForkId, RRefId, WorkerId};
use tandem_types::value::{Stack, Value};

/// Current protocol version. Adding a message type bumps it.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire type tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ScriptCall = 0,
    ScriptRet = 1,
    PythonCall = 2,
    PythonRet = 3,
    ScriptRemoteCall = 4,
    PythonRemoteCall = 5,
    RemoteRet = 6,
    Exception = 7,
}

impl MessageType {
    /// Whether messages of this type are sent by a caller (as opposed to
    /// being a response).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::ScriptCall
                | MessageType::PythonCall
                | MessageType::ScriptRemoteCall
                | MessageType::PythonRemoteCall
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::ScriptCall,
            1 => MessageType::ScriptRet,
            2 => MessageType::PythonCall,
            3 => MessageType::PythonRet,
            4 => MessageType::ScriptRemoteCall,
            5 => MessageType::PythonRemoteCall,
            6 => MessageType::RemoteRet,
            7 => MessageType::Exception,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::ScriptCall => "SCRIPT_CALL",
            MessageType::ScriptRet => "SCRIPT_RET",
            MessageType::PythonCall => "PYTHON_CALL",
            MessageType::PythonRet => "PYTHON_RET",
            MessageType::ScriptRemoteCall => "SCRIPT_REMOTE_CALL",
            MessageType::PythonRemoteCall => "PYTHON_REMOTE_CALL",
            MessageType::RemoteRet => "REMOTE_RET",
            MessageType::Exception => "EXCEPTION",
        };
        f.write_str(s)
    }
}

/// The wire unit exchanged between workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    /// Large binary blocks kept beside the payload.
    pub segments: Vec<Bytes>,
    /// Request/response correlation id, assigned by the transport.
    pub id: u64,
}

impl Message {
    pub fn new(payload: Vec<u8>, segments: Vec<Bytes>, msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload,
            segments,
            id: 0,
        }
    }

    /// An `Exception` message carrying `text` as its UTF-8 payload.
    pub fn exception(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes(), Vec::new(), MessageType::Exception)
    }

    pub fn is_exception(&self) -> bool {
        self.msg_type == MessageType::Exception
    }

    /// The payload read as UTF-8 text (lossily).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    fn expect_type(&self, expected: MessageType) -> TandemResult<()> {
        if self.msg_type != expected {
            return Err(TandemError::Serialization(format!(
                "expected a {expected} message, got {}",
                self.msg_type
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Values on the wire
// ---------------------------------------------------------------------------

/// A [`Value`] with blobs replaced by segment indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum WireValue {
    None,
    Bool(bool),
    Int(i64),
    #[serde(with = "tandem_types::value::float_repr")]
    Float(f64),
    Str(String),
    List(Vec<WireValue>),
    Segment(usize),
}

fn lift(value: &Value, segments: &mut Vec<Bytes>) -> WireValue {
    match value {
        Value::None => WireValue::None,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(f) => WireValue::Float(*f),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::List(items) => WireValue::List(items.iter().map(|v| lift(v, segments)).collect()),
        Value::Blob(b) => {
            segments.push(b.clone());
            WireValue::Segment(segments.len() - 1)
        }
    }
}

fn restore(value: WireValue, segments: &[Bytes]) -> TandemResult<Value> {
    Ok(match value {
        WireValue::None => Value::None,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Float(f) => Value::Float(f),
        WireValue::Str(s) => Value::Str(s),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| restore(v, segments))
                .collect::<TandemResult<_>>()?,
        ),
        WireValue::Segment(idx) => Value::Blob(segments.get(idx).cloned().ok_or_else(|| {
            TandemError::Serialization(format!(
                "segment {idx} out of range ({} segments)",
                segments.len()
            ))
        })?),
    })
}

fn lift_stack(stack: &[Value], segments: &mut Vec<Bytes>) -> Vec<WireValue> {
    stack.iter().map(|v| lift(v, segments)).collect()
}

fn restore_stack(stack: Vec<WireValue>, segments: &[Bytes]) -> TandemResult<Stack> {
    stack.into_iter().map(|v| restore(v, segments)).collect()
}

// ---------------------------------------------------------------------------
// Payload records
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ScriptCallBody {
    schema: String,
    stack: Vec<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rref_id: Option<RRefId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fork_id: Option<ForkId>,
}

/// A built-in call: the operator's schema string and its bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub schema: String,
    pub stack: Stack,
}

impl ScriptCall {
    pub fn new(schema: impl Into<String>, stack: Stack) -> Self {
        Self {
            schema: schema.into(),
            stack,
        }
    }

    pub fn to_message(&self) -> TandemResult<Message> {
        let mut segments = Vec::new();
        let body = ScriptCallBody {
            schema: self.schema.clone(),
            stack: lift_stack(&self.stack, &mut segments),
            rref_id: None,
            fork_id: None,
        };
        Ok(Message::new(
            serde_json::to_vec(&body)?,
            segments,
            MessageType::ScriptCall,
        ))
    }

    pub fn from_message(message: &Message) -> TandemResult<Self> {
        message.expect_type(MessageType::ScriptCall)?;
        let body: ScriptCallBody = serde_json::from_slice(&message.payload)?;
        Ok(Self {
            schema: body.schema,
            stack: restore_stack(body.stack, &message.segments)?,
        })
    }
}

/// A built-in call whose result stays on the callee behind a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRemoteCall {
    pub schema: String,
    pub stack: Stack,
    pub rref_id: RRefId,
    pub fork_id: ForkId,
}

impl ScriptRemoteCall {
    pub fn new(schema: impl Into<String>, stack: Stack, rref_id: RRefId, fork_id: ForkId) -> Self {
        Self {
            schema: schema.into(),
            stack,
            rref_id,
            fork_id,
        }
    }

    pub fn to_message(&self) -> TandemResult<Message> {
        let mut segments = Vec::new();
        let body = ScriptCallBody {
            schema: self.schema.clone(),
            stack: lift_stack(&self.stack, &mut segments),
            rref_id: Some(self.rref_id),
            fork_id: Some(self.fork_id),
        };
        Ok(Message::new(
            serde_json::to_vec(&body)?,
            segments,
            MessageType::ScriptRemoteCall,
        ))
    }

    pub fn from_message(message: &Message) -> TandemResult<Self> {
        message.expect_type(MessageType::ScriptRemoteCall)?;
        let body: ScriptCallBody = serde_json::from_slice(&message.payload)?;
        let (Some(rref_id), Some(fork_id)) = (body.rref_id, body.fork_id) else {
            return Err(TandemError::Serialization(
                "remote call is missing its reference ids".to_string(),
            ));
        };
        Ok(Self {
            schema: body.schema,
            stack: restore_stack(body.stack, &message.segments)?,
            rref_id,
            fork_id,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RefIdsHeader {
    rref_id: RRefId,
    fork_id: ForkId,
}

/// An opaque-payload call whose result stays on the callee behind a
/// reference.
///
/// The payload is laid out as `u32 header_len | JSON ids | opaque bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct PythonRemoteCall {
    pub udf: Vec<u8>,
    pub rref_id: RRefId,
    pub fork_id: ForkId,
}

impl PythonRemoteCall {
    pub fn new(udf: Vec<u8>, rref_id: RRefId, fork_id: ForkId) -> Self {
        Self {
            udf,
            rref_id,
            fork_id,
        }
    }

    pub fn to_message(&self) -> TandemResult<Message> {
        let header = serde_json::to_vec(&RefIdsHeader {
            rref_id: self.rref_id,
            fork_id: self.fork_id,
        })?;
        let mut payload = Vec::with_capacity(4 + header.len() + self.udf.len());
        payload.put_u32(header.len() as u32);
        payload.extend_from_slice(&header);
        payload.extend_from_slice(&self.udf);
        Ok(Message::new(payload, Vec::new(), MessageType::PythonRemoteCall))
    }

    pub fn from_message(message: &Message) -> TandemResult<Self> {
        message.expect_type(MessageType::PythonRemoteCall)?;
        let mut buf = &message.payload[..];
        if buf.remaining() < 4 {
            return Err(TandemError::Serialization("truncated remote call".into()));
        }
        let header_len = buf.get_u32() as usize;
        if buf.remaining() < header_len {
            return Err(TandemError::Serialization("truncated remote call".into()));
        }
        let header: RefIdsHeader = serde_json::from_slice(&buf[..header_len])?;
        Ok(Self {
            udf: buf[header_len..].to_vec(),
            rref_id: header.rref_id,
            fork_id: header.fork_id,
        })
    }
}

/// The single value returned by a built-in call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRet {
    pub value: Value,
}

impl ScriptRet {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn to_message(&self) -> TandemResult<Message> {
        value_message(&self.value, MessageType::ScriptRet)
    }

    pub fn from_message(message: &Message) -> TandemResult<Self> {
        message.expect_type(MessageType::ScriptRet)?;
        Ok(Self {
            value: value_from_message(message)?,
        })
    }
}

/// Encode a single value as a message of type `msg_type`.
pub fn value_message(value: &Value, msg_type: MessageType) -> TandemResult<Message> {
    let mut segments = Vec::new();
    let body = lift(value, &mut segments);
    Ok(Message::new(serde_json::to_vec(&body)?, segments, msg_type))
}

/// Decode a message produced by [`value_message`], whatever its type.
pub fn value_from_message(message: &Message) -> TandemResult<Value> {
    let body: WireValue = serde_json::from_slice(&message.payload)?;
    restore(body, &message.segments)
}

/// Acceptance record sent back for a reference-producing call: the fork
/// `fork_id` of `rref_id` is now registered with the owner.
///
/// `owner` names the worker holding the accepted fork, which is the worker
/// the acceptance is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRet {
    pub owner: WorkerId,
    pub rref_id: RRefId,
    pub fork_id: ForkId,
}

impl RemoteRet {
    pub fn new(owner: WorkerId, rref_id: RRefId, fork_id: ForkId) -> Self {
        Self {
            owner,
            rref_id,
            fork_id,
        }
    }

    pub fn to_message(&self) -> TandemResult<Message> {
        Ok(Message::new(
            serde_json::to_vec(self)?,
            Vec::new(),
            MessageType::RemoteRet,
        ))
    }

    pub fn from_message(message: &Message) -> TandemResult<Self> {
        message.expect_type(MessageType::RemoteRet)?;
        Ok(serde_json::from_slice(&message.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Encode a message as a frame (4-byte big-endian length prefix included).
pub fn encode_frame(message: &Message) -> Vec<u8> {
    let segments_len: usize = message.segments.iter().map(|s| 4 + s.len()).sum();
    let body_len = 8 + 1 + 4 + message.payload.len() + 4 + segments_len;
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u64(message.id);
    buf.put_u8(message.msg_type as u8);
    buf.put_u32(message.payload.len() as u32);
    buf.extend_from_slice(&message.payload);
    buf.put_u32(message.segments.len() as u32);
    for segment in &message.segments {
        buf.put_u32(segment.len() as u32);
        buf.extend_from_slice(segment);
    }
    buf
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

fn take_u32(buf: &mut &[u8], what: &str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::MalformedFrame(format!("truncated {what}")));
    }
    Ok(buf.get_u32())
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8], WireError> {
    if buf.remaining() < len {
        return Err(WireError::MalformedFrame(format!("truncated {what}")));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Decode a frame body (everything after the length prefix).
pub fn decode_frame(body: &[u8]) -> Result<Message, WireError> {
    let mut buf = body;
    if buf.remaining() < 9 {
        return Err(WireError::MalformedFrame("truncated header".into()));
    }
    let id = buf.get_u64();
    let msg_type = MessageType::try_from(buf.get_u8())?;
    let payload_len = take_u32(&mut buf, "payload length")? as usize;
    let payload = take_bytes(&mut buf, payload_len, "payload")?.to_vec();
    let count = take_u32(&mut buf, "segment count")? as usize;
    let mut segments = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = take_u32(&mut buf, "segment length")? as usize;
        segments.push(Bytes::copy_from_slice(take_bytes(&mut buf, len, "segment")?));
    }
    if buf.has_remaining() {
        return Err(WireError::MalformedFrame(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(Message {
        msg_type,
        payload,
        segments,
        id,
    })
}
