//! Request framing: header layout and message encode/decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasmbed_shm::SharedBuffer;

use crate::error::TransportError;
use crate::kind::{ResultKind, ResultType};

/// Byte offsets of the buffer layout. All header fields are u32.
pub mod layout {
    /// The sync-word used for the wait/notify rendezvous.
    pub const SYNC: u32 = 0;
    /// Offset of the serialised request inside the buffer.
    pub const MESSAGE_OFFSET: u32 = 4;
    /// Length of the serialised request.
    pub const MESSAGE_LENGTH: u32 = 8;
    /// Offset of the inline binary parameter (0 if absent).
    pub const BINARY_OFFSET: u32 = 12;
    /// Length of the inline binary parameter.
    pub const BINARY_LENGTH: u32 = 16;
    /// Result errno, written by the server.
    pub const ERRNO: u32 = 20;
    /// The expected result kind.
    pub const RESULT_KIND: u32 = 24;
    /// Offset of the result area.
    pub const RESULT_OFFSET: u32 = 28;
    /// Byte length of the result area. For variable results the server
    /// overwrites this with the serialised payload size.
    pub const RESULT_LENGTH: u32 = 32;
    /// First byte after sync-word and header.
    pub const DATA: u32 = 36;
}

fn align4(value: u32) -> u32 {
    (value + 3) & !3
}

/// Request parameters: a JSON object plus an optional inline binary blob.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// The JSON-encodable portion.
    pub value: serde_json::Map<String, Value>,
    /// Raw bytes carried inline after the JSON body.
    pub binary: Option<Vec<u8>>,
}

impl Params {
    /// Parameters with a single key/value pair.
    pub fn with(key: &str, value: impl Into<Value>) -> Params {
        let mut map = serde_json::Map::new();
        map.insert(String::from(key), value.into());
        Params {
            value: map,
            binary: None,
        }
    }

    /// Attach an inline binary blob.
    pub fn binary(mut self, bytes: Vec<u8>) -> Params {
        self.binary = Some(bytes);
        self
    }

    /// Look up a parameter value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    /// Look up a string parameter.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    /// Look up an unsigned integer parameter.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(Value::as_u64)
    }
}

/// The JSON body travelling through the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Monotonically increasing per-client request id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// JSON parameters (the binary blob travels inline, not here).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, Value>>,
}

/// A request decoded from a shared buffer on the server side.
#[derive(Debug)]
pub struct DecodedRequest {
    pub message: RequestMessage,
    pub binary: Option<Vec<u8>>,
    pub result_kind: ResultKind,
    pub result_offset: u32,
    pub result_length: u32,
}

/// Compute sizes, allocate a buffer and frame `message` into it.
///
/// The buffer is exactly as large as the framing requires: header, request
/// bytes, inline binary, then the 4-aligned result area.
pub fn encode_request(
    message: &RequestMessage,
    binary: Option<&[u8]>,
    result: ResultType,
) -> Result<SharedBuffer, TransportError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| TransportError::Serialize(e.to_string()))?;
    let message_offset = layout::DATA;
    let message_length = body.len() as u32;
    let binary_length = binary.map_or(0, |b| b.len() as u32);
    let binary_offset = if binary_length > 0 {
        message_offset + message_length
    } else {
        0
    };
    let result_offset = align4(message_offset + message_length + binary_length);
    let total = (result_offset + result.byte_length()).max(result_offset);

    let buffer = SharedBuffer::new(total.max(layout::DATA))?;
    buffer.write_u32(layout::SYNC, 0)?;
    buffer.write_u32(layout::MESSAGE_OFFSET, message_offset)?;
    buffer.write_u32(layout::MESSAGE_LENGTH, message_length)?;
    buffer.write_u32(layout::BINARY_OFFSET, binary_offset)?;
    buffer.write_u32(layout::BINARY_LENGTH, binary_length)?;
    buffer.write_u32(layout::ERRNO, 0)?;
    buffer.write_u32(layout::RESULT_KIND, result.kind() as u32)?;
    buffer.write_u32(layout::RESULT_OFFSET, result_offset)?;
    buffer.write_u32(layout::RESULT_LENGTH, result.byte_length())?;
    buffer.write_bytes(message_offset, &body)?;
    if let Some(bytes) = binary {
        if !bytes.is_empty() {
            buffer.write_bytes(binary_offset, bytes)?;
        }
    }
    Ok(buffer)
}

/// Decode the header and request body of a posted buffer.
pub fn decode_request(buffer: &SharedBuffer) -> Result<DecodedRequest, TransportError> {
    let message_offset = buffer.read_u32(layout::MESSAGE_OFFSET)?;
    let message_length = buffer.read_u32(layout::MESSAGE_LENGTH)?;
    let binary_offset = buffer.read_u32(layout::BINARY_OFFSET)?;
    let binary_length = buffer.read_u32(layout::BINARY_LENGTH)?;
    let result_kind = ResultKind::from_u32(buffer.read_u32(layout::RESULT_KIND)?)
        .ok_or_else(|| TransportError::Serialize(String::from("bad result kind")))?;
    let result_offset = buffer.read_u32(layout::RESULT_OFFSET)?;
    let result_length = buffer.read_u32(layout::RESULT_LENGTH)?;

    let body = buffer.read_bytes(message_offset, message_length)?;
    let message: RequestMessage = serde_json::from_slice(&body)
        .map_err(|e| TransportError::Serialize(e.to_string()))?;
    let binary = if binary_offset != 0 && binary_length > 0 {
        Some(buffer.read_bytes(binary_offset, binary_length)?)
    } else {
        None
    };

    Ok(DecodedRequest {
        message,
        binary,
        result_kind,
        result_offset,
        result_length,
    })
}
