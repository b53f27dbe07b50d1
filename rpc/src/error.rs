//! Transport and handler errors, and the wire errno taxonomy.

use core::fmt;

use wasmbed_shm::MemoryError;

/// Errnos carried in the request header. Negative values are transport
/// failures; `0` is success. Application handlers cannot pick their own
/// codes: any handler failure maps to [`errno::HANDLER_FAILED`].
pub mod errno {
    /// The request completed.
    pub const SUCCESS: i32 = 0;
    /// The handler returned an error or panicked.
    pub const HANDLER_FAILED: i32 = -1;
    /// The request bytes could not be decoded.
    pub const MALFORMED: i32 = -2;
    /// No handler is registered for the method.
    pub const NO_HANDLER: i32 = -3;
    /// A variable result was missing for `$/fetchResult`, or its size did
    /// not match the fetch buffer.
    pub const VARIABLE_MISSING: i32 = -4;
    /// The fetched variable result was not valid JSON.
    pub const VARIABLE_PARSE: i32 = -5;
}

/// Failure inside the transport machinery itself (never surfaced on the
/// wire; the caller gets it directly).
#[derive(Debug)]
pub enum TransportError {
    /// A fixed result type was constructed with a byte length that is not
    /// a multiple of the element size.
    InvalidByteLength,
    /// A reserved method name (`$/fetchResult`, `$/ready`) was used for an
    /// application handler.
    ReservedMethod,
    /// The peer hung up the port.
    Disconnected,
    /// Request serialisation failed.
    Serialize(String),
    /// A shared-buffer operation failed.
    Memory(MemoryError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidByteLength => {
                f.write_str("byte length is not a multiple of the element size")
            }
            TransportError::ReservedMethod => f.write_str("reserved method name"),
            TransportError::Disconnected => f.write_str("service port disconnected"),
            TransportError::Serialize(msg) => write!(f, "serialisation failed: {}", msg),
            TransportError::Memory(e) => write!(f, "shared buffer error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<MemoryError> for TransportError {
    fn from(e: MemoryError) -> Self {
        TransportError::Memory(e)
    }
}

/// Error returned by an application request handler. The message is logged
/// on the host side; the guest only sees [`errno::HANDLER_FAILED`].
#[derive(Debug)]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Build from anything printable.
    pub fn new(message: impl Into<String>) -> HandlerError {
        HandlerError(message.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}
