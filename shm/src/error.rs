//! Error types for the shared-memory kit.
//!
//! Memory errors indicate host bugs (bad offsets, double frees, exhausted
//! regions); they are never surfaced to a guest as an errno. Concurrent
//! modification is likewise a programming error: an iterator observed a
//! structural mutation mid-walk.

use core::fmt;

/// Error raised by region, range and record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The region's allocator could not satisfy the request.
    OutOfMemory,
    /// An offset/length pair escapes the underlying region or range.
    OutOfBounds,
    /// An address did not meet the required alignment.
    Misaligned,
    /// A size or alignment argument was not acceptable (zero, or not a
    /// power of two where one is required).
    InvalidSize,
    /// `free` was called on a borrowed (non-owning) range.
    FreeOfBorrowed,
    /// The operation is not implemented (`realloc`).
    Unsupported,
    /// A record accessor was asked for a field the descriptor lacks.
    UnknownField,
    /// A field access used the wrong property type.
    TypeMismatch,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemoryError::OutOfMemory => "shared region allocator exhausted",
            MemoryError::OutOfBounds => "offset out of bounds",
            MemoryError::Misaligned => "misaligned access",
            MemoryError::InvalidSize => "invalid size or alignment",
            MemoryError::FreeOfBorrowed => "free of a borrowed range",
            MemoryError::Unsupported => "operation not supported",
            MemoryError::UnknownField => "unknown record field",
            MemoryError::TypeMismatch => "field accessed with wrong type",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for MemoryError {}

/// Error raised by shared containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// An underlying memory operation failed.
    Memory(MemoryError),
    /// A container was structurally mutated while an iterator was live.
    ConcurrentModification,
    /// An index was outside the container's current bounds.
    IndexOutOfRange,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::Memory(e) => write!(f, "memory error: {}", e),
            ShmError::ConcurrentModification => {
                f.write_str("container modified during iteration")
            }
            ShmError::IndexOutOfRange => f.write_str("index out of range"),
        }
    }
}

impl std::error::Error for ShmError {}

impl From<MemoryError> for ShmError {
    fn from(e: MemoryError) -> Self {
        ShmError::Memory(e)
    }
}
