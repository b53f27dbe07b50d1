//! The typed request/result vocabulary.
//!
//! A request declares up front what shape of result it expects: nothing, a
//! fixed-length typed array, or a variable-size JSON value fetched in a
//! second round. Fixed kinds are measured in elements; the byte length a
//! caller supplies must divide evenly.

use crate::error::TransportError;

/// Enumerated result kinds as stored in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultKind {
    /// No payload; only the errno travels back.
    None = 0,
    U8 = 1,
    U16 = 2,
    U32 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    /// JSON payload of a size only the handler knows.
    Variable = 7,
}

impl ResultKind {
    /// Parse a header value.
    pub fn from_u32(value: u32) -> Option<ResultKind> {
        match value {
            0 => Some(ResultKind::None),
            1 => Some(ResultKind::U8),
            2 => Some(ResultKind::U16),
            3 => Some(ResultKind::U32),
            4 => Some(ResultKind::I8),
            5 => Some(ResultKind::I16),
            6 => Some(ResultKind::I32),
            7 => Some(ResultKind::Variable),
            _ => None,
        }
    }

    /// Element size in bytes; 1 for `None`/`Variable` (no constraint).
    pub fn element_size(self) -> u32 {
        match self {
            ResultKind::U16 | ResultKind::I16 => 2,
            ResultKind::U32 | ResultKind::I32 => 4,
            _ => 1,
        }
    }
}

/// A validated result expectation: kind plus reserved byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultType {
    kind: ResultKind,
    byte_length: u32,
}

impl ResultType {
    /// No result payload.
    pub fn none() -> ResultType {
        ResultType {
            kind: ResultKind::None,
            byte_length: 0,
        }
    }

    /// A variable-size JSON result, fetched in a second round.
    pub fn variable() -> ResultType {
        ResultType {
            kind: ResultKind::Variable,
            byte_length: 0,
        }
    }

    fn fixed(kind: ResultKind, byte_length: u32) -> Result<ResultType, TransportError> {
        if byte_length % kind.element_size() != 0 {
            return Err(TransportError::InvalidByteLength);
        }
        Ok(ResultType { kind, byte_length })
    }

    /// A `u8` array result of `byte_length` bytes.
    pub fn u8(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::U8, byte_length)
    }

    /// A `u16` array result of `byte_length` bytes.
    pub fn u16(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::U16, byte_length)
    }

    /// A `u32` array result of `byte_length` bytes.
    pub fn u32(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::U32, byte_length)
    }

    /// An `i8` array result of `byte_length` bytes.
    pub fn i8(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::I8, byte_length)
    }

    /// An `i16` array result of `byte_length` bytes.
    pub fn i16(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::I16, byte_length)
    }

    /// An `i32` array result of `byte_length` bytes.
    pub fn i32(byte_length: u32) -> Result<ResultType, TransportError> {
        Self::fixed(ResultKind::I32, byte_length)
    }

    /// The result kind tag.
    pub fn kind(self) -> ResultKind {
        self.kind
    }

    /// Reserved byte length of the result area (0 for `None`/`Variable`).
    pub fn byte_length(self) -> u32 {
        self.byte_length
    }

    /// Number of elements the result area holds.
    pub fn element_count(self) -> u32 {
        self.byte_length / self.kind.element_size()
    }
}

/// A decoded result payload as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultData {
    /// No payload.
    None,
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    /// Parsed variable-size payload.
    Json(serde_json::Value),
}

impl ResultData {
    /// Decode the raw result bytes according to `kind`.
    pub fn from_bytes(kind: ResultKind, bytes: &[u8]) -> ResultData {
        match kind {
            ResultKind::None | ResultKind::Variable => ResultData::None,
            ResultKind::U8 => ResultData::U8(bytes.to_vec()),
            ResultKind::I8 => ResultData::I8(bytes.iter().map(|&b| b as i8).collect()),
            ResultKind::U16 => ResultData::U16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            ResultKind::I16 => ResultData::I16(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            ResultKind::U32 => ResultData::U32(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ResultKind::I32 => ResultData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for value in 0..8 {
            let kind = ResultKind::from_u32(value).unwrap();
            assert_eq!(kind as u32, value);
        }
        assert_eq!(ResultKind::from_u32(8), None);
    }

    #[test]
    fn test_fixed_byte_length_validation() {
        assert!(ResultType::u8(7).is_ok());
        assert!(ResultType::u16(8).is_ok());
        assert!(matches!(
            ResultType::u16(7),
            Err(TransportError::InvalidByteLength)
        ));
        assert!(matches!(
            ResultType::i32(6),
            Err(TransportError::InvalidByteLength)
        ));
        assert_eq!(ResultType::u32(16).unwrap().element_count(), 4);
    }

    #[test]
    fn test_result_data_decoding() {
        let bytes = [1u8, 0, 2, 0];
        assert_eq!(
            ResultData::from_bytes(ResultKind::U16, &bytes),
            ResultData::U16(vec![1, 2])
        );
        assert_eq!(
            ResultData::from_bytes(ResultKind::I32, &[0xFF, 0xFF, 0xFF, 0xFF]),
            ResultData::I32(vec![-1])
        );
    }
}
