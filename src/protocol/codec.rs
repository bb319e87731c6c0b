//! Header layout, codec errors and stream framing
//!
//! Every packet starts with a fixed 12-byte little-endian header:
//! protocol id (i32), type id (i32), payload length (u32).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Format, SchemaError};

/// Header size: protocol(4) + type(4) + length(4) = 12 bytes
pub const HEADER_SIZE: usize = 12;

/// Raised when a kind is encoded before its header identifiers are set.
/// `type` is checked before `protocol`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("{kind}.type not defined")]
    MissingType { kind: String },

    #[error("{kind}.protocol not defined")]
    MissingProtocol { kind: String },
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Protocol mismatch: expected {expected}, got {found}")]
    ProtocolMismatch { expected: i32, found: i32 },

    #[error("{kind}: type mismatch, expected {expected}, got {found}")]
    TypeMismatch { kind: String, expected: i32, found: i32 },

    #[error("{kind}: payload length mismatch, expected {expected}, got {found}")]
    LengthMismatch { kind: String, expected: u32, found: u32 },

    #[error("Payload too large: {0} bytes (max: {1})")]
    Oversized(usize, usize),

    #[error("Unknown packet type: {0}")]
    UnknownType(i32),

    #[error("{kind}: expected {expected} field values, got {found}")]
    FieldCount { kind: String, expected: usize, found: usize },

    #[error("{kind}.{field}: expected {expected} value, got {found}")]
    FieldFormat {
        kind: String,
        field: String,
        expected: Format,
        found: Format,
    },

    #[error("{kind}.{field} has no value")]
    MissingValue { kind: String, field: String },

    #[error("{kind} has no field named {field}")]
    UnknownField { kind: String, field: String },

    #[error("{kind} instance was already encoded")]
    Sealed { kind: String },
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: i32,
    pub type_id: i32,
    pub length: u32,
}

impl Header {
    /// Read a header from the front of `bytes` without consuming anything
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut cursor = &bytes[..HEADER_SIZE];
        Ok(Self {
            protocol: cursor.get_i32_le(),
            type_id: cursor.get_i32_le(),
            length: cursor.get_u32_le(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.protocol);
        buf.put_i32_le(self.type_id);
        buf.put_u32_le(self.length);
    }

    /// Header plus payload size
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

/// One complete packet cut from a byte stream
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Header and payload bytes
    pub bytes: Bytes,
}

/// Splits an inbound byte stream into frames of a single protocol
pub struct FrameDecoder {
    protocol: i32,
    max_payload: usize,
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload(Header),
}

impl FrameDecoder {
    pub fn new(protocol: i32, max_payload: usize) -> Self {
        Self {
            protocol,
            max_payload,
            state: DecodeState::Header,
        }
    }

    /// Attempt to cut a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = Header::parse(buf)?;
                    if header.protocol != self.protocol {
                        return Err(CodecError::ProtocolMismatch {
                            expected: self.protocol,
                            found: header.protocol,
                        });
                    }
                    if header.length as usize > self.max_payload {
                        return Err(CodecError::Oversized(
                            header.length as usize,
                            self.max_payload,
                        ));
                    }

                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Payload(header) => {
                    if buf.len() < header.frame_len() {
                        return Ok(None);
                    }

                    let bytes = buf.split_to(header.frame_len()).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(Frame { header, bytes }));
                }
            }
        }
    }

    /// Forget any partially read frame
    pub fn reset(&mut self) {
        self.state = DecodeState::Header;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(protocol: i32, type_id: i32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        Header {
            protocol,
            type_id,
            length: payload.len() as u32,
        }
        .write(&mut buf);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = frame_bytes(1000, 2000, &[]);
        assert_eq!(
            &buf[..],
            &[0xE8, 0x03, 0, 0, 0xD0, 0x07, 0, 0, 0, 0, 0, 0]
        );
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.protocol, 1000);
        assert_eq!(header.type_id, 2000);
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_short_header_is_truncated() {
        let err = Header::parse(&[0u8; 7]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: HEADER_SIZE,
                available: 7
            }
        );
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut decoder = FrameDecoder::new(7, 1024);
        let whole = frame_bytes(7, 1, &[1, 2, 3, 4]);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&whole[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&whole[5..14]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&whole[14..]);
        buf.extend_from_slice(&frame_bytes(7, 2, &[]));

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.type_id, 1);
        assert_eq!(&first.bytes[HEADER_SIZE..], &[1, 2, 3, 4]);

        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.header.type_id, 2);
        assert_eq!(second.bytes.len(), HEADER_SIZE);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_foreign_protocol_rejected() {
        let mut decoder = FrameDecoder::new(7, 1024);
        let mut buf = frame_bytes(8, 1, &[]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::ProtocolMismatch {
                expected: 7,
                found: 8
            }
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut decoder = FrameDecoder::new(7, 16);
        let mut buf = frame_bytes(7, 1, &[0u8; 17]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            CodecError::Oversized(17, 16)
        );
    }
}
