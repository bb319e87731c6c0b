//! Packet kinds and instances
//!
//! A packet kind is declared once, as a protocol id, a type id and an
//! ordered list of fields. Declaration validates every field format against
//! the registry so that a bad schema fails before any instance exists.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::codec::{CodecError, Frame, Header, HeaderError, HEADER_SIZE};
use super::Format;

/// Schema declaration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{kind}.{field} has no format specified")]
    MissingFormat { kind: String, field: String },

    #[error("{kind}.{field} has invalid format: '{format}'")]
    InvalidFormat {
        kind: String,
        field: String,
        format: String,
    },

    #[error("{kind}.{field} is declared more than once")]
    DuplicateField { kind: String, field: String },

    #[error("{kind} needs both protocol and type to join a packet set")]
    Incomplete { kind: String },

    #[error("{kind} uses protocol {found}, packet set expects {expected}")]
    ProtocolConflict {
        kind: String,
        expected: i32,
        found: i32,
    },

    #[error("{kind} reuses type {type_id} already taken by {existing}")]
    DuplicateType {
        kind: String,
        type_id: i32,
        existing: String,
    },
}

/// A field as written in a declaration, before validation
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    format: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: Some(format.into()),
        }
    }

    /// A field with no format assigned; declaring a kind with it fails
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: None,
        }
    }
}

/// A validated payload field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub format: Format,
}

/// A single field value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Char(u8),
    Int8(i8),
    UInt8(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Value {
    pub fn format(&self) -> Format {
        match self {
            Value::Char(_) => Format::Char,
            Value::Int8(_) => Format::Int8,
            Value::UInt8(_) => Format::UInt8,
            Value::Bool(_) => Format::Bool,
            Value::Int16(_) => Format::Int16,
            Value::UInt16(_) => Format::UInt16,
            Value::Int32(_) => Format::Int32,
            Value::UInt32(_) => Format::UInt32,
            Value::Int64(_) => Format::Int64,
            Value::UInt64(_) => Format::UInt64,
            Value::Float32(_) => Format::Float32,
            Value::Float64(_) => Format::Float64,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match *self {
            Value::Char(v) | Value::UInt8(v) => buf.put_u8(v),
            Value::Int8(v) => buf.put_i8(v),
            Value::Bool(v) => buf.put_u8(v as u8),
            Value::Int16(v) => buf.put_i16_le(v),
            Value::UInt16(v) => buf.put_u16_le(v),
            Value::Int32(v) => buf.put_i32_le(v),
            Value::UInt32(v) => buf.put_u32_le(v),
            Value::Int64(v) => buf.put_i64_le(v),
            Value::UInt64(v) => buf.put_u64_le(v),
            Value::Float32(v) => buf.put_f32_le(v),
            Value::Float64(v) => buf.put_f64_le(v),
        }
    }

    /// Caller guarantees `format.width()` bytes remain
    fn get(format: Format, buf: &mut &[u8]) -> Value {
        match format {
            Format::Char => Value::Char(buf.get_u8()),
            Format::Int8 => Value::Int8(buf.get_i8()),
            Format::UInt8 => Value::UInt8(buf.get_u8()),
            Format::Bool => Value::Bool(buf.get_u8() != 0),
            Format::Int16 => Value::Int16(buf.get_i16_le()),
            Format::UInt16 => Value::UInt16(buf.get_u16_le()),
            Format::Int32 => Value::Int32(buf.get_i32_le()),
            Format::UInt32 => Value::UInt32(buf.get_u32_le()),
            Format::Int64 => Value::Int64(buf.get_i64_le()),
            Format::UInt64 => Value::UInt64(buf.get_u64_le()),
            Format::Float32 => Value::Float32(buf.get_f32_le()),
            Format::Float64 => Value::Float64(buf.get_f64_le()),
        }
    }
}

/// The declared shape of one message type
#[derive(Debug, Clone)]
pub struct PacketKind {
    name: String,
    protocol: Option<i32>,
    type_id: Option<i32>,
    fields: Vec<FieldDescriptor>,
    payload_len: usize,
}

/// Collects a packet kind declaration; see [`PacketKind::builder`]
#[derive(Debug)]
pub struct PacketKindBuilder {
    name: String,
    protocol: Option<i32>,
    type_id: Option<i32>,
    fields: Vec<Field>,
}

impl PacketKindBuilder {
    pub fn protocol(mut self, protocol: i32) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn type_id(mut self, type_id: i32) -> Self {
        self.type_id = Some(type_id);
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Validate every field against the format registry
    pub fn build(self) -> Result<PacketKind, SchemaError> {
        let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(self.fields.len());

        for field in self.fields {
            let format_name = field.format.ok_or_else(|| SchemaError::MissingFormat {
                kind: self.name.clone(),
                field: field.name.clone(),
            })?;

            let format = Format::lookup(&format_name).ok_or_else(|| SchemaError::InvalidFormat {
                kind: self.name.clone(),
                field: field.name.clone(),
                format: format_name.clone(),
            })?;

            if fields.iter().any(|existing| existing.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    kind: self.name,
                    field: field.name,
                });
            }

            fields.push(FieldDescriptor {
                name: field.name,
                format,
            });
        }

        let payload_len = fields.iter().map(|f| f.format.width()).sum();

        Ok(PacketKind {
            name: self.name,
            protocol: self.protocol,
            type_id: self.type_id,
            fields,
            payload_len,
        })
    }
}

impl PacketKind {
    pub fn builder(name: impl Into<String>) -> PacketKindBuilder {
        PacketKindBuilder {
            name: name.into(),
            protocol: None,
            type_id: None,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Option<i32> {
        self.protocol
    }

    pub fn type_id(&self) -> Option<i32> {
        self.type_id
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Packed size of the payload fields
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Both header identifiers, `type` checked first
    fn identifiers(&self) -> Result<(i32, i32), HeaderError> {
        let type_id = self.type_id.ok_or_else(|| HeaderError::MissingType {
            kind: self.name.clone(),
        })?;
        let protocol = self.protocol.ok_or_else(|| HeaderError::MissingProtocol {
            kind: self.name.clone(),
        })?;
        Ok((protocol, type_id))
    }

    /// Pack header and payload; `values` follow declaration order
    pub fn encode(&self, values: &[Value]) -> Result<Bytes, CodecError> {
        let (protocol, type_id) = self.identifiers()?;

        if values.len() != self.fields.len() {
            return Err(CodecError::FieldCount {
                kind: self.name.clone(),
                expected: self.fields.len(),
                found: values.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload_len);
        Header {
            protocol,
            type_id,
            length: self.payload_len as u32,
        }
        .write(&mut buf);

        for (field, value) in self.fields.iter().zip(values) {
            if value.format() != field.format {
                return Err(CodecError::FieldFormat {
                    kind: self.name.clone(),
                    field: field.name.clone(),
                    expected: field.format,
                    found: value.format(),
                });
            }
            value.put(&mut buf);
        }

        Ok(buf.freeze())
    }

    /// Unpack one packet of this kind from the front of `bytes`
    pub fn decode(self: &Arc<Self>, bytes: &[u8]) -> Result<Packet, CodecError> {
        let (protocol, type_id) = self.identifiers()?;
        let header = Header::parse(bytes)?;

        if header.protocol != protocol {
            return Err(CodecError::ProtocolMismatch {
                expected: protocol,
                found: header.protocol,
            });
        }
        if bytes.len() < header.frame_len() {
            return Err(CodecError::Truncated {
                needed: header.frame_len(),
                available: bytes.len(),
            });
        }
        if header.type_id != type_id {
            return Err(CodecError::TypeMismatch {
                kind: self.name.clone(),
                expected: type_id,
                found: header.type_id,
            });
        }
        if header.length as usize != self.payload_len {
            return Err(CodecError::LengthMismatch {
                kind: self.name.clone(),
                expected: self.payload_len as u32,
                found: header.length,
            });
        }

        let mut payload = &bytes[HEADER_SIZE..header.frame_len()];
        let values = self
            .fields
            .iter()
            .map(|field| Some(Value::get(field.format, &mut payload)))
            .collect();

        Ok(Packet {
            kind: Arc::clone(self),
            values,
            length: Some(header.length),
        })
    }
}

/// One message of a declared kind
#[derive(Debug, Clone)]
pub struct Packet {
    kind: Arc<PacketKind>,
    values: Vec<Option<Value>>,
    length: Option<u32>,
}

impl Packet {
    /// A fresh instance with every field unset
    pub fn new(kind: Arc<PacketKind>) -> Self {
        let values = vec![None; kind.fields.len()];
        Self {
            kind,
            values,
            length: None,
        }
    }

    pub fn kind(&self) -> &PacketKind {
        &self.kind
    }

    pub fn set(&mut self, field: &str, value: Value) -> Result<(), CodecError> {
        if self.length.is_some() {
            return Err(CodecError::Sealed {
                kind: self.kind.name.clone(),
            });
        }

        let index = self
            .kind
            .field_index(field)
            .ok_or_else(|| CodecError::UnknownField {
                kind: self.kind.name.clone(),
                field: field.to_string(),
            })?;

        let expected = self.kind.fields[index].format;
        if value.format() != expected {
            return Err(CodecError::FieldFormat {
                kind: self.kind.name.clone(),
                field: field.to_string(),
                expected,
                found: value.format(),
            });
        }

        self.values[index] = Some(value);
        Ok(())
    }

    pub fn with(mut self, field: &str, value: Value) -> Result<Self, CodecError> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.kind.field_index(field).and_then(|i| self.values[i])
    }

    /// Payload length, known once the instance was encoded or decoded
    pub fn length(&self) -> Option<u32> {
        self.length
    }

    /// Pack this instance and record its payload length
    pub fn encode(&mut self) -> Result<Bytes, CodecError> {
        let values = self
            .kind
            .fields
            .iter()
            .zip(&self.values)
            .map(|(field, value)| {
                value.ok_or_else(|| CodecError::MissingValue {
                    kind: self.kind.name.clone(),
                    field: field.name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>();

        // header errors take precedence over missing values
        self.kind.identifiers()?;
        let bytes = self.kind.encode(&values?)?;

        self.length = Some(self.kind.payload_len as u32);
        Ok(bytes)
    }
}

/// Packet kinds of one protocol, keyed by type id
#[derive(Debug, Clone)]
pub struct PacketSet {
    protocol: i32,
    kinds: HashMap<i32, Arc<PacketKind>>,
}

impl PacketSet {
    pub fn new(protocol: i32) -> Self {
        Self {
            protocol,
            kinds: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn register(&mut self, kind: PacketKind) -> Result<Arc<PacketKind>, SchemaError> {
        let (Some(protocol), Some(type_id)) = (kind.protocol, kind.type_id) else {
            return Err(SchemaError::Incomplete { kind: kind.name });
        };

        if protocol != self.protocol {
            return Err(SchemaError::ProtocolConflict {
                kind: kind.name,
                expected: self.protocol,
                found: protocol,
            });
        }

        if let Some(existing) = self.kinds.get(&type_id) {
            return Err(SchemaError::DuplicateType {
                kind: kind.name,
                type_id,
                existing: existing.name.clone(),
            });
        }

        let kind = Arc::new(kind);
        self.kinds.insert(type_id, Arc::clone(&kind));
        Ok(kind)
    }

    pub fn get(&self, type_id: i32) -> Option<&Arc<PacketKind>> {
        self.kinds.get(&type_id)
    }

    /// Decode a framed packet by dispatching on its type id
    pub fn decode(&self, frame: &Frame) -> Result<Packet, CodecError> {
        let kind = self
            .kinds
            .get(&frame.header.type_id)
            .ok_or(CodecError::UnknownType(frame.header.type_id))?;
        kind.decode(&frame.bytes)
    }
}
