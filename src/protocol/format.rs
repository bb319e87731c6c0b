//! Primitive field formats
//!
//! Every payload field is packed at a fixed width. The registry maps the
//! names a schema may use onto those formats; unknown names are rejected
//! when a packet kind is declared.

use std::fmt;

/// A fixed-width primitive wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Char,
    Int8,
    UInt8,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

/// Registered format names, aliases included
pub const REGISTRY: &[(&str, Format)] = &[
    ("char", Format::Char),
    ("int8", Format::Int8),
    ("signed_char", Format::Int8),
    ("uint8", Format::UInt8),
    ("unsigned_char", Format::UInt8),
    ("bool", Format::Bool),
    ("int16", Format::Int16),
    ("short", Format::Int16),
    ("uint16", Format::UInt16),
    ("unsigned_short", Format::UInt16),
    ("int32", Format::Int32),
    ("int", Format::Int32),
    ("uint32", Format::UInt32),
    ("unsigned_int", Format::UInt32),
    ("int64", Format::Int64),
    ("long", Format::Int64),
    ("long_long", Format::Int64),
    ("uint64", Format::UInt64),
    ("unsigned_long", Format::UInt64),
    ("unsigned_long_long", Format::UInt64),
    ("float32", Format::Float32),
    ("float", Format::Float32),
    ("float64", Format::Float64),
    ("double", Format::Float64),
];

impl Format {
    /// Resolve a format name, `None` if it is not registered
    pub fn lookup(name: &str) -> Option<Format> {
        REGISTRY
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, format)| *format)
    }

    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            Format::Char | Format::Int8 | Format::UInt8 | Format::Bool => 1,
            Format::Int16 | Format::UInt16 => 2,
            Format::Int32 | Format::UInt32 | Format::Float32 => 4,
            Format::Int64 | Format::UInt64 | Format::Float64 => 8,
        }
    }

    /// Canonical registry name
    pub fn name(self) -> &'static str {
        match self {
            Format::Char => "char",
            Format::Int8 => "int8",
            Format::UInt8 => "uint8",
            Format::Bool => "bool",
            Format::Int16 => "int16",
            Format::UInt16 => "uint16",
            Format::Int32 => "int32",
            Format::UInt32 => "uint32",
            Format::Int64 => "int64",
            Format::UInt64 => "uint64",
            Format::Float32 => "float32",
            Format::Float64 => "float64",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
