//! Packet schema declarations.
//!
//! A schema describes the memory layout of one firmware C struct: the struct
//! name, its total byte size, whether it was declared packed, and an ordered
//! field list with explicit offsets. Schemas are produced by an external
//! scanner and handed to the registry at startup; this module only carries
//! the types and the registration-time validation.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// The closed set of field types the wire format supports.
///
/// All multi-byte encodings are little-endian; `Float`/`Double` are IEEE-754.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int8,
    Uint8,
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float,
    Int64,
    Uint64,
    Double,
}

impl FieldType {
    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            FieldType::Int8 | FieldType::Uint8 | FieldType::Bool => 1,
            FieldType::Int16 | FieldType::Uint16 => 2,
            FieldType::Int32 | FieldType::Uint32 | FieldType::Float => 4,
            FieldType::Int64 | FieldType::Uint64 | FieldType::Double => 8,
        }
    }

    /// The C type tag this variant was declared with.
    pub fn tag(self) -> &'static str {
        match self {
            FieldType::Int8 => "int8_t",
            FieldType::Uint8 => "uint8_t",
            FieldType::Bool => "bool",
            FieldType::Int16 => "int16_t",
            FieldType::Uint16 => "uint16_t",
            FieldType::Int32 => "int32_t",
            FieldType::Uint32 => "uint32_t",
            FieldType::Float => "float",
            FieldType::Int64 => "int64_t",
            FieldType::Uint64 => "uint64_t",
            FieldType::Double => "double",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl TryFrom<&str> for FieldType {
    type Error = SchemaError;

    fn try_from(tag: &str) -> Result<Self, Self::Error> {
        match tag {
            "int8_t" => Ok(FieldType::Int8),
            "uint8_t" => Ok(FieldType::Uint8),
            "bool" => Ok(FieldType::Bool),
            "int16_t" => Ok(FieldType::Int16),
            "uint16_t" => Ok(FieldType::Uint16),
            "int32_t" => Ok(FieldType::Int32),
            "uint32_t" => Ok(FieldType::Uint32),
            "float" => Ok(FieldType::Float),
            "int64_t" => Ok(FieldType::Int64),
            "uint64_t" => Ok(FieldType::Uint64),
            "double" => Ok(FieldType::Double),
            other => Err(SchemaError::UnknownTypeTag {
                tag: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldDef / PacketSchema
// ---------------------------------------------------------------------------

/// One field of a packet struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// Byte offset of the field inside the struct body.
    pub offset: usize,
    /// Declared size; must equal `ty.size()`.
    pub size: usize,
}

/// Declarative layout of one packet body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSchema {
    pub struct_name: String,
    /// Exact required length of the packet body in bytes.
    pub byte_size: usize,
    /// Whether the struct was declared with no inter-field padding.
    pub packed: bool,
    /// Ordered field list; never empty for a valid schema.
    pub fields: Vec<FieldDef>,
}

impl PacketSchema {
    /// Validate the layout invariants enforced at registration time.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.byte_size == 0 {
            return Err(SchemaError::ZeroByteSize {
                struct_name: self.struct_name.clone(),
            });
        }
        if self.fields.is_empty() {
            return Err(SchemaError::NoFields {
                struct_name: self.struct_name.clone(),
            });
        }
        for field in &self.fields {
            if field.size != field.ty.size() {
                return Err(SchemaError::FieldSizeMismatch {
                    struct_name: self.struct_name.clone(),
                    field: field.name.clone(),
                    declared: field.size,
                    expected: field.ty.size(),
                });
            }
            if field.offset + field.size > self.byte_size {
                return Err(SchemaError::FieldOutOfBounds {
                    struct_name: self.struct_name.clone(),
                    field: field.name.clone(),
                    offset: field.offset,
                    size: field.size,
                    byte_size: self.byte_size,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown field type tag '{tag}'")]
    UnknownTypeTag { tag: String },
    #[error("schema '{struct_name}' declares a zero byte size")]
    ZeroByteSize { struct_name: String },
    #[error("schema '{struct_name}' has no fields")]
    NoFields { struct_name: String },
    #[error("schema '{struct_name}' field '{field}' declares size {declared}, type requires {expected}")]
    FieldSizeMismatch {
        struct_name: String,
        field: String,
        declared: usize,
        expected: usize,
    },
    #[error("schema '{struct_name}' field '{field}' at offset {offset} size {size} exceeds byte size {byte_size}")]
    FieldOutOfBounds {
        struct_name: String,
        field: String,
        offset: usize,
        size: usize,
        byte_size: usize,
    },
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
