//! Table-driven packet body decoding.
//!
//! The parser never reflects into concrete struct types: the schema is data,
//! and the decoder switches on each field's type tag, reading little-endian
//! bytes at the declared offset into a generic name → value mapping.

use crate::record::{PacketRecord, PacketValue};
use crate::registry::PacketRegistry;
use crate::schema::{FieldType, PacketSchema};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Ways a structurally framed packet can fail decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet 0x{id:02x} body is {actual} bytes, schema '{struct_name}' requires {expected}")]
    SizeMismatch {
        id: u8,
        struct_name: String,
        expected: usize,
        actual: usize,
    },
}

/// Decode one `(id, body)` pair against the registry.
///
/// Precedence: the text id decodes as UTF-8 text even when a schema is also
/// registered for it; registered ids decode through their schema; anything
/// else passes through as a raw record.
pub fn decode_packet(
    registry: &PacketRegistry,
    id: u8,
    body: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<PacketRecord, DecodeError> {
    let value = if registry.is_text(id) {
        PacketValue::Text(decode_text(body))
    } else if let Some(schema) = registry.lookup(id) {
        PacketValue::Fields(decode_fields(id, &schema, body)?)
    } else {
        PacketValue::Raw
    };
    Ok(PacketRecord {
        id,
        timestamp,
        payload: body.to_vec(),
        value,
    })
}

/// UTF-8 text up to the first NUL; invalid sequences become U+FFFD.
fn decode_text(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0x00).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn decode_fields(
    id: u8,
    schema: &PacketSchema,
    body: &[u8],
) -> Result<serde_json::Map<String, Value>, DecodeError> {
    if body.len() != schema.byte_size {
        return Err(DecodeError::SizeMismatch {
            id,
            struct_name: schema.struct_name.clone(),
            expected: schema.byte_size,
            actual: body.len(),
        });
    }
    let mut fields = serde_json::Map::new();
    for field in &schema.fields {
        // Registration validated offset + size <= byte_size, so the slice is
        // always in bounds here.
        let bytes = &body[field.offset..field.offset + field.size];
        fields.insert(field.name.clone(), read_value(field.ty, bytes));
    }
    Ok(fields)
}

fn read_value(ty: FieldType, b: &[u8]) -> Value {
    match ty {
        FieldType::Int8 => Value::from(b[0] as i8),
        FieldType::Uint8 => Value::from(b[0]),
        FieldType::Bool => Value::from(b[0] != 0),
        FieldType::Int16 => Value::from(i16::from_le_bytes([b[0], b[1]])),
        FieldType::Uint16 => Value::from(u16::from_le_bytes([b[0], b[1]])),
        FieldType::Int32 => Value::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::Uint32 => Value::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        FieldType::Float => Value::from(f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
        FieldType::Int64 => Value::from(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        FieldType::Uint64 => Value::from(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        FieldType::Double => Value::from(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
