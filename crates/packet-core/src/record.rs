//! Decoded telemetry records.
//!
//! A `PacketRecord` is what the parser hands to the fan-out layer: the packet
//! id, the capture timestamp, the raw body bytes, and the decoded value. The
//! normalized JSON body produced here is shared by every sink so that the
//! JSONL log and the bridge wire agree on field names.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Decoded value of one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketValue {
    /// Body of the reserved text id, NUL-trimmed UTF-8.
    Text(String),
    /// Field name → value mapping decoded through a registered schema.
    Fields(serde_json::Map<String, Value>),
    /// Unregistered id; the payload bytes are the value.
    Raw,
}

/// One decoded telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub id: u8,
    /// Captured when COBS decoding of the frame succeeded.
    pub timestamp: DateTime<Utc>,
    /// Raw body bytes (packet id stripped).
    pub payload: Vec<u8>,
    pub value: PacketValue,
}

/// The canonical JSON body of a record.
///
/// Exactly one of `text`/`data` is present: `text` for the text id, `data`
/// for struct and raw packets. Field order is fixed by this struct.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRecord {
    pub ts: String,
    pub id: String,
    pub payload_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PacketRecord {
    /// The packet id as `0x` + two lowercase hex digits.
    pub fn id_hex(&self) -> String {
        format!("0x{:02x}", self.id)
    }

    /// Lowercase hex of the raw body.
    pub fn payload_hex(&self) -> String {
        hex::encode(&self.payload)
    }

    /// Capture time as nanoseconds since the Unix epoch, for the bridge wire.
    /// Saturates at zero before the epoch and at the chrono nanosecond range
    /// end (year 2262).
    pub fn log_time_ns(&self) -> u64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .try_into()
            .unwrap_or(0)
    }

    /// Build the canonical JSON body shared by the JSONL sink and the bridge.
    pub fn normalized(&self) -> NormalizedRecord {
        let (text, data) = match &self.value {
            PacketValue::Text(text) => (Some(text.clone()), None),
            PacketValue::Fields(fields) => (None, Some(Value::Object(fields.clone()))),
            PacketValue::Raw => (
                None,
                Some(serde_json::json!({
                    "id": self.id_hex(),
                    "payload_hex": self.payload_hex(),
                })),
            ),
        };
        NormalizedRecord {
            ts: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            id: self.id_hex(),
            payload_hex: self.payload_hex(),
            text,
            data,
        }
    }
}
