//! packet-core: wire-level decoding for the telemetry relay.
//!
//! COBS framing, packet schemas, the id registry, and the table-driven
//! struct decoder. Pure logic with no I/O so every sink and service can
//! share one decode path.

pub mod cobs;
pub mod decode;
pub mod record;
pub mod registry;
pub mod schema;

pub use decode::{DecodeError, decode_packet};
pub use record::{NormalizedRecord, PacketRecord, PacketValue};
pub use registry::{DEFAULT_TEXT_ID, PacketRegistry};
pub use schema::{FieldDef, FieldType, PacketSchema, SchemaError};
