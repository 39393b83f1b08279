//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Durations are expressed in milliseconds (`*_ms` keys).
//!
//! # Required fields
//! - `source.addr`
//!
//! Everything else has a default or is optional: the JSONL sink runs only
//! when `jsonl.path` is set, the bridge only when `bridge.listen` is set.
//! `[[packets.schemas]]` entries carry the struct layouts produced by the
//! external annotation scanner; they are validated here so that a bad table
//! refuses to start instead of corrupting decode output.

use packet_core::{DEFAULT_TEXT_ID, FieldDef, FieldType, PacketSchema, SchemaError};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub source: SourceConfig,
    pub hub: HubConfig,
    pub jsonl: Option<JsonlConfig>,
    pub bridge: Option<BridgeConfig>,
    pub packets: PacketsConfig,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// TCP address of the RTT server to dial.
    pub addr: SocketAddr,
    /// Base backoff between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Backoff cap.
    pub reconnect_max: Duration,
    pub dial_timeout: Duration,
    /// Per-read deadline; `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// Read buffer capacity in bytes.
    pub reader_buf: usize,
    /// Bounded queue from the framer to the transformer.
    pub frame_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub broadcast_buffer: usize,
    pub client_buffer_default: usize,
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    /// Per-client bounded send queue capacity.
    pub send_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct PacketsConfig {
    pub text_id: u8,
    /// (packet id, schema) pairs, already layout-validated.
    pub schemas: Vec<(u8, PacketSchema)>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    source: Option<RawSourceConfig>,
    hub: Option<RawHubConfig>,
    jsonl: Option<RawJsonlConfig>,
    bridge: Option<RawBridgeConfig>,
    packets: Option<RawPacketsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSourceConfig {
    addr: Option<String>,
    reconnect_interval_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    reader_buf: Option<usize>,
    frame_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawHubConfig {
    broadcast_buffer: Option<usize>,
    client_buffer_default: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawJsonlConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBridgeConfig {
    listen: Option<String>,
    send_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawPacketsConfig {
    text_id: Option<u8>,
    schemas: Option<Vec<RawSchema>>,
}

#[derive(Debug, Deserialize)]
struct RawSchema {
    id: Option<u8>,
    struct_name: Option<String>,
    byte_size: Option<usize>,
    packed: Option<bool>,
    fields: Option<Vec<RawField>>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: Option<String>,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    offset: Option<usize>,
    size: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_source = raw
        .source
        .ok_or_else(|| ConfigError::MissingField("source".to_owned()))?;
    let addr_str = raw_source
        .addr
        .ok_or_else(|| ConfigError::MissingField("source.addr".to_owned()))?;
    let addr: SocketAddr = addr_str.parse().map_err(|_| {
        ConfigError::InvalidValue(format!("source.addr '{addr_str}' is not a socket address"))
    })?;
    let reader_buf = raw_source.reader_buf.unwrap_or(65536);
    if reader_buf == 0 {
        return Err(ConfigError::InvalidValue(
            "source.reader_buf must be non-zero".to_owned(),
        ));
    }
    let frame_queue_size = raw_source.frame_queue_size.unwrap_or(256);
    if frame_queue_size == 0 {
        return Err(ConfigError::InvalidValue(
            "source.frame_queue_size must be non-zero".to_owned(),
        ));
    }
    let source = SourceConfig {
        addr,
        reconnect_interval: Duration::from_millis(raw_source.reconnect_interval_ms.unwrap_or(1_000)),
        reconnect_max: Duration::from_millis(raw_source.reconnect_max_ms.unwrap_or(30_000)),
        dial_timeout: Duration::from_millis(raw_source.dial_timeout_ms.unwrap_or(5_000)),
        read_timeout: raw_source
            .read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis),
        reader_buf,
        frame_queue_size,
    };

    let hub = match raw.hub {
        Some(h) => HubConfig {
            broadcast_buffer: nonzero("hub.broadcast_buffer", h.broadcast_buffer.unwrap_or(256))?,
            client_buffer_default: nonzero(
                "hub.client_buffer_default",
                h.client_buffer_default.unwrap_or(100),
            )?,
        },
        None => HubConfig {
            broadcast_buffer: 256,
            client_buffer_default: 100,
        },
    };

    let jsonl = match raw.jsonl {
        Some(j) => Some(JsonlConfig {
            path: PathBuf::from(
                j.path
                    .ok_or_else(|| ConfigError::MissingField("jsonl.path".to_owned()))?,
            ),
        }),
        None => None,
    };

    let bridge = match raw.bridge {
        Some(b) => {
            let listen_str = b
                .listen
                .ok_or_else(|| ConfigError::MissingField("bridge.listen".to_owned()))?;
            let listen: SocketAddr = listen_str.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "bridge.listen '{listen_str}' is not a socket address"
                ))
            })?;
            Some(BridgeConfig {
                listen,
                send_buffer: nonzero("bridge.send_buffer", b.send_buffer.unwrap_or(256))?,
            })
        }
        None => None,
    };

    let packets = match raw.packets {
        Some(p) => PacketsConfig {
            text_id: p.text_id.unwrap_or(DEFAULT_TEXT_ID),
            schemas: validate_schemas(p.schemas.unwrap_or_default())?,
        },
        None => PacketsConfig {
            text_id: DEFAULT_TEXT_ID,
            schemas: Vec::new(),
        },
    };

    Ok(RelayConfig {
        source,
        hub,
        jsonl,
        bridge,
        packets,
    })
}

fn nonzero(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!("{key} must be non-zero")));
    }
    Ok(value)
}

fn validate_schemas(raw: Vec<RawSchema>) -> Result<Vec<(u8, PacketSchema)>, ConfigError> {
    let mut schemas = Vec::with_capacity(raw.len());
    for (i, s) in raw.into_iter().enumerate() {
        let id = s
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("packets.schemas[{i}].id")))?;
        let struct_name = s.struct_name.ok_or_else(|| {
            ConfigError::MissingField(format!("packets.schemas[{i}].struct_name"))
        })?;
        let byte_size = s
            .byte_size
            .ok_or_else(|| ConfigError::MissingField(format!("packets.schemas[{i}].byte_size")))?;
        let raw_fields = s
            .fields
            .ok_or_else(|| ConfigError::MissingField(format!("packets.schemas[{i}].fields")))?;
        let mut fields = Vec::with_capacity(raw_fields.len());
        for (j, f) in raw_fields.into_iter().enumerate() {
            let name = f.name.ok_or_else(|| {
                ConfigError::MissingField(format!("packets.schemas[{i}].fields[{j}].name"))
            })?;
            let tag = f.type_tag.ok_or_else(|| {
                ConfigError::MissingField(format!("packets.schemas[{i}].fields[{j}].type"))
            })?;
            let ty = FieldType::try_from(tag.as_str())
                .map_err(|e| ConfigError::Schema { struct_name: struct_name.clone(), source: e })?;
            let offset = f.offset.ok_or_else(|| {
                ConfigError::MissingField(format!("packets.schemas[{i}].fields[{j}].offset"))
            })?;
            fields.push(FieldDef {
                name,
                ty,
                offset,
                size: f.size.unwrap_or_else(|| ty.size()),
            });
        }
        let schema = PacketSchema {
            struct_name: struct_name.clone(),
            byte_size,
            packed: s.packed.unwrap_or(false),
            fields,
        };
        schema
            .validate()
            .map_err(|e| ConfigError::Schema { struct_name, source: e })?;
        schemas.push((id, schema));
    }
    Ok(schemas)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
    #[error("Invalid schema '{struct_name}': {source}")]
    Schema {
        struct_name: String,
        source: SchemaError,
    },
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
