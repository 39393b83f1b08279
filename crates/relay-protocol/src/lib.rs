// relay-protocol: the visualization bridge wire protocol.
//
// A frozen subset of the `foxglove.websocket.v1` subprotocol: the JSON
// messages exchanged over text frames use a top-level `op` field for
// discriminated deserialization, and server-to-client message data travels
// in a fixed-layout binary frame.

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol negotiated at upgrade time.
pub const SUBPROTOCOL: &str = "foxglove.websocket.v1";

/// First byte of every server-to-client binary frame.
pub const MESSAGE_DATA_OPCODE: u8 = 0x01;

// ---------------------------------------------------------------------------
// Server -> client JSON messages
// ---------------------------------------------------------------------------

/// Handshake greeting; the first message after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    /// Always empty: this server implements no optional capabilities.
    pub capabilities: Vec<String>,
    pub supported_encodings: Vec<String>,
    /// Monotonic per-process session identity (UTC nanoseconds).
    pub session_id: String,
}

/// One advertised channel.
///
/// Channel ids are assigned by the server before any client connects and
/// stay stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: u64,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema_encoding: String,
    /// Schema text in `schema_encoding` (JSON Schema for `jsondata`).
    pub schema: String,
}

/// The full channel listing, sent once per client right after `ServerInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertise {
    pub channels: Vec<Channel>,
}

/// All server-to-client JSON message kinds, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
#[serde(rename_all = "camelCase")]
pub enum ServerMessage {
    ServerInfo(ServerInfo),
    Advertise(Advertise),
}

// ---------------------------------------------------------------------------
// Client -> server JSON messages
// ---------------------------------------------------------------------------

/// One subscription request entry: the id is chosen by the client and scoped
/// to its connection; the channel id must be one the server advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSubscription {
    pub id: u32,
    pub channel_id: u64,
}

/// All client-to-server JSON message kinds, tagged by `op`.
///
/// Unknown ops fail deserialization; the server ignores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { subscriptions: Vec<ClientSubscription> },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_ids: Vec<u32> },
}

// ---------------------------------------------------------------------------
// Binary message data frames
// ---------------------------------------------------------------------------

/// A decoded server-to-client binary frame.
///
/// Layout: `[0x01][subscription_id u32 LE][log_time u64 LE ns][payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageData<'a> {
    pub subscription_id: u32,
    pub log_time_ns: u64,
    pub payload: &'a [u8],
}

/// Encode one message-data frame.
pub fn encode_message_data(subscription_id: u32, log_time_ns: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4 + 8 + payload.len());
    frame.push(MESSAGE_DATA_OPCODE);
    frame.extend_from_slice(&subscription_id.to_le_bytes());
    frame.extend_from_slice(&log_time_ns.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a message-data frame; `None` for a wrong opcode or a short frame.
pub fn decode_message_data(frame: &[u8]) -> Option<MessageData<'_>> {
    if frame.len() < 13 || frame[0] != MESSAGE_DATA_OPCODE {
        return None;
    }
    let subscription_id = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let log_time_ns = u64::from_le_bytes([
        frame[5], frame[6], frame[7], frame[8], frame[9], frame[10], frame[11], frame[12],
    ]);
    Some(MessageData {
        subscription_id,
        log_time_ns,
        payload: &frame[13..],
    })
}

// ---------------------------------------------------------------------------
// Unit tests (frozen wire shapes)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_serializes_with_frozen_keys() {
        let msg = ServerMessage::ServerInfo(ServerInfo {
            name: "telemetry relay".to_owned(),
            capabilities: vec![],
            supported_encodings: vec![],
            session_id: "1700000000000000000".to_owned(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "serverInfo",
                "name": "telemetry relay",
                "capabilities": [],
                "supportedEncodings": [],
                "sessionId": "1700000000000000000",
            })
        );
    }

    #[test]
    fn advertise_serializes_with_frozen_keys() {
        let msg = ServerMessage::Advertise(Advertise {
            channels: vec![Channel {
                id: 3,
                topic: "telemetry/SensorSample".to_owned(),
                encoding: "json".to_owned(),
                schema_name: "SensorSample".to_owned(),
                schema_encoding: "jsonschema".to_owned(),
                schema: "{}".to_owned(),
            }],
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "advertise");
        let channel = &json["channels"][0];
        assert_eq!(channel["id"], 3);
        assert_eq!(channel["topic"], "telemetry/SensorSample");
        assert_eq!(channel["encoding"], "json");
        assert_eq!(channel["schemaName"], "SensorSample");
        assert_eq!(channel["schemaEncoding"], "jsonschema");
        assert_eq!(channel["schema"], "{}");
    }

    #[test]
    fn subscribe_parses_from_client_json() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"op":"subscribe","subscriptions":[{"id":7,"channelId":3}]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                subscriptions: vec![ClientSubscription { id: 7, channel_id: 3 }],
            }
        );
    }

    #[test]
    fn unsubscribe_parses_from_client_json() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"op":"unsubscribe","subscriptionIds":[7,9]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unsubscribe {
                subscription_ids: vec![7, 9],
            }
        );
    }

    #[test]
    fn unknown_op_fails_deserialization() {
        let res = serde_json::from_str::<ClientMessage>(r#"{"op":"getParameters","ids":[]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn message_data_layout_is_frozen() {
        let frame = encode_message_data(7, 0x0102_0304_0506_0708, b"{}");
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..5], &[7, 0, 0, 0]);
        assert_eq!(
            &frame[5..13],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(&frame[13..], b"{}");
    }

    #[test]
    fn message_data_round_trips() {
        let frame = encode_message_data(42, 1_700_000_000_000_000_000, b"{\"x\":1}");
        let decoded = decode_message_data(&frame).unwrap();
        assert_eq!(decoded.subscription_id, 42);
        assert_eq!(decoded.log_time_ns, 1_700_000_000_000_000_000);
        assert_eq!(decoded.payload, b"{\"x\":1}");
    }

    #[test]
    fn short_or_foreign_frames_do_not_decode() {
        assert!(decode_message_data(&[0x01; 12]).is_none());
        let mut frame = encode_message_data(1, 2, b"");
        frame[0] = 0x02;
        assert!(decode_message_data(&frame).is_none());
    }
}
