//! WebSocket bridge server.
//!
//! Speaks the `foxglove.websocket.v1` subprotocol to visualization clients:
//! advertises one channel per registered struct schema plus a text and a raw
//! channel, then routes hub records to subscribed clients as binary
//! message-data frames. Every client has a bounded send queue fed with
//! `try_send`; a slow client loses frames, never the server.
//!
//! Client teardown can be observed by the read loop and the write loop at
//! the same time; removal from the client map is the latching point, so the
//! send queue closes exactly once.

use crate::config::BridgeConfig;
use crate::hub::Subscription;
use axum::{
    Router,
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::any,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use packet_core::{PacketRecord, PacketRegistry, PacketValue};
use relay_protocol::{
    Advertise, Channel, ClientMessage, SUBPROTOCOL, ServerInfo, ServerMessage,
    encode_message_data,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// How long after shutdown fires the server waits for client tasks to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SERVER_NAME: &str = "rtt-relay";

// ---------------------------------------------------------------------------
// Transforms: record -> outbound channel messages
// ---------------------------------------------------------------------------

/// One encoded message bound for a channel.
pub struct Outbound {
    pub channel_id: u64,
    pub log_time_ns: u64,
    pub payload: Vec<u8>,
}

/// Derives outbound channel messages from decoded records.
///
/// The bridge ships only [`PacketTransform`]; collaborators with richer
/// renderings (markers, images, temperature plots) plug in through this
/// seam and own their channel id range.
pub trait Transform: Send + Sync {
    /// The channels this transform owns; advertised once per client.
    fn channels(&self) -> Vec<Channel>;
    /// Zero or more outbound messages for one record.
    fn apply(&self, record: &PacketRecord) -> Vec<Outbound>;
}

/// The default transform: the normalized packet record, routed to the
/// channel matching the record's decode outcome.
pub struct PacketTransform {
    channels: Vec<Channel>,
    /// packet id -> channel id for struct channels.
    struct_routes: HashMap<u8, u64>,
    text_channel: u64,
    raw_channel: u64,
}

impl PacketTransform {
    /// Build the channel table from the registry. Ids are assigned from 1 in
    /// ascending packet-id order and stay stable for the process lifetime.
    pub fn new(registry: &PacketRegistry) -> Self {
        let mut channels = Vec::new();
        let mut struct_routes = HashMap::new();
        let mut next_id = 1u64;
        for (packet_id, schema) in registry.snapshot() {
            channels.push(Channel {
                id: next_id,
                topic: format!("telemetry/{}", schema.struct_name),
                encoding: "json".to_owned(),
                schema_name: schema.struct_name.clone(),
                schema_encoding: "jsonschema".to_owned(),
                schema: struct_json_schema(&schema),
            });
            struct_routes.insert(packet_id, next_id);
            next_id += 1;
        }
        let text_channel = next_id;
        channels.push(Channel {
            id: text_channel,
            topic: "telemetry/log".to_owned(),
            encoding: "json".to_owned(),
            schema_name: "TextPacket".to_owned(),
            schema_encoding: "jsonschema".to_owned(),
            schema: record_json_schema("text", serde_json::json!({"type": "string"})),
        });
        let raw_channel = text_channel + 1;
        channels.push(Channel {
            id: raw_channel,
            topic: "telemetry/raw".to_owned(),
            encoding: "json".to_owned(),
            schema_name: "RawPacket".to_owned(),
            schema_encoding: "jsonschema".to_owned(),
            schema: record_json_schema("data", serde_json::json!({"type": "object"})),
        });
        PacketTransform {
            channels,
            struct_routes,
            text_channel,
            raw_channel,
        }
    }
}

impl Transform for PacketTransform {
    fn channels(&self) -> Vec<Channel> {
        self.channels.clone()
    }

    fn apply(&self, record: &PacketRecord) -> Vec<Outbound> {
        let channel_id = match &record.value {
            PacketValue::Text(_) => self.text_channel,
            PacketValue::Fields(_) => match self.struct_routes.get(&record.id) {
                Some(id) => *id,
                None => return Vec::new(),
            },
            PacketValue::Raw => self.raw_channel,
        };
        let payload = match serde_json::to_vec(&record.normalized()) {
            Ok(payload) => payload,
            Err(_) => return Vec::new(),
        };
        vec![Outbound {
            channel_id,
            log_time_ns: record.log_time_ns(),
            payload,
        }]
    }
}

/// JSON Schema for the normalized record envelope with the given body key.
fn record_json_schema(body_key: &str, body_schema: serde_json::Value) -> String {
    let mut properties = serde_json::Map::new();
    properties.insert("ts".to_owned(), serde_json::json!({"type": "string"}));
    properties.insert("id".to_owned(), serde_json::json!({"type": "string"}));
    properties.insert(
        "payload_hex".to_owned(),
        serde_json::json!({"type": "string"}),
    );
    properties.insert(body_key.to_owned(), body_schema);
    serde_json::json!({"type": "object", "properties": properties}).to_string()
}

/// JSON Schema for a struct channel: the envelope with a typed `data` object.
fn struct_json_schema(schema: &packet_core::PacketSchema) -> String {
    let mut properties = serde_json::Map::new();
    for field in &schema.fields {
        let ty = match field.ty {
            packet_core::FieldType::Bool => "boolean",
            packet_core::FieldType::Float | packet_core::FieldType::Double => "number",
            _ => "integer",
        };
        properties.insert(field.name.clone(), serde_json::json!({"type": ty}));
    }
    record_json_schema(
        "data",
        serde_json::json!({"type": "object", "properties": properties}),
    )
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

type SubscriptionMap = std::sync::RwLock<HashMap<u32, u64>>;

struct ClientHandle {
    tx: mpsc::Sender<Vec<u8>>,
    /// subscription id -> channel id; written by the client's read loop,
    /// read by the broadcast path under a short lock.
    subscriptions: Arc<SubscriptionMap>,
}

#[derive(Clone)]
struct BridgeState {
    session_id: Arc<String>,
    channels: Arc<Vec<Channel>>,
    advertised: Arc<HashSet<u64>>,
    clients: Arc<RwLock<HashMap<u64, ClientHandle>>>,
    next_client: Arc<AtomicU64>,
    send_buffer: usize,
    shutdown: watch::Receiver<bool>,
}

/// Ways the bridge can fail fatally.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge listen on {addr} failed: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("bridge server failed: {0}")]
    Serve(std::io::Error),
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Run the bridge until shutdown. Returns an error only for fatal listener
/// or server failures; per-client failures close that client and nothing
/// else.
pub async fn run_bridge(
    cfg: BridgeConfig,
    transforms: Vec<Box<dyn Transform>>,
    hub_sub: Subscription,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let listener = TcpListener::bind(cfg.listen)
        .await
        .map_err(|source| BridgeError::Listen {
            addr: cfg.listen,
            source,
        })?;
    info!(addr = %cfg.listen, "bridge listening");

    let channels: Vec<Channel> = transforms.iter().flat_map(|t| t.channels()).collect();
    let advertised: HashSet<u64> = channels.iter().map(|c| c.id).collect();
    let state = BridgeState {
        session_id: Arc::new(
            Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        ),
        channels: Arc::new(channels),
        advertised: Arc::new(advertised),
        clients: Arc::new(RwLock::new(HashMap::new())),
        next_client: Arc::new(AtomicU64::new(1)),
        send_buffer: cfg.send_buffer,
        shutdown: shutdown.clone(),
    };

    let broadcaster = tokio::spawn(run_broadcast(
        state.clone(),
        transforms,
        hub_sub,
        shutdown.clone(),
    ));

    let app = Router::new()
        .route("/", any(ws_handler))
        .with_state(state.clone());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(wait_shutdown(shutdown.clone()));

    // Serve until shutdown; give in-flight client tasks a bounded grace
    // period to drain before the send queues are closed.
    let result = tokio::select! {
        result = server => result.map_err(BridgeError::Serve),
        () = async {
            wait_shutdown(shutdown.clone()).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => Ok(()),
    };

    state.clients.write().await.clear();
    broadcaster.abort();
    result
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Per-client handling
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(mut socket: WebSocket, state: BridgeState) {
    let client_id = state.next_client.fetch_add(1, Ordering::Relaxed);

    // Handshake: serverInfo, then the full channel listing.
    let server_info = ServerMessage::ServerInfo(ServerInfo {
        name: SERVER_NAME.to_owned(),
        capabilities: vec![],
        supported_encodings: vec![],
        session_id: state.session_id.as_ref().clone(),
    });
    let advertise = ServerMessage::Advertise(Advertise {
        channels: state.channels.as_ref().clone(),
    });
    for msg in [&server_info, &advertise] {
        let Ok(json) = serde_json::to_string(msg) else {
            return;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(state.send_buffer);
    let subscriptions: Arc<SubscriptionMap> = Arc::new(std::sync::RwLock::new(HashMap::new()));
    state.clients.write().await.insert(
        client_id,
        ClientHandle {
            tx,
            subscriptions: Arc::clone(&subscriptions),
        },
    );
    debug!(client = client_id, "bridge client connected");

    // Write loop: drain the bounded send queue into binary frames. The queue
    // closes when the client is removed from the map, whichever side noticed
    // the failure first.
    let write_state = state.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                remove_client(&write_state, client_id).await;
                break;
            }
        }
    });

    // Read loop: subscription management only. Unknown ops and non-text
    // frames are ignored.
    let mut shutdown = state.shutdown.clone();
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            msg = ws_rx.next() => msg,
        };
        match msg {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { subscriptions: subs }) => {
                    let mut map = subscriptions
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    for sub in subs {
                        if state.advertised.contains(&sub.channel_id) {
                            trace!(client = client_id, sub = sub.id, channel = sub.channel_id, "subscribe");
                            map.insert(sub.id, sub.channel_id);
                        } else {
                            warn!(client = client_id, channel = sub.channel_id, "subscribe to unknown channel ignored");
                        }
                    }
                }
                Ok(ClientMessage::Unsubscribe { subscription_ids }) => {
                    let mut map = subscriptions
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    for id in subscription_ids {
                        map.remove(&id);
                    }
                }
                Err(e) => {
                    trace!(client = client_id, error = %e, "client message ignored");
                }
            },
            Some(Ok(_)) => {}
        }
    }

    remove_client(&state, client_id).await;
    let _ = writer.await;
    debug!(client = client_id, "bridge client disconnected");
}

/// Latching removal: the first caller drops the send queue sender, closing
/// the write loop; later callers find nothing.
async fn remove_client(state: &BridgeState, client_id: u64) {
    if state.clients.write().await.remove(&client_id).is_some() {
        trace!(client = client_id, "bridge client removed");
    }
}

// ---------------------------------------------------------------------------
// Broadcast path
// ---------------------------------------------------------------------------

async fn run_broadcast(
    state: BridgeState,
    transforms: Vec<Box<dyn Transform>>,
    mut hub_sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
            record = hub_sub.rx.recv() => match record {
                Some(record) => record,
                None => return,
            },
        };
        for transform in &transforms {
            for out in transform.apply(&record) {
                dispatch(&state, &out).await;
            }
        }
    }
}

/// Offer one outbound message to every matching subscription. The client
/// snapshot is taken under the read lock; sends happen outside it.
async fn dispatch(state: &BridgeState, out: &Outbound) {
    let snapshot: Vec<(mpsc::Sender<Vec<u8>>, Vec<u32>)> = {
        let clients = state.clients.read().await;
        clients
            .values()
            .map(|client| {
                let subs = client
                    .subscriptions
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let matching = subs
                    .iter()
                    .filter(|(_, channel)| **channel == out.channel_id)
                    .map(|(sub_id, _)| *sub_id)
                    .collect();
                (client.tx.clone(), matching)
            })
            .collect()
    };
    for (tx, sub_ids) in snapshot {
        for sub_id in sub_ids {
            let frame = encode_message_data(sub_id, out.log_time_ns, &out.payload);
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(sub = sub_id, "client send queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use packet_core::{FieldDef, FieldType, PacketSchema};

    fn registry_with_sample() -> PacketRegistry {
        let registry = PacketRegistry::default();
        registry
            .register(
                0x42,
                PacketSchema {
                    struct_name: "SensorSample".to_owned(),
                    byte_size: 8,
                    packed: true,
                    fields: vec![
                        FieldDef {
                            name: "value".to_owned(),
                            ty: FieldType::Int32,
                            offset: 0,
                            size: 4,
                        },
                        FieldDef {
                            name: "rate".to_owned(),
                            ty: FieldType::Float,
                            offset: 4,
                            size: 4,
                        },
                    ],
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn channel_table_covers_structs_text_and_raw() {
        let transform = PacketTransform::new(&registry_with_sample());
        let channels = transform.channels();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].id, 1);
        assert_eq!(channels[0].topic, "telemetry/SensorSample");
        assert_eq!(channels[0].schema_name, "SensorSample");
        assert_eq!(channels[0].encoding, "json");
        assert_eq!(channels[1].topic, "telemetry/log");
        assert_eq!(channels[2].topic, "telemetry/raw");
    }

    #[test]
    fn channel_ids_are_stable_across_builds() {
        let registry = registry_with_sample();
        let first = PacketTransform::new(&registry);
        let second = PacketTransform::new(&registry);
        let ids = |t: &PacketTransform| t.channels().iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn struct_schema_text_types_fields() {
        let transform = PacketTransform::new(&registry_with_sample());
        let schema: serde_json::Value =
            serde_json::from_str(&transform.channels()[0].schema).unwrap();
        let data = &schema["properties"]["data"]["properties"];
        assert_eq!(data["value"]["type"], "integer");
        assert_eq!(data["rate"]["type"], "number");
    }

    #[test]
    fn records_route_to_their_channel() {
        let transform = PacketTransform::new(&registry_with_sample());
        let at = chrono::Utc.timestamp_nanos(5);
        let mut fields = serde_json::Map::new();
        fields.insert("value".to_owned(), serde_json::json!(1));
        let cases = [
            (
                PacketRecord {
                    id: 0xFF,
                    timestamp: at,
                    payload: b"hi".to_vec(),
                    value: PacketValue::Text("hi".to_owned()),
                },
                2u64, // text channel follows the single struct channel
            ),
            (
                PacketRecord {
                    id: 0x42,
                    timestamp: at,
                    payload: vec![0; 8],
                    value: PacketValue::Fields(fields),
                },
                1u64,
            ),
            (
                PacketRecord {
                    id: 0x10,
                    timestamp: at,
                    payload: vec![1],
                    value: PacketValue::Raw,
                },
                3u64,
            ),
        ];
        for (record, expected_channel) in cases {
            let out = transform.apply(&record);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].channel_id, expected_channel);
            assert_eq!(out[0].log_time_ns, 5);
            let payload: serde_json::Value = serde_json::from_slice(&out[0].payload).unwrap();
            assert_eq!(payload["payload_hex"], record.payload_hex());
        }
    }

    #[test]
    fn empty_registry_still_advertises_text_and_raw() {
        let transform = PacketTransform::new(&PacketRegistry::default());
        let channels = transform.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].topic, "telemetry/log");
        assert_eq!(channels[1].topic, "telemetry/raw");
    }
}
