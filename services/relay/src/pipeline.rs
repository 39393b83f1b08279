//! Frame → record transformer.
//!
//! Sits between the framer queue and the hub: COBS-decodes each frame,
//! splits off the packet id, runs the registry-driven parser, and publishes
//! the record. Every per-frame failure is a localized drop; nothing here
//! may stop ingestion.

use crate::hub::Hub;
use bytes::Bytes;
use chrono::Utc;
use packet_core::{PacketRegistry, cobs, decode_packet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Consume frames until the queue closes or shutdown fires.
pub async fn run_transformer(
    registry: Arc<PacketRegistry>,
    mut frame_rx: mpsc::Receiver<Bytes>,
    hub: Hub,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        let payload = match cobs::decode(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, len = frame.len(), "malformed frame dropped");
                continue;
            }
        };
        // Timestamp is captured at COBS decode success.
        let timestamp = Utc::now();
        let Some((&id, body)) = payload.split_first() else {
            // Zero-byte payload, nothing to decode.
            continue;
        };
        match decode_packet(&registry, id, body, timestamp) {
            Ok(record) => {
                if !hub.publish(Arc::new(record)).await {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "record dropped");
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
    use packet_core::{FieldDef, FieldType, PacketSchema, PacketValue};
    use std::time::Duration;

    struct Fixture {
        frame_tx: mpsc::Sender<Bytes>,
        sub: crate::hub::Subscription,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn fixture(registry: PacketRegistry) -> Fixture {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let hub = Hub::spawn(64, 100, shutdown.clone());
        let sub = hub.subscribe().await.unwrap();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        tokio::spawn(run_transformer(
            Arc::new(registry),
            frame_rx,
            hub,
            shutdown,
        ));
        Fixture {
            frame_tx,
            sub,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn next_record(fx: &mut Fixture) -> Arc<packet_core::PacketRecord> {
        tokio::time::timeout(Duration::from_secs(1), fx.sub.rx.recv())
            .await
            .expect("record expected")
            .unwrap()
    }

    #[tokio::test]
    async fn text_frame_becomes_text_record() {
        let mut fx = fixture(PacketRegistry::default()).await;
        fx.frame_tx
            .send(Bytes::from_static(&[0x04, 0xFF, 0x68, 0x69]))
            .await
            .unwrap();
        let record = next_record(&mut fx).await;
        assert_eq!(record.id, 0xFF);
        assert_eq!(record.payload, b"hi");
        assert_eq!(record.value, PacketValue::Text("hi".to_owned()));
    }

    #[tokio::test]
    async fn unknown_id_becomes_raw_record() {
        let mut fx = fixture(PacketRegistry::default()).await;
        fx.frame_tx
            .send(Bytes::from_static(&[0x04, 0x7E, 0x01, 0x02]))
            .await
            .unwrap();
        let record = next_record(&mut fx).await;
        assert_eq!(record.id, 0x7E);
        assert_eq!(record.payload, vec![0x01, 0x02]);
        assert_eq!(record.value, PacketValue::Raw);
    }

    #[tokio::test]
    async fn struct_frame_decodes_through_registry() {
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
                            name: "tick_ms".to_owned(),
                            ty: FieldType::Uint32,
                            offset: 4,
                            size: 4,
                        },
                    ],
                },
            )
            .unwrap();
        let mut fx = fixture(registry).await;
        // id 0x42, body F4 FF FF FF 7B 00 00 00, COBS-stuffed.
        let mut raw = vec![0x42, 0xF4, 0xFF, 0xFF, 0xFF, 0x7B, 0x00, 0x00, 0x00];
        let frame = cobs::encode(&raw);
        fx.frame_tx.send(Bytes::from(frame)).await.unwrap();
        let record = next_record(&mut fx).await;
        let PacketValue::Fields(fields) = &record.value else {
            panic!("expected fields, got {:?}", record.value);
        };
        assert_eq!(fields["value"], serde_json::json!(-12));
        assert_eq!(fields["tick_ms"], serde_json::json!(123));
        raw.remove(0);
        assert_eq!(record.payload, raw);
    }

    #[tokio::test]
    async fn malformed_and_empty_frames_are_dropped() {
        let mut fx = fixture(PacketRegistry::default()).await;
        // Invalid COBS code byte.
        fx.frame_tx
            .send(Bytes::from_static(&[0x00, 0x01]))
            .await
            .unwrap();
        // Decodes to a zero-byte payload (single 0x01 chunk).
        fx.frame_tx.send(Bytes::from_static(&[0x01])).await.unwrap();
        // Wrong body size for a registered id is tested elsewhere; a good
        // frame after the bad ones must still come through.
        fx.frame_tx
            .send(Bytes::from_static(&[0x02, 0x7E]))
            .await
            .unwrap();
        let record = next_record(&mut fx).await;
        assert_eq!(record.id, 0x7E);
        assert!(record.payload.is_empty());
    }

    #[tokio::test]
    async fn size_mismatch_drops_record_but_not_pipeline() {
        let registry = PacketRegistry::default();
        registry
            .register(
                0x42,
                PacketSchema {
                    struct_name: "SensorSample".to_owned(),
                    byte_size: 8,
                    packed: true,
                    fields: vec![FieldDef {
                        name: "value".to_owned(),
                        ty: FieldType::Int32,
                        offset: 0,
                        size: 4,
                    }],
                },
            )
            .unwrap();
        let mut fx = fixture(registry).await;
        // Body is 2 bytes, schema wants 8: dropped.
        fx.frame_tx
            .send(Bytes::from(cobs::encode(&[0x42, 0x01, 0x02])))
            .await
            .unwrap();
        fx.frame_tx
            .send(Bytes::from_static(&[0x02, 0x7E]))
            .await
            .unwrap();
        let record = next_record(&mut fx).await;
        assert_eq!(record.id, 0x7E);
    }
}
