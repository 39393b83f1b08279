//! Non-blocking broadcast hub.
//!
//! One actor task owns the subscriber map; the rest of the pipeline talks to
//! it through three bounded queues (broadcast, register, unregister). Each
//! broadcast record is offered to every subscriber with `try_send`: a full
//! subscriber queue drops the record for that subscriber and nobody else.
//! A slow sink therefore cannot stall the producer or its peers.
//!
//! The actor owns every subscriber sender, so queue closure on shutdown or
//! unsubscribe happens exactly once, when the sender is dropped here.

use packet_core::PacketRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

pub type SubscriberId = u64;

/// A live hub subscription: receive until the hub closes the queue.
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Arc<PacketRecord>>,
}

struct Register {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<PacketRecord>>,
}

/// Cloneable handle to the hub actor.
#[derive(Clone)]
pub struct Hub {
    broadcast_tx: mpsc::Sender<Arc<PacketRecord>>,
    register_tx: mpsc::Sender<Register>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    next_id: Arc<AtomicU64>,
    default_capacity: usize,
}

impl Hub {
    /// Spawn the hub actor and return its handle.
    ///
    /// `broadcast_buffer` bounds the publish queue; `default_capacity` is the
    /// per-subscriber queue size used by [`Hub::subscribe`].
    pub fn spawn(
        broadcast_buffer: usize,
        default_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Hub {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_buffer);
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        tokio::spawn(run_actor(broadcast_rx, register_rx, unregister_rx, shutdown));
        Hub {
            broadcast_tx,
            register_tx,
            unregister_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            default_capacity,
        }
    }

    /// Publish one record to every subscriber. Returns `false` once the
    /// actor has shut down.
    pub async fn publish(&self, record: Arc<PacketRecord>) -> bool {
        self.broadcast_tx.send(record).await.is_ok()
    }

    /// Subscribe with the hub's default queue capacity.
    pub async fn subscribe(&self) -> Option<Subscription> {
        self.subscribe_with_capacity(self.default_capacity).await
    }

    /// Subscribe with an explicit per-subscriber queue capacity.
    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Option<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity);
        self.register_tx.send(Register { id, tx }).await.ok()?;
        Some(Subscription { id, rx })
    }

    /// Drop a subscription by id, closing its queue.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.unregister_tx.send(id).await;
    }
}

async fn run_actor(
    mut broadcast_rx: mpsc::Receiver<Arc<PacketRecord>>,
    mut register_rx: mpsc::Receiver<Register>,
    mut unregister_rx: mpsc::Receiver<SubscriberId>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<PacketRecord>>> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            reg = register_rx.recv() => {
                match reg {
                    Some(reg) => {
                        trace!(id = reg.id, "hub subscriber registered");
                        subscribers.insert(reg.id, reg.tx);
                    }
                    None => break,
                }
            }
            id = unregister_rx.recv() => {
                if let Some(id) = id {
                    // Dropping the sender closes the subscriber's queue.
                    if subscribers.remove(&id).is_some() {
                        trace!(id, "hub subscriber removed");
                    }
                }
            }
            record = broadcast_rx.recv() => {
                match record {
                    Some(record) => deliver(&mut subscribers, &record),
                    None => break,
                }
            }
        }
    }
    debug!(subscribers = subscribers.len(), "hub actor stopped");
    // Map drop closes every remaining subscriber queue.
}

fn deliver(
    subscribers: &mut HashMap<SubscriberId, mpsc::Sender<Arc<PacketRecord>>>,
    record: &Arc<PacketRecord>,
) {
    let mut gone = Vec::new();
    for (id, tx) in subscribers.iter() {
        match tx.try_send(Arc::clone(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(id, "subscriber queue full, record dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                gone.push(*id);
            }
        }
    }
    for id in gone {
        subscribers.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
