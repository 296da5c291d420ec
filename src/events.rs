//! Event types and the fan-out broadcaster
//!
//! All externally observable callbacks flow through a single dispatch task,
//! so subscribers never receive concurrent callbacks from this subsystem.
//! Each subscriber has its own unbounded channel; a slow or dropped
//! subscriber never blocks delivery to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use crate::device::Device;

/// Connection lifecycle states for a single address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Wire code used by host bridges
    pub fn code(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
        }
    }
}

/// Adapter-level state reported by `get_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Off,
    On,
    PermissionDenied,
}

impl AdapterState {
    pub fn code(self) -> u8 {
        match self {
            AdapterState::Unknown => 0,
            AdapterState::Off => 1,
            AdapterState::On => 2,
            AdapterState::PermissionDenied => 3,
        }
    }
}

/// Coarse link status pushed on the status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    AdapterOff,
    AdapterOn,
}

impl LinkStatus {
    pub fn code(self) -> u8 {
        match self {
            LinkStatus::Disconnected => 0,
            LinkStatus::AdapterOff => 1,
            LinkStatus::AdapterOn => 2,
        }
    }
}

/// Events fanned out to all current subscribers
#[derive(Debug, Clone)]
pub enum Event {
    /// A peripheral was seen during a scan or bonded enumeration
    DeviceDiscovered(Device),
    /// The local adapter changed state while we were listening
    AdapterChanged(AdapterState),
    /// Per-address connection state transition
    ConnectionState {
        address: String,
        state: ConnectionState,
    },
    /// Raw bytes received from a peripheral. No framing is applied; a single
    /// event may hold a partial or several application messages.
    Data { address: String, payload: Bytes },
    /// Coarse link status (0 disconnected / 1 off / 2 on)
    Status(LinkStatus),
    /// Write progress, reported exactly twice per write: (total, 0) at start
    /// and (total, total) at completion
    Progress { total: usize, progress: usize },
    /// A read loop terminated on an i/o failure
    ReadError { address: String, reason: String },
}

pub type SubscriberId = u64;

/// A subscriber handle: identity plus the stream of delivered events
pub struct Subscription {
    pub id: SubscriberId,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Receive the next event; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

type SinkMap = HashMap<SubscriberId, mpsc::UnboundedSender<Event>>;

/// Fans events out to a dynamic set of subscribers
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: mpsc::UnboundedSender<Event>,
    sinks: Arc<RwLock<SinkMap>>,
    next_id: Arc<AtomicU64>,
}

impl EventBroadcaster {
    /// Create the broadcaster and start its dispatch task
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let sinks: Arc<RwLock<SinkMap>> = Arc::new(RwLock::new(HashMap::new()));

        let dispatch_sinks = sinks.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut dead = Vec::new();
                {
                    let sinks = dispatch_sinks.read().await;
                    for (id, sink) in sinks.iter() {
                        if sink.send(event.clone()).is_err() {
                            dead.push(*id);
                        }
                    }
                }
                if !dead.is_empty() {
                    let mut sinks = dispatch_sinks.write().await;
                    for id in dead {
                        trace!(subscriber = id, "pruning dropped subscriber");
                        sinks.remove(&id);
                    }
                }
            }
        });

        Self {
            tx,
            sinks,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue an event for delivery to all current subscribers
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register a subscriber; it sees future events only
    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_with(Vec::new()).await
    }

    /// Register a subscriber, delivering `snapshot` before any future event
    pub async fn subscribe_with(&self, snapshot: Vec<Event>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Queued before the sink becomes visible to the dispatch task, so the
        // snapshot always precedes live events.
        for event in snapshot {
            let _ = tx.send(event);
        }
        self.sinks.write().await.insert(id, tx);
        Subscription { id, events: rx }
    }

    /// Remove a subscriber. Removing an unknown id is a no-op.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.sinks.write().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.sinks.read().await.len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
