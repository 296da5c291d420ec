//! Connection manager: session map, per-address serialization, state machine
//!
//! Each address has a slot guarded by its own mutex; holding it for the whole
//! of a connect, write or disconnect is what serializes operations on one
//! physical link while unrelated devices proceed concurrently. Read loops and
//! keep-alive monitors report faults over a channel into the same teardown
//! path an explicit disconnect takes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::keepalive::{self, MAX_PROBE_INTERVAL};
use crate::connection::read_loop;
use crate::connection::session::{ReaderState, Session};
use crate::connection::Fault;
use crate::error::{Error, Result};
use crate::events::{ConnectionState, Event, EventBroadcaster, LinkStatus};
use crate::transport::Establish;

/// Tunables for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default timeout for session establishment
    pub connect_timeout: Duration,
    /// Deadline for a single keep-alive probe
    pub probe_timeout: Duration,
    /// Read loop buffer size
    pub read_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            read_buffer: 1024,
        }
    }
}

/// Per-address state; the surrounding mutex serializes connect, write and
/// disconnect for that address
#[derive(Default)]
struct Slot {
    state: ConnectionState,
    session: Option<Session>,
}

struct Inner {
    config: ManagerConfig,
    establisher: Arc<dyn Establish>,
    events: EventBroadcaster,
    slots: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
    faults: mpsc::UnboundedSender<Fault>,
}

/// Orchestrates sessions: at most one per address, each with a read loop and
/// keep-alive monitor while connected
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create the manager and start its fault reaper
    pub fn new(
        establisher: Arc<dyn Establish>,
        events: EventBroadcaster,
        config: ManagerConfig,
    ) -> Self {
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<Fault>();
        let inner = Arc::new(Inner {
            config,
            establisher,
            events,
            slots: RwLock::new(HashMap::new()),
            faults: fault_tx,
        });

        // Faults funnel into the same teardown path as an explicit
        // disconnect. Each one runs in its own task so a busy address cannot
        // hold up faults for the others.
        let reaper = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(fault) = fault_rx.recv().await {
                let Some(inner) = reaper.upgrade() else { break };
                warn!(address = %fault.address, reason = %fault.reason, "link fault");
                tokio::spawn(async move {
                    inner.teardown_by_address(&fault.address).await;
                });
            }
        });

        Self { inner }
    }

    /// Establish a session. An already-connected address returns immediately
    /// without touching the establisher.
    pub async fn connect(&self, address: &str, timeout: Option<Duration>) -> Result<()> {
        let address = valid_address(address)?;
        let timeout = timeout.unwrap_or(self.inner.config.connect_timeout);
        let slot = self.inner.slot(address).await;
        let mut guard = slot.lock().await;

        if guard.state == ConnectionState::Connected && guard.session.is_some() {
            debug!(address, "already connected");
            return Ok(());
        }
        self.inner.open_session(&mut guard, address, timeout).await
    }

    /// Tear down the session for an address. Succeeds when none exists.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let address = valid_address(address)?;
        let slot = self.inner.slot(address).await;
        let mut guard = slot.lock().await;
        self.inner.teardown(&mut guard, address).await;
        Ok(())
    }

    /// Write a payload, establishing a transient session when none exists.
    /// With `keep_connected` false the session is removed afterwards no
    /// matter how the write went.
    pub async fn write(&self, address: &str, payload: &[u8], keep_connected: bool) -> Result<()> {
        let address = valid_address(address)?;
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload must not be empty".into()));
        }
        let slot = self.inner.slot(address).await;
        let mut guard = slot.lock().await;

        if guard.session.is_none() {
            self.inner
                .open_session(&mut guard, address, self.inner.config.connect_timeout)
                .await?;
        }
        let result = self.inner.write_payload(&mut guard, address, payload).await;
        if !keep_connected {
            // Guaranteed cleanup, success or not.
            self.inner.teardown(&mut guard, address).await;
        }
        result
    }

    /// (Re)start the read loop. Any existing loop is stopped first, so a
    /// single address never runs two loops.
    pub async fn start_reading(&self, address: &str) -> Result<()> {
        let address = valid_address(address)?;
        let slot = self.inner.slot(address).await;
        let mut guard = slot.lock().await;
        let Some(session) = guard.session.as_mut() else {
            return Err(Error::NotConnected(address.to_string()));
        };

        let reader = match std::mem::replace(&mut session.reader, ReaderState::Lost) {
            ReaderState::Running(handle) => handle.stop().await,
            ReaderState::Parked(reader) => Some(reader),
            ReaderState::Lost => None,
        };
        match reader {
            Some(reader) => {
                session.reader = ReaderState::Running(read_loop::spawn(
                    address.to_string(),
                    reader,
                    self.inner.config.read_buffer,
                    self.inner.events.clone(),
                    self.inner.faults.clone(),
                ));
                Ok(())
            }
            None => Err(Error::NotConnected(address.to_string())),
        }
    }

    /// Stop the read loop, parking the reader for a later restart.
    /// Succeeds when nothing is running.
    pub async fn stop_reading(&self, address: &str) -> Result<()> {
        let address = valid_address(address)?;
        let slot = self.inner.slot(address).await;
        let mut guard = slot.lock().await;
        if let Some(session) = guard.session.as_mut() {
            session.reader = match std::mem::replace(&mut session.reader, ReaderState::Lost) {
                ReaderState::Running(handle) => match handle.stop().await {
                    Some(reader) => ReaderState::Parked(reader),
                    None => ReaderState::Lost,
                },
                other => other,
            };
        }
        Ok(())
    }

    /// Current state for an address
    pub async fn state(&self, address: &str) -> ConnectionState {
        let slot = { self.inner.slots.read().await.get(address).cloned() };
        match slot {
            Some(slot) => slot.lock().await.state,
            None => ConnectionState::Disconnected,
        }
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.state(address).await == ConnectionState::Connected
    }

    /// Addresses with a live session
    pub async fn connected_addresses(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = {
            let map = self.inner.slots.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut connected = Vec::new();
        for (address, slot) in slots {
            if slot.lock().await.state == ConnectionState::Connected {
                connected.push(address);
            }
        }
        connected
    }
}

fn valid_address(address: &str) -> Result<&str> {
    if address.trim().is_empty() {
        return Err(Error::InvalidArgument("address must not be empty".into()));
    }
    Ok(address)
}

impl Inner {
    async fn slot(&self, address: &str) -> Arc<Mutex<Slot>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(address) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots.entry(address.to_string()).or_default().clone()
    }

    fn set_state(&self, guard: &mut Slot, address: &str, state: ConnectionState) {
        guard.state = state;
        self.events.publish(Event::ConnectionState {
            address: address.to_string(),
            state,
        });
    }

    async fn open_session(&self, guard: &mut Slot, address: &str, timeout: Duration) -> Result<()> {
        self.set_state(guard, address, ConnectionState::Connecting);
        info!(address, "connecting");

        let stream = match self.establisher.establish(address, timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(address, error = %err, "establishment failed");
                self.set_state(guard, address, ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let (mut session, reader) = Session::open(address.to_string(), stream);
        session.reader = ReaderState::Running(read_loop::spawn(
            address.to_string(),
            reader,
            self.config.read_buffer,
            self.events.clone(),
            self.faults.clone(),
        ));
        let probe_interval = timeout.min(MAX_PROBE_INTERVAL);
        session.keepalive = Some(keepalive::spawn(
            address.to_string(),
            session.writer.clone(),
            probe_interval,
            self.config.probe_timeout,
            self.faults.clone(),
        ));
        guard.session = Some(session);
        self.set_state(guard, address, ConnectionState::Connected);
        info!(address, "connected");
        Ok(())
    }

    async fn write_payload(&self, guard: &mut Slot, address: &str, payload: &[u8]) -> Result<()> {
        let Some(session) = guard.session.as_mut() else {
            return Err(Error::NotConnected(address.to_string()));
        };
        let total = payload.len();
        self.events.publish(Event::Progress { total, progress: 0 });

        let outcome = {
            let mut writer = session.writer.lock().await;
            match writer.write_all(payload).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        match outcome {
            Ok(()) => {
                session.touch();
                self.events.publish(Event::Progress {
                    total,
                    progress: total,
                });
                debug!(address, bytes = total, "payload written");
                Ok(())
            }
            Err(err) => Err(Error::Io {
                address: address.to_string(),
                source: err,
            }),
        }
    }

    /// One teardown path for disconnects, read faults and probe faults.
    /// Every step is best-effort; the slot always ends Disconnected.
    async fn teardown(&self, guard: &mut Slot, address: &str) {
        let Some(mut session) = guard.session.take() else {
            if guard.state != ConnectionState::Disconnected {
                self.set_state(guard, address, ConnectionState::Disconnected);
            }
            return;
        };
        debug!(
            address = %session.address,
            idle = ?session.last_activity.elapsed(),
            "closing session"
        );
        self.set_state(guard, address, ConnectionState::Disconnecting);

        if let Some(monitor) = session.keepalive.take() {
            monitor.stop().await;
        }
        let reader = match std::mem::replace(&mut session.reader, ReaderState::Lost) {
            ReaderState::Running(handle) => handle.stop().await,
            ReaderState::Parked(reader) => Some(reader),
            ReaderState::Lost => None,
        };

        // Output side first; the input half and socket go down with the drop.
        {
            let mut writer = session.writer.lock().await;
            if let Err(err) = writer.flush().await {
                debug!(address, error = %err, "flush on close failed");
            }
            if let Err(err) = writer.shutdown().await {
                debug!(address, error = %err, "shutdown on close failed");
            }
        }
        drop(reader);
        drop(session);

        self.set_state(guard, address, ConnectionState::Disconnected);
        self.events.publish(Event::Status(LinkStatus::Disconnected));
        info!(address, "disconnected");
    }

    async fn teardown_by_address(&self, address: &str) {
        let slot = { self.slots.read().await.get(address).cloned() };
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            self.teardown(&mut guard, address).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Subscription;
    use crate::transport::TransportStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout as with_deadline;

    const ADDR: &str = "00:11:22:33:44:55";

    struct MemoryEstablisher {
        calls: AtomicUsize,
        delay: Duration,
        peers: std::sync::Mutex<Vec<DuplexStream>>,
    }

    impl MemoryEstablisher {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                peers: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn take_peer(&self) -> DuplexStream {
            self.peers.lock().unwrap().remove(0)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Establish for MemoryEstablisher {
        async fn establish(
            &self,
            _address: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn TransportStream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let (local, peer) = tokio::io::duplex(4096);
            self.peers.lock().unwrap().push(peer);
            Ok(Box::new(local))
        }
    }

    struct FailingEstablisher;

    #[async_trait]
    impl Establish for FailingEstablisher {
        async fn establish(
            &self,
            address: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn TransportStream>> {
            Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "service lookup rejected".into(),
            })
        }
    }

    /// Yields streams whose peer is already gone: writes fail, reads see EOF
    struct BrokenEstablisher;

    #[async_trait]
    impl Establish for BrokenEstablisher {
        async fn establish(
            &self,
            _address: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn TransportStream>> {
            let (local, peer) = tokio::io::duplex(64);
            drop(peer);
            Ok(Box::new(local))
        }
    }

    fn manager_with(establisher: Arc<dyn Establish>) -> (ConnectionManager, EventBroadcaster) {
        let events = EventBroadcaster::new();
        let manager = ConnectionManager::new(establisher, events.clone(), ManagerConfig::default());
        (manager, events)
    }

    async fn next_matching(
        sub: &mut Subscription,
        pred: impl Fn(&Event) -> bool,
    ) -> Event {
        with_deadline(Duration::from_secs(2), async {
            loop {
                let event = sub.recv().await.expect("broadcaster closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let est = MemoryEstablisher::new();
        let (manager, _events) = manager_with(est.clone());

        manager.connect(ADDR, None).await.unwrap();
        manager.connect(ADDR, None).await.unwrap();

        assert_eq!(est.calls(), 1);
        assert!(manager.is_connected(ADDR).await);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_session() {
        let est = MemoryEstablisher::with_delay(Duration::from_millis(50));
        let (manager, _events) = manager_with(est.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.connect(ADDR, None).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(est.calls(), 1);
        assert_eq!(manager.connected_addresses().await, vec![ADDR.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (manager, events) = manager_with(Arc::new(FailingEstablisher));
        let mut sub = events.subscribe().await;

        let err = manager.connect("AA:BB", None).await.unwrap_err();
        assert_eq!(err.code(), 103);
        assert_eq!(manager.state("AA:BB").await, ConnectionState::Disconnected);

        let first = next_matching(&mut sub, |e| matches!(e, Event::ConnectionState { .. })).await;
        assert!(matches!(
            first,
            Event::ConnectionState {
                state: ConnectionState::Connecting,
                ..
            }
        ));
        let second = next_matching(&mut sub, |e| matches!(e, Event::ConnectionState { .. })).await;
        assert!(matches!(
            second,
            Event::ConnectionState {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_emits_connecting_then_connected() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est);
        let mut sub = events.subscribe().await;

        manager.connect(ADDR, None).await.unwrap();

        for expected in [ConnectionState::Connecting, ConnectionState::Connected] {
            let event =
                next_matching(&mut sub, |e| matches!(e, Event::ConnectionState { .. })).await;
            assert!(
                matches!(event, Event::ConnectionState { state, .. } if state == expected),
                "expected {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_write_reaches_peer_with_two_progress_events() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est.clone());
        let mut sub = events.subscribe().await;

        manager.write(ADDR, b"PRINT ME", true).await.unwrap();

        let mut peer = est.take_peer();
        let mut buf = vec![0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PRINT ME");

        let first = next_matching(&mut sub, |e| matches!(e, Event::Progress { .. })).await;
        assert!(matches!(
            first,
            Event::Progress {
                total: 8,
                progress: 0
            }
        ));
        let second = next_matching(&mut sub, |e| matches!(e, Event::Progress { .. })).await;
        assert!(matches!(
            second,
            Event::Progress {
                total: 8,
                progress: 8
            }
        ));

        // two progress events per write, never a third
        let third = with_deadline(
            Duration::from_millis(150),
            next_matching(&mut sub, |e| matches!(e, Event::Progress { .. })),
        )
        .await;
        assert!(third.is_err());
        assert!(manager.is_connected(ADDR).await);
    }

    #[tokio::test]
    async fn test_write_without_keep_connected_removes_session() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est);
        let mut sub = events.subscribe().await;

        manager.write(ADDR, b"receipt", false).await.unwrap();

        assert!(!manager.is_connected(ADDR).await);
        assert_eq!(manager.state(ADDR).await, ConnectionState::Disconnected);

        for expected in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ] {
            let event =
                next_matching(&mut sub, |e| matches!(e, Event::ConnectionState { .. })).await;
            assert!(
                matches!(event, Event::ConnectionState { state, .. } if state == expected),
                "expected {expected:?}"
            );
        }
        let status = next_matching(&mut sub, |e| matches!(e, Event::Status(_))).await;
        assert!(matches!(status, Event::Status(LinkStatus::Disconnected)));
    }

    #[tokio::test]
    async fn test_write_failure_still_tears_down() {
        let (manager, _events) = manager_with(Arc::new(BrokenEstablisher));

        let err = manager.write(ADDR, b"x", false).await.unwrap_err();
        assert_eq!(err.code(), 104);
        assert!(!manager.is_connected(ADDR).await);
        assert_eq!(manager.state(ADDR).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (manager, _events) = manager_with(MemoryEstablisher::new());

        let err = manager.write(ADDR, b"", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = manager.connect("", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = manager.start_reading("never-seen").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_stops_read_loop() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est.clone());
        let mut sub = events.subscribe().await;

        manager.connect(ADDR, None).await.unwrap();
        let mut peer = est.take_peer();

        peer.write_all(b"STATUS OK").await.unwrap();
        let data = next_matching(&mut sub, |e| matches!(e, Event::Data { .. })).await;
        assert!(matches!(data, Event::Data { payload, .. } if payload.as_ref() == b"STATUS OK"));

        manager.disconnect(ADDR).await.unwrap();
        assert!(!manager.is_connected(ADDR).await);

        // socket is closed: the peer cannot write any more
        assert!(peer.write_all(b"more").await.is_err());

        // and no stray data events show up afterwards
        let stray = with_deadline(Duration::from_millis(200), async {
            loop {
                match sub.recv().await {
                    Some(Event::Data { .. }) => return,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(stray.is_err());
    }

    #[tokio::test]
    async fn test_read_eof_is_terminal_and_reaps_session() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est.clone());
        let mut sub = events.subscribe().await;

        manager.connect(ADDR, None).await.unwrap();
        let peer = est.take_peer();
        drop(peer);

        let read_err = next_matching(&mut sub, |e| matches!(e, Event::ReadError { .. })).await;
        assert!(
            matches!(read_err, Event::ReadError { ref address, .. } if address.as_str() == ADDR)
        );

        // the fault reaper runs the disconnect path
        next_matching(&mut sub, |e| {
            matches!(
                e,
                Event::ConnectionState {
                    state: ConnectionState::Disconnected,
                    ..
                }
            )
        })
        .await;
        assert!(!manager.is_connected(ADDR).await);
    }

    #[tokio::test]
    async fn test_stop_reading_parks_and_restart_resumes() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est.clone());
        let mut sub = events.subscribe().await;

        manager.connect(ADDR, None).await.unwrap();
        let mut peer = est.take_peer();

        manager.stop_reading(ADDR).await.unwrap();
        peer.write_all(b"while-stopped").await.unwrap();

        let quiet = with_deadline(
            Duration::from_millis(150),
            next_matching(&mut sub, |e| matches!(e, Event::Data { .. })),
        )
        .await;
        assert!(quiet.is_err(), "no data may be delivered while stopped");

        manager.start_reading(ADDR).await.unwrap();
        let data = next_matching(&mut sub, |e| matches!(e, Event::Data { .. })).await;
        assert!(
            matches!(data, Event::Data { payload, .. } if payload.as_ref() == b"while-stopped")
        );
    }

    #[tokio::test]
    async fn test_keepalive_failure_triggers_teardown() {
        let est = MemoryEstablisher::new();
        let (manager, events) = manager_with(est.clone());
        let mut sub = events.subscribe().await;

        // short timeout drives a short probe interval
        manager
            .connect(ADDR, Some(Duration::from_millis(40)))
            .await
            .unwrap();
        // park the reader so only the monitor can notice the dead link
        manager.stop_reading(ADDR).await.unwrap();
        let peer = est.take_peer();
        drop(peer);

        next_matching(&mut sub, |e| {
            matches!(
                e,
                Event::ConnectionState {
                    state: ConnectionState::Disconnected,
                    ..
                }
            )
        })
        .await;
        assert!(!manager.is_connected(ADDR).await);
    }

    #[tokio::test]
    async fn test_unknown_address_reads_as_disconnected() {
        let (manager, _events) = manager_with(MemoryEstablisher::new());
        assert_eq!(
            manager.state("66:77:88:99:AA:BB").await,
            ConnectionState::Disconnected
        );
        assert!(manager.connected_addresses().await.is_empty());
    }
}
