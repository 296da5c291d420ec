//! Facade wiring the manager, discovery and adapter control into the
//! operation surface consumed by host bridges
//!
//! Thin glue by design: the logic worth testing lives in the connection and
//! transport modules, which this type only assembles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bluer::{Adapter, Session};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::connection::{ConnectionManager, ManagerConfig};
use crate::device::{Device, DeviceRegistry};
use crate::error::Result;
use crate::events::{AdapterState, Event, EventBroadcaster, SubscriberId, Subscription};
use crate::transport::discovery::{AdapterWatch, DeviceScanner};
use crate::transport::rfcomm::{daemon_error, RfcommEstablisher};

/// Printer link service: session management, discovery and event streams
pub struct PrinterService {
    adapter: Adapter,
    events: EventBroadcaster,
    manager: ConnectionManager,
    registry: Arc<RwLock<DeviceRegistry>>,
    scanner: DeviceScanner,
    watch: AdapterWatch,
    /// Subscribers holding the discovery scan alive
    discovery_subs: Mutex<HashSet<SubscriberId>>,
}

impl PrinterService {
    /// Connect to the system Bluetooth daemon and assemble the subsystem
    pub async fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default()).await
    }

    pub async fn with_config(config: ManagerConfig) -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|err| daemon_error("adapter", err))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|err| daemon_error("adapter", err))?;

        let events = EventBroadcaster::new();
        let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
        let establisher = Arc::new(RfcommEstablisher::with_session(
            session.clone(),
            adapter.clone(),
        ));
        let manager = ConnectionManager::new(establisher, events.clone(), config);
        let scanner = DeviceScanner::new(adapter.clone(), registry.clone(), events.clone());
        let watch = AdapterWatch::spawn(adapter.clone(), events.clone()).await?;

        Ok(Self {
            adapter,
            events,
            manager,
            registry,
            scanner,
            watch,
            discovery_subs: Mutex::new(HashSet::new()),
        })
    }

    /// Establish a session to a peripheral
    pub async fn connect(&self, address: &str, timeout: Option<Duration>) -> Result<()> {
        self.manager.connect(address, timeout).await
    }

    /// Tear down the session for a peripheral
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        self.manager.disconnect(address).await
    }

    /// Write opaque bytes, connecting transiently when needed
    pub async fn write(&self, address: &str, payload: &[u8], keep_connected: bool) -> Result<()> {
        self.manager.write(address, payload, keep_connected).await
    }

    pub async fn start_reading(&self, address: &str) -> Result<()> {
        self.manager.start_reading(address).await
    }

    pub async fn stop_reading(&self, address: &str) -> Result<()> {
        self.manager.stop_reading(address).await
    }

    /// Adapter state as reported to `get_state`
    pub async fn get_state(&self) -> AdapterState {
        match self.adapter.is_powered().await {
            Ok(true) => AdapterState::On,
            Ok(false) => AdapterState::Off,
            Err(err) => match err.kind {
                bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
                    AdapterState::PermissionDenied
                }
                _ => AdapterState::Unknown,
            },
        }
    }

    /// Best-effort request to power the adapter on
    pub async fn enable_bluetooth(&self) -> bool {
        self.adapter.set_powered(true).await.is_ok()
    }

    /// BlueZ has no runtime permission dialog; granted means the daemon
    /// accepts us as a client
    pub async fn request_permissions(&self) -> bool {
        matches!(
            self.get_state().await,
            AdapterState::On | AdapterState::Off
        )
    }

    /// Subscribe to the event streams. The bonded/known device set is
    /// delivered immediately, then the live scan feeds discoveries; the scan
    /// stops once the last subscriber is gone.
    pub async fn subscribe(&self) -> Subscription {
        match self.scanner.bonded_devices().await {
            Ok(bonded) => {
                let mut registry = self.registry.write().await;
                for device in bonded {
                    registry.insert(device);
                }
            }
            Err(err) => warn!(error = %err, "bonded device enumeration failed"),
        }

        let snapshot: Vec<Event> = self
            .registry
            .read()
            .await
            .snapshot()
            .into_iter()
            .map(Event::DeviceDiscovered)
            .collect();
        let subscription = self.events.subscribe_with(snapshot).await;

        self.discovery_subs.lock().await.insert(subscription.id);
        if let Err(err) = self.scanner.start_scan().await {
            warn!(error = %err, "device scan could not be started");
        }
        subscription
    }

    /// Remove a subscriber; removing an unknown id is a no-op
    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.events.unsubscribe(id).await;
        let mut subs = self.discovery_subs.lock().await;
        subs.remove(&id);
        if subs.is_empty() {
            self.scanner.stop_scan().await;
        }
    }

    /// Devices seen so far (bonded plus scan results)
    pub async fn known_devices(&self) -> Vec<Device> {
        self.registry.read().await.snapshot()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Stop background tasks (scan and adapter watch)
    pub async fn shutdown(self) {
        let PrinterService { scanner, watch, .. } = self;
        scanner.stop_scan().await;
        watch.stop().await;
    }
}
