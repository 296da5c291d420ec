//! Peripheral discovery and adapter state monitoring
//!
//! The scanner task runs only while someone is subscribed to discovery; the
//! adapter watch runs for the whole service lifetime so power transitions are
//! reported even when no scan is active.

use std::sync::Arc;

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address};
use futures::StreamExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceRegistry};
use crate::error::Result;
use crate::events::{AdapterState, Event, EventBroadcaster, LinkStatus};
use crate::transport::rfcomm::daemon_error;

struct ScanHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Scans for peripherals and records them in the registry
pub struct DeviceScanner {
    adapter: Adapter,
    registry: Arc<RwLock<DeviceRegistry>>,
    events: EventBroadcaster,
    scan: Mutex<Option<ScanHandle>>,
}

impl DeviceScanner {
    pub fn new(
        adapter: Adapter,
        registry: Arc<RwLock<DeviceRegistry>>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            adapter,
            registry,
            events,
            scan: Mutex::new(None),
        }
    }

    /// Snapshot of bonded peripherals known to the adapter
    pub async fn bonded_devices(&self) -> Result<Vec<Device>> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(|err| daemon_error("adapter", err))?;

        let mut bonded = Vec::new();
        for address in addresses {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            if device.is_paired().await.unwrap_or(false) {
                bonded.push(snapshot_device(&device, address).await);
            }
        }
        Ok(bonded)
    }

    /// Start the active scan task. No-op when already scanning.
    pub async fn start_scan(&self) -> Result<()> {
        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            return Ok(());
        }

        let discover = self
            .adapter
            .discover_devices()
            .await
            .map_err(|err| daemon_error("adapter", err))?;

        info!("starting device scan");
        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(scan_loop(
            self.adapter.clone(),
            discover,
            self.registry.clone(),
            self.events.clone(),
            shutdown_rx,
        ));
        *scan = Some(ScanHandle { shutdown, join });
        Ok(())
    }

    /// Stop the active scan. No-op when none is running.
    pub async fn stop_scan(&self) {
        let handle = self.scan.lock().await.take();
        if let Some(handle) = handle {
            info!("stopping device scan");
            let _ = handle.shutdown.send(true);
            let _ = handle.join.await;
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.is_some()
    }
}

async fn scan_loop(
    adapter: Adapter,
    discover: impl futures::Stream<Item = AdapterEvent> + Send + 'static,
    registry: Arc<RwLock<DeviceRegistry>>,
    events: EventBroadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::pin!(discover);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = discover.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    let Ok(device) = adapter.device(address) else {
                        continue;
                    };
                    let snapshot = snapshot_device(&device, address).await;
                    debug!(address = %address, name = ?snapshot.name, "device discovered");
                    registry.write().await.insert(snapshot.clone());
                    events.publish(Event::DeviceDiscovered(snapshot));
                }
                Some(_) => {}
                None => {
                    warn!("discovery stream ended");
                    break;
                }
            }
        }
    }
    // Dropping the discovery stream ends the daemon-side scan.
}

async fn snapshot_device(device: &bluer::Device, address: Address) -> Device {
    Device {
        address: address.to_string(),
        name: device.name().await.ok().flatten(),
        device_class: device.class().await.ok().flatten().unwrap_or(0),
    }
}

/// Long-lived watcher publishing adapter power transitions
pub struct AdapterWatch {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AdapterWatch {
    pub async fn spawn(adapter: Adapter, events: EventBroadcaster) -> Result<Self> {
        let stream = adapter
            .events()
            .await
            .map_err(|err| daemon_error("adapter", err))?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = stream.next() => match event {
                        Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                            info!(powered, "adapter power changed");
                            if powered {
                                events.publish(Event::AdapterChanged(AdapterState::On));
                                events.publish(Event::Status(LinkStatus::AdapterOn));
                            } else {
                                events.publish(Event::AdapterChanged(AdapterState::Off));
                                events.publish(Event::Status(LinkStatus::AdapterOff));
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });
        Ok(Self { shutdown, join })
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
