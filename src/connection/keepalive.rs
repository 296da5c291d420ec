//! Keep-alive probing for silent link-loss detection
//!
//! RFCOMM gives no reliable notification of a peer-side disconnect and no
//! is-open query, so an open session is probed by writing a sentinel byte
//! through the shared writer. A failed or stalled probe reports a fault,
//! which tears the session down the same way an explicit disconnect does.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::connection::session::StreamWriter;
use crate::connection::Fault;

/// Probe payload; printers ignore a NUL byte
pub(crate) const SENTINEL: u8 = 0x00;

/// Upper bound on the probe interval, bounding worst-case staleness
pub(crate) const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct KeepAliveHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl KeepAliveHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Spawn a monitor probing `writer` every `interval`.
/// The writer mutex serializes probes against payload writes.
pub(crate) fn spawn(
    address: String,
    writer: Arc<Mutex<StreamWriter>>,
    interval: Duration,
    probe_timeout: Duration,
    faults: mpsc::UnboundedSender<Fault>,
) -> KeepAliveHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let probe = async {
                        let mut writer = writer.lock().await;
                        writer.write_all(&[SENTINEL]).await?;
                        writer.flush().await
                    };
                    match tokio::time::timeout(probe_timeout, probe).await {
                        Ok(Ok(())) => trace!(%address, "keep-alive probe ok"),
                        Ok(Err(err)) => {
                            warn!(%address, error = %err, "keep-alive probe failed");
                            let _ = faults.send(Fault {
                                address,
                                reason: format!("keep-alive probe failed: {err}"),
                            });
                            break;
                        }
                        Err(_) => {
                            warn!(%address, "keep-alive probe timed out");
                            let _ = faults.send(Fault {
                                address,
                                reason: "keep-alive probe timed out".to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        }
    });
    KeepAliveHandle { shutdown, join }
}
