//! Background read loop, one per open connection

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::session::StreamReader;
use crate::connection::Fault;
use crate::events::{Event, EventBroadcaster};

/// Handle to a running read loop
pub(crate) struct ReadLoopHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Option<StreamReader>>,
}

impl ReadLoopHandle {
    /// Stop the loop. Returns the reader when it shut down cleanly, so
    /// reading can be restarted on the same session.
    pub async fn stop(self) -> Option<StreamReader> {
        let _ = self.shutdown.send(true);
        self.join.await.unwrap_or(None)
    }
}

/// Spawn a loop forwarding chunks from `reader` as data events.
///
/// End-of-stream and i/o errors are terminal: a read-error event and a
/// fault are emitted and the loop exits without retrying. A new connect is
/// required to resume after a failure.
pub(crate) fn spawn(
    address: String,
    mut reader: StreamReader,
    buffer_size: usize,
    events: EventBroadcaster,
    faults: mpsc::UnboundedSender<Fault>,
) -> ReadLoopHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(%address, "read loop cancelled");
                    return Some(reader);
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        warn!(%address, "stream closed by peer");
                        let reason = "stream closed by peer".to_string();
                        events.publish(Event::ReadError {
                            address: address.clone(),
                            reason: reason.clone(),
                        });
                        let _ = faults.send(Fault { address, reason });
                        return None;
                    }
                    Ok(n) => {
                        events.publish(Event::Data {
                            address: address.clone(),
                            payload: Bytes::copy_from_slice(&buf[..n]),
                        });
                    }
                    Err(err) => {
                        warn!(%address, error = %err, "read failed");
                        let reason = err.to_string();
                        events.publish(Event::ReadError {
                            address: address.clone(),
                            reason: reason.clone(),
                        });
                        let _ = faults.send(Fault { address, reason });
                        return None;
                    }
                }
            }
        }
    });
    ReadLoopHandle { shutdown, join }
}
