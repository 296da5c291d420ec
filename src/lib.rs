//! printlink — Bluetooth serial printer link
//!
//! Manages the lifecycle of RFCOMM byte-stream sessions to nearby printer
//! peripherals: ordered-fallback establishment, a cancellable read loop and
//! keep-alive monitor per connection, per-address operation serialization,
//! and fan-out of discovery/status/data events to a dynamic set of
//! subscribers.
//!
//! Payloads are opaque bytes; no printer command language is interpreted
//! here. Consumers frame the data stream themselves.

pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod service;
pub mod transport;

pub use connection::{ConnectionManager, ManagerConfig};
pub use device::{Device, DeviceRegistry};
pub use error::{Error, Result};
pub use events::{
    AdapterState, ConnectionState, Event, EventBroadcaster, LinkStatus, SubscriberId, Subscription,
};
pub use service::PrinterService;
pub use transport::{
    ConnectStrategy, Establish, Establisher, RfcommEstablisher, TransportStream,
};
