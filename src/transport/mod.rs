pub mod discovery;
pub mod establisher;
pub mod rfcomm;
pub mod traits;

pub use discovery::{AdapterWatch, DeviceScanner};
pub use establisher::Establisher;
pub use rfcomm::{RfcommEstablisher, RfcommTransportStream, FALLBACK_CHANNEL, SERIAL_PORT_UUID};
pub use traits::{ConnectStrategy, Establish, TransportStream};
