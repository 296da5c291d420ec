//! Per-address session state

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::connection::keepalive::KeepAliveHandle;
use crate::connection::read_loop::ReadLoopHandle;
use crate::transport::TransportStream;

pub(crate) type StreamReader = ReadHalf<Box<dyn TransportStream>>;
pub(crate) type StreamWriter = WriteHalf<Box<dyn TransportStream>>;

/// Reader-side bookkeeping: a running loop, a parked half ready for
/// restart, or lost to a terminal read failure
pub(crate) enum ReaderState {
    Running(ReadLoopHandle),
    Parked(StreamReader),
    Lost,
}

/// An open byte-stream session with a peripheral.
///
/// The socket is exclusively owned: the writer half sits behind a mutex
/// shared with the keep-alive monitor, the reader half belongs to the read
/// loop. Both halves are released exactly once, on teardown.
pub(crate) struct Session {
    pub address: String,
    pub writer: Arc<Mutex<StreamWriter>>,
    pub reader: ReaderState,
    pub keepalive: Option<KeepAliveHandle>,
    pub last_activity: Instant,
}

impl Session {
    /// Split the stream; the caller wires the returned reader into a loop
    pub fn open(address: String, stream: Box<dyn TransportStream>) -> (Self, StreamReader) {
        let (reader, writer) = tokio::io::split(stream);
        (
            Session {
                address,
                writer: Arc::new(Mutex::new(writer)),
                reader: ReaderState::Lost,
                keepalive: None,
                last_activity: Instant::now(),
            },
            reader,
        )
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
