//! RFCOMM connection strategies against BlueZ
//!
//! Three strategies are layered behind [`RfcommEstablisher`]:
//! secure service-record negotiation, the same without authentication, and a
//! direct fixed-channel connect for peripherals whose stack has no service
//! lookup. The daemon resolves the channel for the profile-based strategies
//! and hands the accepted socket back through the profile handle.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bluer::rfcomm::{
    Profile, ProfileHandle, ReqError, Role, SocketAddr as RfcommAddr, Stream as RfcommStream,
};
use bluer::{Adapter, Address, Session, Uuid};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::establisher::Establisher;
use crate::transport::traits::{ConnectStrategy, Establish, TransportStream};

/// Well-known Serial Port Profile identifier
pub const SERIAL_PORT_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

/// Channel tried when the peripheral's stack has no service lookup
pub const FALLBACK_CHANNEL: u8 = 1;

/// RFCOMM stream wrapper implementing [`TransportStream`]
#[derive(Debug)]
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> io::Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("malformed peripheral address '{address}'")))
}

fn strategy_io(target: Address, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Error {
    Error::Io {
        address: target.to_string(),
        source: io::Error::other(err),
    }
}

/// Map daemon errors onto the operation taxonomy
pub(crate) fn daemon_error(target: &str, err: bluer::Error) -> Error {
    match err.kind {
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => Error::PermissionDenied,
        bluer::ErrorKind::DoesNotExist => Error::DeviceNotFound(target.to_string()),
        _ => Error::Io {
            address: target.to_string(),
            source: io::Error::other(err),
        },
    }
}

/// Confirm the socket is usable in both directions before handing it over
fn verify(stream: RfcommStream, target: Address) -> Result<RfcommStream> {
    match stream.peer_addr() {
        Ok(_) => Ok(stream),
        Err(err) => {
            // Partially-opened handle; dropping it closes the socket.
            drop(stream);
            Err(strategy_io(target, err))
        }
    }
}

/// Wait for the daemon to hand over the socket for our connect request
async fn wait_for_handover(handle: &mut ProfileHandle, target: Address) -> Result<RfcommStream> {
    loop {
        let Some(request) = handle.next().await else {
            return Err(strategy_io(target, io::Error::other("profile handle closed")));
        };
        if request.device() == target {
            return request.accept().map_err(|err| strategy_io(target, err));
        }
        // Someone else's connection; not ours to take.
        let _ = request.reject(ReqError::Rejected);
    }
}

async fn connect_via_profile(
    session: &Session,
    adapter: &Adapter,
    target: Address,
    authenticate: bool,
    timeout: Duration,
) -> Result<RfcommStream> {
    let device = adapter
        .device(target)
        .map_err(|err| daemon_error(&target.to_string(), err))?;

    let profile = Profile {
        uuid: SERIAL_PORT_UUID,
        role: Some(Role::Client),
        require_authentication: Some(authenticate),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    };
    let mut handle = session
        .register_profile(profile)
        .await
        .map_err(|err| daemon_error(&target.to_string(), err))?;

    let stream = tokio::time::timeout(timeout, async {
        let connect = device.connect_profile(&SERIAL_PORT_UUID);
        tokio::pin!(connect);

        tokio::select! {
            handover = wait_for_handover(&mut handle, target) => {
                let stream = handover?;
                // The dbus call resolves once the profile is up; the socket
                // is already ours either way.
                let _ = tokio::time::timeout(Duration::from_secs(1), &mut connect).await;
                Ok(stream)
            }
            result = &mut connect => {
                result.map_err(|err| daemon_error(&target.to_string(), err))?;
                wait_for_handover(&mut handle, target).await
            }
        }
    })
    .await
    .map_err(|_| {
        strategy_io(
            target,
            io::Error::new(io::ErrorKind::TimedOut, "profile negotiation timed out"),
        )
    })??;

    verify(stream, target)
}

/// Secure service-record negotiation (pairing required)
pub struct SecureProfileStrategy {
    session: Session,
    adapter: Adapter,
}

impl SecureProfileStrategy {
    pub fn new(session: Session, adapter: Adapter) -> Self {
        Self { session, adapter }
    }
}

#[async_trait]
impl ConnectStrategy for SecureProfileStrategy {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>> {
        let target = parse_address(address)?;
        let stream =
            connect_via_profile(&self.session, &self.adapter, target, true, timeout).await?;
        Ok(Box::new(RfcommTransportStream::new(stream, target)))
    }

    fn name(&self) -> &'static str {
        "secure-profile"
    }
}

/// Service-record negotiation without authentication
pub struct InsecureProfileStrategy {
    session: Session,
    adapter: Adapter,
}

impl InsecureProfileStrategy {
    pub fn new(session: Session, adapter: Adapter) -> Self {
        Self { session, adapter }
    }
}

#[async_trait]
impl ConnectStrategy for InsecureProfileStrategy {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>> {
        let target = parse_address(address)?;
        let stream =
            connect_via_profile(&self.session, &self.adapter, target, false, timeout).await?;
        Ok(Box::new(RfcommTransportStream::new(stream, target)))
    }

    fn name(&self) -> &'static str {
        "insecure-profile"
    }
}

/// Direct connect to a fixed channel, bypassing service lookup
pub struct FixedChannelStrategy {
    channel: u8,
}

impl FixedChannelStrategy {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ConnectStrategy for FixedChannelStrategy {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>> {
        let target = parse_address(address)?;
        let socket_addr = RfcommAddr::new(target, self.channel);
        debug!(address, channel = self.channel, "direct RFCOMM connect");

        let stream = tokio::time::timeout(timeout, RfcommStream::connect(socket_addr))
            .await
            .map_err(|_| {
                strategy_io(
                    target,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|err| strategy_io(target, err))?;

        let stream = verify(stream, target)?;
        Ok(Box::new(RfcommTransportStream::new(stream, target)))
    }

    fn name(&self) -> &'static str {
        "fixed-channel"
    }
}

/// Establishes RFCOMM sessions by trying the ordered strategy list
pub struct RfcommEstablisher {
    adapter: Adapter,
    inner: Establisher,
}

impl RfcommEstablisher {
    /// Connect to the system daemon and build the default strategy order
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|err| daemon_error("adapter", err))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|err| daemon_error("adapter", err))?;
        Ok(Self::with_session(session, adapter))
    }

    /// Build on an existing daemon session
    pub fn with_session(session: Session, adapter: Adapter) -> Self {
        let strategies: Vec<Box<dyn ConnectStrategy>> = vec![
            Box::new(SecureProfileStrategy::new(session.clone(), adapter.clone())),
            Box::new(InsecureProfileStrategy::new(session, adapter.clone())),
            Box::new(FixedChannelStrategy::new(FALLBACK_CHANNEL)),
        ];
        Self {
            adapter,
            inner: Establisher::new(strategies),
        }
    }
}

#[async_trait]
impl Establish for RfcommEstablisher {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>> {
        if !self.adapter.is_powered().await.unwrap_or(false) {
            return Err(Error::AdapterOff);
        }
        self.inner.establish(address, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_port_uuid() {
        assert_eq!(
            SERIAL_PORT_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("00:11:22:33:44:55").is_ok());
        let err = parse_address("AA:BB").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
