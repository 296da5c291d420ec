//! Error taxonomy for printer link operations

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the operation surface
#[derive(Debug, Error)]
pub enum Error {
    /// The Bluetooth daemon rejected us (missing group membership or polkit rule)
    #[error("bluetooth permission denied")]
    PermissionDenied,

    /// The local adapter is powered off
    #[error("bluetooth adapter is powered off")]
    AdapterOff,

    /// The peripheral is not known to the adapter
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Every establishment strategy was exhausted
    #[error("all connection attempts to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Mid-session read or write failure
    #[error("i/o failure on {address}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A read did not complete within its deadline
    #[error("read timed out on {0}")]
    ReadTimeout(String),

    /// Missing or empty address/payload
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a session but none exists
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl Error {
    /// Numeric code reported to host bridges alongside the message
    pub fn code(&self) -> u16 {
        match self {
            Error::PermissionDenied => 100,
            Error::AdapterOff => 101,
            Error::DeviceNotFound(_) => 102,
            Error::ConnectionFailed { .. } => 103,
            Error::Io { .. } => 104,
            Error::ReadTimeout(_) => 105,
            Error::InvalidArgument(_) => 106,
            Error::NotConnected(_) => 107,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PermissionDenied.code(), 100);
        assert_eq!(Error::AdapterOff.code(), 101);
        assert_eq!(Error::DeviceNotFound("AA".into()).code(), 102);
        assert_eq!(
            Error::ConnectionFailed {
                address: "AA".into(),
                reason: "refused".into()
            }
            .code(),
            103
        );
        assert_eq!(Error::InvalidArgument("empty".into()).code(), 106);
        assert_eq!(Error::NotConnected("AA".into()).code(), 107);
    }

    #[test]
    fn test_connection_failed_carries_last_cause() {
        let err = Error::ConnectionFailed {
            address: "00:11:22:33:44:55".into(),
            reason: "host is down".into(),
        };
        let message = err.to_string();
        assert!(message.contains("00:11:22:33:44:55"));
        assert!(message.contains("host is down"));
    }
}
