//! Ordered-fallback connection establishment
//!
//! Peripheral firmware stacks support different subsets of the serial-profile
//! negotiation mechanism, so strategies are tried cheapest/most-compatible
//! first and the last underlying cause is reported when all of them fail.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::traits::{ConnectStrategy, Establish, TransportStream};

/// Tries an ordered list of strategies until one yields an open session
pub struct Establisher {
    strategies: Vec<Box<dyn ConnectStrategy>>,
}

impl Establisher {
    pub fn new(strategies: Vec<Box<dyn ConnectStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl Establish for Establisher {
    async fn establish(&self, address: &str, timeout: Duration) -> Result<Box<dyn TransportStream>> {
        let mut last_cause: Option<Error> = None;

        for strategy in &self.strategies {
            match strategy.establish(address, timeout).await {
                Ok(stream) => {
                    debug!(address, strategy = strategy.name(), "session established");
                    return Ok(stream);
                }
                // No later strategy can recover from these.
                Err(err @ Error::InvalidArgument(_))
                | Err(err @ Error::PermissionDenied)
                | Err(err @ Error::AdapterOff) => return Err(err),
                Err(err) => {
                    warn!(
                        address,
                        strategy = strategy.name(),
                        error = %err,
                        "connection attempt failed, falling back"
                    );
                    last_cause = Some(err);
                }
            }
        }

        let reason = match last_cause {
            Some(err) => err.to_string(),
            None => "no connection strategies configured".to_string(),
        };
        Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason,
        })
    }
}
