use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::net::addr::Address;
use crate::proxy::negotiator::NegotiationError;
use crate::proxy::network::NetworkError;

/// Terminal status of a connection attempt. Exactly one is reported per
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    Success,
    Error,
    Timeout,
    Cancel,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
            AttemptStatus::Timeout => "timeout",
            AttemptStatus::Cancel => "canceled",
        };
        f.write_str(name)
    }
}

/// Why a single candidate (one TCP connect or one negotiation) failed.
#[derive(Error, Debug)]
pub enum HopError {
    #[error("Failed to resolve {0}: {1}")]
    ResolveFailed(String, io::Error),
    #[error("No addresses found for {0}")]
    NoAddresses(String),
    #[error("Socket setup failed: {0}")]
    SocketSetup(io::Error),
    #[error("No source port available in range {0}-{1}")]
    SourcePortUnavailable(u16, u16),
    #[error("Connect failed: {0}")]
    ConnectFailed(io::Error),
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// Human-readable explanation of a termination, naming the hop at fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailedStatus {
    pub description: String,
    pub address: Option<Address>,
}

impl DetailedStatus {
    pub fn new(description: impl Into<String>) -> Self {
        DetailedStatus {
            description: description.into(),
            address: None,
        }
    }

    pub fn at(address: &Address, error: &HopError) -> Self {
        DetailedStatus {
            description: error.to_string(),
            address: Some(address.clone()),
        }
    }
}

impl fmt::Display for DetailedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(address) => write!(f, "proxy {}: {}", address, self.description),
            None => f.write_str(&self.description),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Invalid proxy network: {0}")]
    InvalidNetwork(#[from] NetworkError),
    #[error("No Tokio runtime available to drive connection attempts")]
    NoRuntime,
    #[error("Connection failed: {0}")]
    Failed(DetailedStatus),
    #[error("Connection attempt timed out: {0}")]
    TimedOut(DetailedStatus),
    #[error("Connection attempt canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detailed_status_display() {
        let addr: Address = "10.1.1.1:1080".parse().unwrap();
        let status = DetailedStatus::at(&addr, &HopError::NoAddresses("nowhere:1".into()));
        assert_eq!(
            status.to_string(),
            "proxy 10.1.1.1:1080: No addresses found for nowhere:1"
        );
        assert_eq!(DetailedStatus::new("canceled").to_string(), "canceled");
    }
}
