pub mod attempt;
pub mod connector;
pub mod error;
pub mod forward;
pub mod negotiator;
pub mod network;
pub mod path;
pub mod tcp;

pub use attempt::{AttemptHandle, AttemptOutcome, ConnectionAttempt};
pub use connector::{ConnectOptions, Connector, ConnectorBuilder};
pub use error::{AttemptStatus, ChainError, DetailedStatus, HopError};
pub use network::{ProxyDescription, ProxyNetworkDescription};
pub use tcp::TcpForwarder;
