use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::net::addr::Address;
use crate::net::socket::{SocketFactory, SocketOptions};
use crate::proxy::attempt::{AttemptHandle, AttemptOutcome, ConnectionAttempt};
use crate::proxy::error::ChainError;
use crate::proxy::network::ProxyNetworkDescription;

/// Per-attempt deadlines. `None` disables a deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Limit for each TCP connect and each negotiation.
    pub proxy_timeout: Option<Duration>,
    /// Limit for the whole attempt, retries included.
    pub total_timeout: Option<Duration>,
    /// Fail instead of falling back when no source port in range is free.
    pub strict_source_port: bool,
}

/// Shared configuration behind every connection attempt: the proxy network,
/// the socket factory and the runtime the attempts run on.
///
/// Attempts hold an `Arc<Connector>`, so the connector lives at least as
/// long as the last of them.
pub struct Connector {
    network: ProxyNetworkDescription,
    factory: Arc<SocketFactory>,
    runtime: Handle,
    retries: u32,
}

pub struct ConnectorBuilder {
    network: ProxyNetworkDescription,
    options: SocketOptions,
    runtime: Option<Handle>,
    retries: u32,
}

impl ConnectorBuilder {
    /// Binds outgoing proxy connections to a local port in `min..=max`.
    pub fn source_ports(mut self, min: u16, max: u16) -> Self {
        self.options.source_ports = Some(min..=max);
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Full-path retries after every path has failed. 0 disables retry.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Runtime that drives the attempts; defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Arc<Connector>, ChainError> {
        self.network.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ChainError::NoRuntime)?,
        };

        debug!(
            "Connector ready: {} level(s), {} retries, options {:?}",
            self.network.num_levels(),
            self.retries,
            self.options
        );

        Ok(Arc::new(Connector {
            network: self.network,
            factory: Arc::new(SocketFactory::new(self.options)),
            runtime,
            retries: self.retries,
        }))
    }
}

impl Connector {
    pub fn builder(network: ProxyNetworkDescription) -> ConnectorBuilder {
        ConnectorBuilder {
            network,
            options: SocketOptions::default(),
            runtime: None,
            retries: 0,
        }
    }

    pub fn network(&self) -> &ProxyNetworkDescription {
        &self.network
    }

    pub fn factory(&self) -> &Arc<SocketFactory> {
        &self.factory
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Creates an idle attempt; nothing happens until it is started.
    pub fn make_connection_attempt_handle<F>(
        self: &Arc<Self>,
        callback: F,
        proxy_timeout: Option<Duration>,
        total_timeout: Option<Duration>,
        destination: Address,
    ) -> AttemptHandle
    where
        F: FnOnce(AttemptOutcome) + Send + 'static,
    {
        Arc::new(ConnectionAttempt::new(
            Arc::clone(self),
            Box::new(callback),
            proxy_timeout,
            total_timeout,
            destination,
        ))
    }

    pub fn start_connection_attempt(&self, attempt: &AttemptHandle) {
        attempt.start();
    }

    pub fn start_connection_attempt_strict(&self, attempt: &AttemptHandle) {
        attempt.start_strict();
    }

    pub fn cancel_connection_attempt(&self, attempt: &AttemptHandle) {
        attempt.cancel();
    }

    /// Runs one attempt to `destination` and waits for its outcome.
    ///
    /// Dropping the returned future cancels the attempt.
    pub async fn connect(
        self: &Arc<Self>,
        destination: Address,
        options: ConnectOptions,
    ) -> Result<TcpStream, ChainError> {
        let (tx, rx) = oneshot::channel();
        let attempt = self.make_connection_attempt_handle(
            move |outcome| {
                let _ = tx.send(outcome);
            },
            options.proxy_timeout,
            options.total_timeout,
            destination,
        );
        let guard = CancelOnDrop(Arc::clone(&attempt));

        if options.strict_source_port {
            attempt.start_strict();
        } else {
            attempt.start();
        }

        let outcome = rx.await.map_err(|_| ChainError::Canceled)?;
        drop(guard);
        outcome.into_result()
    }
}

struct CancelOnDrop(AttemptHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
