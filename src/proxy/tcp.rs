use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task;

use crate::net::addr::Address;
use crate::proxy::connector::{ConnectOptions, Connector};
use crate::proxy::error::ChainError;
use crate::proxy::forward;

#[derive(Error, Debug)]
pub enum TcpForwarderError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Proxy chain error: {0}")]
    ChainError(#[from] ChainError),
}

/// Accepts local connections and carries each one through the proxy chain
/// to a fixed destination.
pub struct TcpForwarder {
    connector: Arc<Connector>,
    destination: Address,
    options: ConnectOptions,
    semaphore: Arc<Semaphore>,
}

impl TcpForwarder {
    pub fn new(
        connector: Arc<Connector>,
        destination: Address,
        options: ConnectOptions,
        max_connections: usize,
    ) -> Self {
        TcpForwarder {
            connector,
            destination,
            options,
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Accept connections until Ctrl-C / SIGINT is received.
    pub async fn run(&self, listener: TcpListener) {
        let shutdown = tokio::signal::ctrl_c();
        self.run_until(listener, shutdown).await;
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: std::future::Future,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Forwarding {} -> {}", addr, self.destination);
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = match self.semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    log::warn!("Max connections reached, rejecting {}", addr);
                                    drop(stream);
                                    continue;
                                }
                            };
                            let connector = Arc::clone(&self.connector);
                            let destination = self.destination.clone();
                            let options = self.options;
                            task::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    addr,
                                    connector,
                                    destination,
                                    options,
                                )
                                .await
                                {
                                    log::error!("Connection error from {}: {}", addr, e);
                                }
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            log::error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Stopped accepting new connections");
    }

    async fn handle_connection(
        mut inbound: TcpStream,
        addr: SocketAddr,
        connector: Arc<Connector>,
        destination: Address,
        options: ConnectOptions,
    ) -> Result<(), TcpForwarderError> {
        inbound.set_nodelay(true)?;
        let mut outbound = connector.connect(destination.clone(), options).await?;
        info!("Chained {} -> {}", addr, destination);
        forward::forward_bidirectional(&mut inbound, &mut outbound).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::network::{ProxyDescription, ProxyNetworkDescription};
    use crate::test_server::{EchoServer, ServerMode, Socks5TestServer, TestServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_forwarder_relays_through_chain() {
        let echo = EchoServer::start().await.unwrap();
        let proxy = Socks5TestServer::start(TestServerConfig::new(ServerMode::Connect))
            .await
            .unwrap();

        let mut network = ProxyNetworkDescription::new();
        network.add_proxy(0, ProxyDescription::new(proxy.address()));
        let connector = Connector::builder(network).build().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let forwarder = TcpForwarder::new(connector, echo.address(), ConnectOptions::default(), 4);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            forwarder.run_until(listener, stop_rx).await;
        });

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"forwarded").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"forwarded");
        assert_eq!(proxy.session_count(), 1);

        let _ = stop_tx.send(());
        server.await.unwrap();
    }
}
