use log::{debug, trace};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::net::addr::Address;
use crate::proxy::error::HopError;

/// Options applied to every outgoing proxy connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub keepalive: bool,
    pub nodelay: bool,
    /// `Some(ZERO)` resets the connection on close instead of lingering.
    pub linger: Option<Duration>,
    pub source_ports: Option<RangeInclusive<u16>>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            reuse_address: true,
            keepalive: true,
            nodelay: true,
            linger: Some(Duration::ZERO),
            source_ports: None,
        }
    }
}

/// Allocates, configures and connects TCP sockets to proxies.
///
/// Dropping the returned stream closes it; there is no separate release step.
#[derive(Debug, Clone, Default)]
pub struct SocketFactory {
    options: SocketOptions,
}

impl SocketFactory {
    pub fn new(options: SocketOptions) -> Self {
        SocketFactory { options }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Resolves `address` and connects to the first reachable result.
    ///
    /// With `strict`, failing to bind a source port inside the configured
    /// range is an error; otherwise the OS picks the port.
    pub async fn connect(&self, address: &Address, strict: bool) -> Result<TcpStream, HopError> {
        let targets = resolve(address).await?;

        let mut last_error = HopError::NoAddresses(address.to_string());
        for target in targets {
            match self.connect_addr(target, strict).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} ({}) failed: {}", address, target, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_addr(&self, target: SocketAddr, strict: bool) -> Result<TcpStream, HopError> {
        let socket = self.bind_source(target, strict)?;
        let stream = socket.connect(target).await.map_err(HopError::ConnectFailed)?;
        if self.options.nodelay {
            stream.set_nodelay(true).map_err(HopError::SocketSetup)?;
        }
        trace!(
            "Connected {} -> {}",
            stream
                .local_addr()
                .map_or_else(|_| "?".to_string(), |a| a.to_string()),
            target
        );
        Ok(stream)
    }

    fn allocate(&self, target: SocketAddr) -> io::Result<TcpSocket> {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if self.options.reuse_address {
            socket.set_reuseaddr(true)?;
        }
        if self.options.keepalive {
            socket.set_keepalive(true)?;
        }
        socket.set_linger(self.options.linger)?;
        Ok(socket)
    }

    fn bind_source(&self, target: SocketAddr, strict: bool) -> Result<TcpSocket, HopError> {
        let range = match &self.options.source_ports {
            Some(range) => range.clone(),
            None => return self.allocate(target).map_err(HopError::SocketSetup),
        };

        let unspecified = if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };

        for port in range.clone() {
            let socket = self.allocate(target).map_err(HopError::SocketSetup)?;
            match socket.bind(SocketAddr::new(unspecified, port)) {
                Ok(()) => return Ok(socket),
                Err(e) => trace!("Source port {} unavailable: {}", port, e),
            }
        }

        if strict {
            return Err(HopError::SourcePortUnavailable(*range.start(), *range.end()));
        }
        debug!(
            "No source port free in {}-{}, letting the OS choose",
            range.start(),
            range.end()
        );
        self.allocate(target).map_err(HopError::SocketSetup)
    }
}

/// Literal addresses skip DNS entirely.
pub async fn resolve(address: &Address) -> Result<Vec<SocketAddr>, HopError> {
    if let Some(addr) = address.as_socket_addr() {
        return Ok(vec![addr]);
    }

    let target = address.to_string();
    let addrs: Vec<SocketAddr> = lookup_host(&target)
        .await
        .map_err(|e| HopError::ResolveFailed(target.clone(), e))?
        .collect();
    if addrs.is_empty() {
        return Err(HopError::NoAddresses(target));
    }
    Ok(addrs)
}
