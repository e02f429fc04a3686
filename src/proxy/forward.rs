use log::debug;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::net::addr::Address;
use crate::net::socket;
use crate::proxy::error::HopError;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection timed out")]
    ConnectionTimeout,
    #[error("Connection refused: {0}")]
    ConnectionRefused(io::Error),
    #[error("Address resolution failed: {0}")]
    AddressResolutionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Plain TCP connect with a deadline, used by the far side of a proxy.
pub async fn connect_with_timeout(
    target: &Address,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let addrs = socket::resolve(target).await.map_err(|e| match e {
        HopError::ResolveFailed(host, err) => {
            ConnectError::AddressResolutionFailed(format!("{}: {}", host, err))
        }
        other => ConnectError::AddressResolutionFailed(other.to_string()),
    })?;

    let connect = async {
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(ConnectError::ConnectionRefused(e))
        }
        Ok(Err(e)) => Err(ConnectError::IoError(e)),
        Err(_) => Err(ConnectError::ConnectionTimeout),
    }
}

/// Relays bytes both ways until either side closes. Returns the byte counts
/// `(a_to_b, b_to_a)`.
pub async fn forward_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (up, down) = tokio::io::copy_bidirectional(a, b).await?;
    debug!("Relay finished: {} bytes up, {} bytes down", up, down);
    Ok((up, down))
}
