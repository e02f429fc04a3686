//! SOCKS5 client handshake over an already connected stream.
//!
//! The negotiation is a plain future: dropping it before it resolves cancels
//! the exchange and nothing is reported, which is how the connection attempt
//! abandons an in-flight hop.

use log::debug;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::auth::Credentials;
use crate::net::addr::Address;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes (RFC 1928 §6)
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid SOCKS version in reply: {0:#04x}")]
    InvalidVersion(u8),
    #[error("Invalid authentication sub-negotiation version: {0:#04x}")]
    InvalidAuthVersion(u8),
    #[error("Proxy accepted none of the offered authentication methods")]
    NoAcceptableMethod,
    #[error("Proxy selected a method that was not offered: {0:#04x}")]
    UnexpectedMethod(u8),
    #[error("Proxy requires credentials but none are configured")]
    CredentialsRequired,
    #[error("Proxy rejected the credentials (status {0:#04x})")]
    AuthenticationRejected(u8),
    #[error("Username and password must each be 1 to 255 bytes")]
    InvalidCredentials,
    #[error("Domain name too long: {0} bytes")]
    DomainTooLong(usize),
    #[error("Proxy refused CONNECT: {reason} ({code:#04x})")]
    Rejected { code: u8, reason: &'static str },
    #[error("Invalid address type in reply: {0:#04x}")]
    InvalidAddressType(u8),
    #[error("Negotiation timed out after {0:?}")]
    Timeout(Duration),
}

pub fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unassigned reply code",
    }
}

/// Encodes ATYP, address and port as they appear in requests and replies.
pub fn encode_address(address: &Address, buf: &mut Vec<u8>) -> Result<(), NegotiationError> {
    match address {
        Address::Ip(SocketAddr::V4(addr)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Address::Ip(SocketAddr::V6(addr)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Address::Domain(host, _) => {
            let len = u8::try_from(host.len())
                .map_err(|_| NegotiationError::DomainTooLong(host.len()))?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(host.as_bytes());
        }
    }
    buf.extend_from_slice(&address.port().to_be_bytes());
    Ok(())
}

/// Builds every message up front so that malformed input fails before any
/// byte is written.
struct Plan {
    greeting: Vec<u8>,
    auth: Option<Vec<u8>>,
    request: Vec<u8>,
}

impl Plan {
    fn new(target: &Address, credentials: Option<&Credentials>) -> Result<Self, NegotiationError> {
        let auth = match credentials {
            Some(creds) => {
                let user_len = u8::try_from(creds.username.len())
                    .map_err(|_| NegotiationError::InvalidCredentials)?;
                let pass_len = u8::try_from(creds.password.len())
                    .map_err(|_| NegotiationError::InvalidCredentials)?;
                if user_len == 0 || pass_len == 0 {
                    return Err(NegotiationError::InvalidCredentials);
                }
                let mut msg = Vec::with_capacity(3 + creds.username.len() + creds.password.len());
                msg.push(AUTH_VERSION);
                msg.push(user_len);
                msg.extend_from_slice(creds.username.as_bytes());
                msg.push(pass_len);
                msg.extend_from_slice(creds.password.as_bytes());
                Some(msg)
            }
            None => None,
        };

        let greeting = if auth.is_some() {
            vec![SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD]
        } else {
            vec![SOCKS5_VERSION, 1, METHOD_NO_AUTH]
        };

        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        encode_address(target, &mut request)?;

        Ok(Plan {
            greeting,
            auth,
            request,
        })
    }
}

/// Asks the proxy at the other end of `stream` to CONNECT to `target`.
///
/// On success the stream carries bytes to and from `target` and the bound
/// address from the proxy's reply is returned. A timeout is reported as
/// [`NegotiationError::Timeout`].
pub async fn negotiate(
    stream: &mut TcpStream,
    target: &Address,
    credentials: Option<&Credentials>,
    timeout: Option<Duration>,
) -> Result<Address, NegotiationError> {
    let plan = Plan::new(target, credentials)?;
    match timeout {
        Some(limit) => tokio::time::timeout(limit, run(stream, plan))
            .await
            .map_err(|_| NegotiationError::Timeout(limit))?,
        None => run(stream, plan).await,
    }
}

async fn run(stream: &mut TcpStream, plan: Plan) -> Result<Address, NegotiationError> {
    stream.write_all(&plan.greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(NegotiationError::InvalidVersion(reply[0]));
    }

    match reply[1] {
        METHOD_NO_AUTH => debug!("Proxy selected no authentication"),
        METHOD_USERNAME_PASSWORD => {
            let auth = plan.auth.ok_or(NegotiationError::CredentialsRequired)?;
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[0] != AUTH_VERSION {
                return Err(NegotiationError::InvalidAuthVersion(status[0]));
            }
            if status[1] != 0x00 {
                return Err(NegotiationError::AuthenticationRejected(status[1]));
            }
            debug!("Proxy accepted credentials");
        }
        METHOD_NO_ACCEPTABLE => return Err(NegotiationError::NoAcceptableMethod),
        other => return Err(NegotiationError::UnexpectedMethod(other)),
    }

    stream.write_all(&plan.request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(NegotiationError::InvalidVersion(header[0]));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(NegotiationError::Rejected {
            code: header[1],
            reason: reply_message(header[1]),
        });
    }

    read_address(stream, header[3]).await
}

async fn read_address(stream: &mut TcpStream, addr_type: u8) -> Result<Address, NegotiationError> {
    let address = match addr_type {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Address::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            let host = String::from_utf8_lossy(&buf[..len]).into_owned();
            Address::Domain(host, port)
        }
        other => return Err(NegotiationError::InvalidAddressType(other)),
    };
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_negotiate_no_auth_domain() {
        let (mut client, mut server) = pair().await;

        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &80u16.to_be_bytes());

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x04, 0x38])
                .await
                .unwrap();
        });

        let target = Address::Domain("example.com".to_string(), 80);
        let bound = negotiate(&mut client, &target, None, None).await.unwrap();
        assert_eq!(bound, "10.0.0.1:1080".parse().unwrap());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_with_credentials() {
        let (mut client, mut server) = pair().await;

        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = vec![0u8; 3 + 5 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth, b"\x01\x05alice\x06secret");
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let target: Address = "127.0.0.1:9".parse().unwrap();
        let creds = Credentials::new("alice", "secret");
        let err = negotiate(&mut client, &target, Some(&creds), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::AuthenticationRejected(0x01)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_rejected_reply() {
        let (mut client, mut server) = pair().await;

        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, REPLY_CONNECTION_REFUSED, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target: Address = "192.0.2.1:443".parse().unwrap();
        let err = negotiate(&mut client, &target, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Rejected {
                code: REPLY_CONNECTION_REFUSED,
                ..
            }
        ));
        assert!(err.to_string().contains("connection refused"));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_requires_credentials() {
        let (mut client, mut server) = pair().await;

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
        });

        let target: Address = "192.0.2.1:443".parse().unwrap();
        let err = negotiate(&mut client, &target, None, None).await.unwrap_err();
        assert!(matches!(err, NegotiationError::CredentialsRequired));
    }

    #[tokio::test]
    async fn test_negotiate_timeout() {
        let (mut client, _server) = pair().await;

        let target: Address = "192.0.2.1:443".parse().unwrap();
        let err = negotiate(&mut client, &target, None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invalid_input_fails_before_io() {
        let (mut client, _server) = pair().await;

        let target = Address::Domain("a".repeat(300), 80);
        let err = negotiate(&mut client, &target, None, None).await.unwrap_err();
        assert!(matches!(err, NegotiationError::DomainTooLong(300)));

        let target: Address = "192.0.2.1:443".parse().unwrap();
        let creds = Credentials::new("", "pw");
        let err = negotiate(&mut client, &target, Some(&creds), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidCredentials));
    }
}
