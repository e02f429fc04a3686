use log::{debug, info};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

use crate::common::auth::{AuthError, AuthManager};
use crate::net::addr::Address;
use crate::net::conn::BufferedConnection;
use crate::proxy::forward::{self, ConnectError};
use crate::proxy::negotiator::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_VERSION, CMD_CONNECT, METHOD_NO_ACCEPTABLE,
    METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD, REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
    REPLY_COMMAND_NOT_SUPPORTED, REPLY_CONNECTION_REFUSED, REPLY_GENERAL_FAILURE,
    REPLY_HOST_UNREACHABLE, REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use crate::test_server::{ServerMode, TestServerConfig};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),
    #[error("No supported authentication method")]
    NoSupportedAuthMethod,
    #[error("Invalid authentication sub-negotiation version: {0:#04x}")]
    InvalidAuthVersion(u8),
    #[error("Authentication failed")]
    AuthenticationFailed(#[from] AuthError),
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),
    #[error("Connection error: {0}")]
    ConnectError(#[from] ConnectError),
    #[error("Invalid UTF-8 data")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Where the client session is in the SOCKS5 exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingMethodRequest,
    AwaitingCredentials,
    AwaitingConnectRequest,
    Proxying(Address),
    Closed,
}

/// The server side of one accepted connection.
pub struct ClientSession {
    conn: BufferedConnection,
    config: Arc<TestServerConfig>,
    auth: Option<Arc<AuthManager>>,
    state: SessionState,
}

impl ClientSession {
    pub fn new(
        conn: BufferedConnection,
        config: Arc<TestServerConfig>,
        auth: Option<Arc<AuthManager>>,
    ) -> Self {
        ClientSession {
            conn,
            config,
            auth,
            state: SessionState::AwaitingMethodRequest,
        }
    }

    pub async fn run(mut self) -> Result<(), SessionError> {
        if self.config.mode == ServerMode::Ignore {
            let swallowed = self.conn.discard_until_eof().await?;
            debug!("Ignored {} bytes until the client closed", swallowed);
            self.state = SessionState::Closed;
            return Ok(());
        }

        loop {
            self.state = match std::mem::replace(&mut self.state, SessionState::Closed) {
                SessionState::AwaitingMethodRequest => self.handle_method_request().await?,
                SessionState::AwaitingCredentials => self.handle_credentials().await?,
                SessionState::AwaitingConnectRequest => self.handle_connect_request().await?,
                SessionState::Proxying(destination) => self.proxy_to(destination).await?,
                SessionState::Closed => return Ok(()),
            };
        }
    }

    async fn reply(&mut self, message: &[u8]) -> Result<(), SessionError> {
        if let Some(delay) = self.config.reply_delay {
            tokio::time::sleep(delay).await;
        }
        self.conn.write(message).await?;
        Ok(())
    }

    async fn handle_method_request(&mut self) -> Result<SessionState, SessionError> {
        let header = self.conn.read_exact_bytes(2).await?;
        let version = header[0];
        let nmethods = header[1] as usize;

        if version != SOCKS5_VERSION {
            return Err(SessionError::InvalidVersion(version));
        }

        let methods = self.conn.read_exact_bytes(nmethods).await?;

        let require_auth = self.auth.as_ref().is_some_and(|auth| auth.has_users());
        let selected = if require_auth {
            methods
                .contains(&METHOD_USERNAME_PASSWORD)
                .then_some(METHOD_USERNAME_PASSWORD)
        } else {
            methods.contains(&METHOD_NO_AUTH).then_some(METHOD_NO_AUTH)
        };

        match selected {
            Some(method) => {
                self.reply(&[SOCKS5_VERSION, method]).await?;
                if method == METHOD_USERNAME_PASSWORD {
                    Ok(SessionState::AwaitingCredentials)
                } else {
                    Ok(SessionState::AwaitingConnectRequest)
                }
            }
            None => {
                self.reply(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE]).await?;
                Err(SessionError::NoSupportedAuthMethod)
            }
        }
    }

    /// RFC 1929 Username/Password sub-negotiation:
    /// +----+------+----------+------+----------+
    /// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    /// +----+------+----------+------+----------+
    /// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    /// +----+------+----------+------+----------+
    async fn handle_credentials(&mut self) -> Result<SessionState, SessionError> {
        let header = self.conn.read_exact_bytes(2).await?;
        let auth_version = header[0];
        let username_len = header[1] as usize;

        if auth_version != AUTH_VERSION {
            return Err(SessionError::InvalidAuthVersion(auth_version));
        }

        let username = String::from_utf8(self.conn.read_exact_bytes(username_len).await?)?;
        let password_len = self.conn.read_byte().await? as usize;
        let password = String::from_utf8(self.conn.read_exact_bytes(password_len).await?)?;

        let verdict = match &self.auth {
            Some(auth) => auth.authenticate(&username, &password).await,
            None => Ok(true),
        };
        let auth_success = match verdict {
            Ok(result) => result,
            Err(e) => {
                self.reply(&[AUTH_VERSION, 0x01]).await?;
                return Err(SessionError::AuthenticationFailed(e));
            }
        };

        let status = if auth_success { 0x00 } else { 0x01 };
        self.reply(&[AUTH_VERSION, status]).await?;

        if !auth_success {
            return Err(SessionError::AuthenticationFailed(
                AuthError::AuthenticationFailed,
            ));
        }

        info!("User '{}' authenticated", username);
        Ok(SessionState::AwaitingConnectRequest)
    }

    async fn handle_connect_request(&mut self) -> Result<SessionState, SessionError> {
        let requested = match self.read_request().await {
            Ok(addr) => addr,
            Err(e) => {
                let reply_code = match &e {
                    SessionError::UnsupportedCommand(_) => REPLY_COMMAND_NOT_SUPPORTED,
                    SessionError::InvalidAddressType(_) => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
                    _ => REPLY_GENERAL_FAILURE,
                };
                let _ = self.send_reply(reply_code).await;
                return Err(e);
            }
        };
        debug!("CONNECT request for {}", requested);

        match self.config.mode {
            ServerMode::Fail(code) => {
                info!("Refusing CONNECT to {} with code {:#04x}", requested, code);
                self.send_reply(code).await?;
                Ok(SessionState::Closed)
            }
            ServerMode::SucceedAndClose => {
                // Announce success, then hang up before the bound address.
                info!("Accepting CONNECT to {} and closing", requested);
                self.reply(&[SOCKS5_VERSION, REPLY_SUCCEEDED]).await?;
                Ok(SessionState::Closed)
            }
            ServerMode::Connect => {
                let destination = self
                    .config
                    .destination_override
                    .clone()
                    .unwrap_or(requested);
                Ok(SessionState::Proxying(destination))
            }
            // Ignore sessions never get past run(); stay silent regardless.
            ServerMode::Ignore => Ok(SessionState::Closed),
        }
    }

    /// Dials the destination session and relays bytes once it is up.
    async fn proxy_to(&mut self, destination: Address) -> Result<SessionState, SessionError> {
        let target =
            match forward::connect_with_timeout(&destination, self.config.connect_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    let reply_code = match &e {
                        ConnectError::ConnectionRefused(_) => REPLY_CONNECTION_REFUSED,
                        ConnectError::AddressResolutionFailed(_) => REPLY_HOST_UNREACHABLE,
                        _ => REPLY_GENERAL_FAILURE,
                    };
                    let _ = self.send_reply(reply_code).await;
                    return Err(SessionError::ConnectError(e));
                }
            };

        info!("Connected to destination: {}", destination);
        let bound = target.local_addr()?;
        self.send_bound_reply(REPLY_SUCCEEDED, bound).await?;

        let mut target = target;
        forward::forward_bidirectional(&mut self.conn, &mut target).await?;
        Ok(SessionState::Closed)
    }

    async fn read_request(&mut self) -> Result<Address, SessionError> {
        let header = self.conn.read_exact_bytes(4).await?;
        let version = header[0];
        let command = header[1];
        let addr_type = header[3];

        if version != SOCKS5_VERSION {
            return Err(SessionError::InvalidVersion(version));
        }

        if command != CMD_CONNECT {
            return Err(SessionError::UnsupportedCommand(command));
        }

        let address = match addr_type {
            ATYP_IPV4 => {
                let data = self.conn.read_exact_bytes(4).await?;
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                Address::Ip(SocketAddr::new(IpAddr::V4(ip), self.read_port().await?))
            }
            ATYP_DOMAIN => {
                let domain_len = self.conn.read_byte().await? as usize;
                let domain = String::from_utf8(self.conn.read_exact_bytes(domain_len).await?)?;
                Address::Domain(domain, self.read_port().await?)
            }
            ATYP_IPV6 => {
                let data = self.conn.read_exact_bytes(16).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data);
                let ip = Ipv6Addr::from(octets);
                Address::Ip(SocketAddr::new(IpAddr::V6(ip), self.read_port().await?))
            }
            _ => return Err(SessionError::InvalidAddressType(addr_type)),
        };

        Ok(address)
    }

    async fn read_port(&mut self) -> Result<u16, SessionError> {
        let port_bytes = self.conn.read_exact_bytes(2).await?;
        Ok(u16::from_be_bytes([port_bytes[0], port_bytes[1]]))
    }

    async fn send_reply(&mut self, reply_code: u8) -> Result<(), SessionError> {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        self.send_bound_reply(reply_code, unspecified).await
    }

    async fn send_bound_reply(
        &mut self,
        reply_code: u8,
        bound: SocketAddr,
    ) -> Result<(), SessionError> {
        let mut message = vec![SOCKS5_VERSION, reply_code, 0x00];
        match bound.ip() {
            IpAddr::V4(ip) => {
                message.push(ATYP_IPV4);
                message.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                message.push(ATYP_IPV6);
                message.extend_from_slice(&ip.octets());
            }
        }
        message.extend_from_slice(&bound.port().to_be_bytes());
        self.reply(&message).await
    }
}
