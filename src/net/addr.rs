use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Missing port in address: {0}")]
    MissingPort(String),
    #[error("Invalid port in address: {0}")]
    InvalidPort(String),
    #[error("Empty host in address: {0}")]
    EmptyHost(String),
}

/// A network endpoint as SOCKS5 understands it: either a literal socket
/// address or a host name that the far side resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Builds an address from a host string, preferring the literal form.
    pub fn new(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }

    /// Literal addresses never need DNS.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ip(addr) => Some(*addr),
            Address::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        // Bare IPv6 without brackets is ambiguous
        if host.contains(':') && host.parse::<Ipv6Addr>().is_err() {
            return Err(AddressError::InvalidPort(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        Ok(Address::new(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: Address = "127.0.0.1:1080".parse().unwrap();
        assert_eq!(addr, Address::Ip("127.0.0.1:1080".parse().unwrap()));

        let addr: Address = "[::1]:443".parse().unwrap();
        assert_eq!(addr.as_socket_addr(), Some("[::1]:443".parse().unwrap()));

        let addr: Address = "example.com:80".parse().unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
        assert_eq!(addr.to_string(), "example.com:80");
        assert!(addr.as_socket_addr().is_none());
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!(matches!(
            "example.com".parse::<Address>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            "example.com:http".parse::<Address>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<Address>(),
            Err(AddressError::EmptyHost(_))
        ));
    }

    #[test]
    fn test_new_prefers_literal() {
        assert_eq!(
            Address::new("10.0.0.1", 22),
            Address::Ip("10.0.0.1:22".parse().unwrap())
        );
        assert_eq!(
            Address::new("[::1]", 22),
            Address::Ip("[::1]:22".parse().unwrap())
        );
        assert_eq!(Address::new("proxy.local", 22).host(), "proxy.local");
    }
}
