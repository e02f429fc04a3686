use std::fmt;
use thiserror::Error;

use crate::common::auth::Credentials;
use crate::net::addr::Address;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Proxy network has no levels")]
    NoLevels,
    #[error("Proxy level {0} has no proxies")]
    EmptyLevel(usize),
}

/// One proxy endpoint within a level.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyDescription {
    pub address: Address,
    pub credentials: Option<Credentials>,
}

impl ProxyDescription {
    pub fn new(address: Address) -> Self {
        ProxyDescription {
            address,
            credentials: None,
        }
    }

    pub fn with_credentials(address: Address, credentials: Credentials) -> Self {
        ProxyDescription {
            address,
            credentials: Some(credentials),
        }
    }
}

impl fmt::Debug for ProxyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(creds) => write!(f, "{}@{}", creds.username, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// An ordered collection of proxy levels, traversed shallow to deep.
///
/// Construction does not validate; [`ProxyNetworkDescription::validate`] is
/// run once by the connector builder so attempts never see an empty level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyNetworkDescription {
    levels: Vec<Vec<ProxyDescription>>,
}

impl ProxyNetworkDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_levels(levels: Vec<Vec<ProxyDescription>>) -> Self {
        ProxyNetworkDescription { levels }
    }

    /// Appends an empty level and returns its index.
    pub fn add_level(&mut self) -> usize {
        self.levels.push(Vec::new());
        self.levels.len() - 1
    }

    /// Appends a proxy to `level`, creating intermediate levels as needed.
    pub fn add_proxy(&mut self, level: usize, proxy: ProxyDescription) {
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(proxy);
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_proxies(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    pub fn proxy(&self, level: usize, index: usize) -> Option<&ProxyDescription> {
        self.levels.get(level).and_then(|proxies| proxies.get(index))
    }

    pub fn levels(&self) -> &[Vec<ProxyDescription>] {
        &self.levels
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.levels.is_empty() {
            return Err(NetworkError::NoLevels);
        }
        if let Some(level) = self.levels.iter().position(Vec::is_empty) {
            return Err(NetworkError::EmptyLevel(level));
        }
        Ok(())
    }
}
