use crate::error::{CollectorError, CollectorResult};
use std::fmt;
use std::str::FromStr;

/// Parsed socket address.
///
/// `inproc://name` stays inside the process; `tcp://host:port` goes over the network.
/// A `*` host binds every interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// In-process endpoint, keyed by name within one [`Context`](super::Context).
    Inproc(String),
    /// TCP endpoint as `host:port`.
    Tcp(String),
}

impl Endpoint {
    /// Parse an address string.
    pub fn parse(address: &str) -> CollectorResult<Self> {
        if let Some(name) = address.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(CollectorError::InvalidAddress(address.to_string()));
            }
            return Ok(Endpoint::Inproc(name.to_string()));
        }

        if let Some(host_port) = address.strip_prefix("tcp://") {
            let (host, port) = host_port
                .rsplit_once(':')
                .ok_or_else(|| CollectorError::InvalidAddress(address.to_string()))?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(CollectorError::InvalidAddress(address.to_string()));
            }
            let host = if host == "*" { "0.0.0.0" } else { host };
            return Ok(Endpoint::Tcp(format!("{host}:{port}")));
        }

        Err(CollectorError::InvalidAddress(address.to_string()))
    }
}

impl FromStr for Endpoint {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}
