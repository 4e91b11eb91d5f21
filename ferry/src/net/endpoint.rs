//! Network endpoint types and `host:port` parsing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("missing port in address: {0}")]
    MissingPort(String),
    #[error("invalid port in address: {0}")]
    InvalidPort(String),
    #[error("unterminated IPv6 bracket in address: {0}")]
    UnterminatedBracket(String),
    #[error("unknown host: {0}")]
    UnknownHost(String),
}

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Placeholder source for in-process (IPC) streams.
    #[must_use]
    pub const fn unspecified() -> Self {
        Self::new_v4(0, 0, 0, 0, 0)
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }
}

/// Splits `host:port` into its parts, honouring `[ipv6]:port` brackets.
///
/// The returned host has its brackets stripped.
///
/// # Errors
///
/// Fails when the port separator is missing or a bracket is left open.
pub fn split_host_port(addr: &str) -> Result<(&str, &str), EndpointError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| EndpointError::UnterminatedBracket(addr.to_owned()))?;
        let host = &rest[..close];
        let port = rest[close + 1..]
            .strip_prefix(':')
            .ok_or_else(|| EndpointError::MissingPort(addr.to_owned()))?;
        return Ok((host, port));
    }
    addr.rsplit_once(':')
        .ok_or_else(|| EndpointError::MissingPort(addr.to_owned()))
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(s.to_owned()))?;
        let ip = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.parse::<IpAddr>()
                .map_err(|_| EndpointError::UnknownHost(host.to_owned()))?
        };
        Ok(Self::new(ip, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
