// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Validated UDP listen endpoints.
//!
//! A [`ListenAddr`] pairs a UDP network variant with a `host:port` string.
//! Three surface syntaxes are accepted:
//!
//! - `host:port` (network defaults to `udp`)
//! - `udp4:host:port` (scheme-qualified, opaque form)
//! - `udp6://[::1]:9000` (scheme-qualified, authority form)
//!
//! The host part is kept as written and resolved freshly on every bind, so
//! DNS changes are observed when a listener rebinds.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

/// UDP network variant, mirroring the `udp`/`udp4`/`udp6` network names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Either address family.
    Udp,
    /// IPv4 only.
    Udp4,
    /// IPv6 only.
    Udp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Network> {
        match scheme {
            "udp" => Some(Network::Udp),
            "udp4" => Some(Network::Udp4),
            "udp6" => Some(Network::Udp6),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when parsing a listen address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid address: cannot have a fragment")]
    Fragment,

    #[error("invalid address: cannot have a query string")]
    Query,

    #[error("invalid address: cannot have a path")]
    Path,

    #[error("invalid network {0:?}: must be udp, udp4, or udp6")]
    Network(String),

    #[error("address {0:?} is missing a port")]
    MissingPort(String),

    #[error("address {0:?} has an empty port")]
    EmptyPort(String),

    #[error("address {0:?} has an unterminated bracket")]
    UnterminatedBracket(String),
}

/// A validated UDP listen endpoint.
///
/// Construction validates the grammar; the hostname is only resolved when a
/// listener binds, via [`ListenAddr::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    network: Network,
    hostport: String,
}

impl ListenAddr {
    pub fn network(&self) -> Network {
        self.network
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    /// Resolves the endpoint to a concrete socket address.
    ///
    /// Resolution happens on every call so a rebinding listener picks up DNS
    /// changes. For `udp4`/`udp6` only addresses of the matching family are
    /// considered.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        let mut candidates = tokio::net::lookup_host(self.hostport.as_str()).await?;
        let picked = match self.network {
            Network::Udp => candidates.next(),
            Network::Udp4 => candidates.find(SocketAddr::is_ipv4),
            Network::Udp6 => candidates.find(SocketAddr::is_ipv6),
        };
        picked.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {} addresses for {}", self.network, self.hostport),
            )
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.network, self.hostport)
    }
}

impl FromStr for ListenAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, hostport) = split_scheme(s)?;

        // URL artifacts are rejected regardless of the surface syntax.
        if hostport.contains('#') {
            return Err(AddrError::Fragment);
        }
        if hostport.contains('?') {
            return Err(AddrError::Query);
        }
        if hostport.contains('/') {
            return Err(AddrError::Path);
        }

        let (_, port) = split_host_port(hostport)?;
        if port.is_empty() {
            return Err(AddrError::EmptyPort(hostport.to_string()));
        }

        Ok(ListenAddr {
            network,
            hostport: hostport.to_string(),
        })
    }
}

/// Splits an address string into its network and `host:port` parts.
fn split_scheme(s: &str) -> Result<(Network, &str), AddrError> {
    if let Some((scheme, rest)) = s.split_once("://") {
        let network =
            Network::from_scheme(scheme).ok_or_else(|| AddrError::Network(scheme.to_string()))?;
        return Ok((network, rest));
    }
    if let Some((scheme, rest)) = s.split_once(':') {
        // Opaque form, e.g. "udp4:localhost:8089". Anything else before the
        // first colon is a hostname, not a scheme.
        if let Some(network) = Network::from_scheme(scheme) {
            return Ok((network, rest));
        }
    }
    Ok((Network::Udp, s))
}

/// Splits `host:port`, honoring `[bracketed]` IPv6 hosts.
fn split_host_port(hostport: &str) -> Result<(&str, &str), AddrError> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| AddrError::UnterminatedBracket(hostport.to_string()))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| AddrError::MissingPort(hostport.to_string()))?;
        return Ok((host, port));
    }
    hostport
        .rsplit_once(':')
        .ok_or_else(|| AddrError::MissingPort(hostport.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_hostport() {
        let addr: ListenAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(addr.network(), Network::Udp);
        assert_eq!(addr.hostport(), "127.0.0.1:9000");
    }

    #[test]
    fn test_parse_bare_hostname() {
        let addr: ListenAddr = "localhost:8089".parse().unwrap();
        assert_eq!(addr.network(), Network::Udp);
        assert_eq!(addr.hostport(), "localhost:8089");
    }

    #[test]
    fn test_parse_opaque_scheme() {
        let addr: ListenAddr = "udp4:10.0.0.1:8089".parse().unwrap();
        assert_eq!(addr.network(), Network::Udp4);
        assert_eq!(addr.hostport(), "10.0.0.1:8089");
    }

    #[test]
    fn test_parse_authority_scheme() {
        let addr: ListenAddr = "udp6://[::1]:9000".parse().unwrap();
        assert_eq!(addr.network(), Network::Udp6);
        assert_eq!(addr.hostport(), "[::1]:9000");
    }

    #[test]
    fn test_parse_rejects_unknown_network() {
        let err = "tcp://127.0.0.1:9000".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::Network("tcp".to_string()));
    }

    #[test]
    fn test_parse_rejects_fragment() {
        let err = "udp://127.0.0.1:9000#frag".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::Fragment);
    }

    #[test]
    fn test_parse_rejects_query() {
        let err = "udp://127.0.0.1:9000?x=1".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::Query);
    }

    #[test]
    fn test_parse_rejects_path() {
        let err = "udp://127.0.0.1:9000/db".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::Path);
    }

    #[test]
    fn test_parse_rejects_empty_port() {
        let err = "udp://127.0.0.1:".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::EmptyPort("127.0.0.1:".to_string()));
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        let err = "udp://localhost".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::MissingPort("localhost".to_string()));
    }

    #[test]
    fn test_display_form() {
        let addr: ListenAddr = "udp4:127.0.0.1:8089".parse().unwrap();
        assert_eq!(addr.to_string(), "udp4(127.0.0.1:8089)");
    }

    #[test]
    fn test_canonical_round_trip() {
        for raw in [
            "127.0.0.1:9000",
            "udp4:10.1.2.3:8089",
            "udp6://[::1]:9000",
            "localhost:8125",
        ] {
            let addr: ListenAddr = raw.parse().unwrap();
            let canonical = format!("{}://{}", addr.network(), addr.hostport());
            let reparsed: ListenAddr = canonical.parse().unwrap();
            assert_eq!(reparsed, addr, "round trip through {canonical}");
        }
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addr: ListenAddr = "127.0.0.1:9000".parse().unwrap();
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved.to_string(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_resolve_family_filter() {
        let addr: ListenAddr = "udp6:127.0.0.1:9000".parse().unwrap();
        // A v4 literal has no v6 candidates.
        assert!(addr.resolve().await.is_err());
    }
}
