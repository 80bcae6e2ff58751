//! Minimal SIP URI value object.
//!
//! The engine only needs the pieces of a URI that drive routing decisions:
//! scheme, user, host, port. Full URI grammar (parameters, headers,
//! escaping) belongs to the parsing collaborator and is out of scope here.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// URI scheme; anything other than `sip`/`sips` is rejected at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A SIP or SIPS URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// `lr` parameter presence, relevant for route-set handling.
    pub loose_routing: bool,
}

impl Uri {
    pub fn sip(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: Some(user.into()),
            host: host.into(),
            port: None,
            loose_routing: false,
        }
    }

    pub fn sip_host(host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            loose_routing: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_loose_routing(mut self) -> Self {
        self.loose_routing = true;
        self
    }

    /// Port to use when none is present (5060 for sip, 5061 for sips).
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        })
    }

    /// Resolve to a socket address when the host is a numeric IP.
    /// Name resolution is a collaborator concern; this covers the common
    /// in-dialog case where Contact carries a literal address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port_or_default()))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if self.loose_routing {
            f.write_str(";lr")?;
        }
        Ok(())
    }
}

/// Error constructing a URI from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid SIP URI: {0}")]
pub struct InvalidUri(String);

impl FromStr for Uri {
    type Err = InvalidUri;

    /// Accepts the `sip:[user@]host[:port][;lr]` shape used throughout the
    /// engine and its tests. Anything fancier must arrive pre-parsed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(InvalidUri(s.to_string()));
        };

        let (rest, loose_routing) = match rest.strip_suffix(";lr") {
            Some(trimmed) => (trimmed, true),
            None => (rest, false),
        };

        let (user, host_port) = match rest.split_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some(_) => return Err(InvalidUri(s.to_string())),
            None => (None, rest),
        };

        // IPv6 literals are written in brackets; split port only outside them.
        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| InvalidUri(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse().map_err(|_| InvalidUri(s.to_string()))?),
                None if tail.is_empty() => None,
                None => return Err(InvalidUri(s.to_string())),
            };
            (host.to_string(), port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    Some(port.parse().map_err(|_| InvalidUri(s.to_string()))?),
                ),
                None => (host_port.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(InvalidUri(s.to_string()));
        }

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            loose_routing,
        })
    }
}
