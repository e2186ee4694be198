//! Endpoint parsing
//!
//! Turns `[user@]host[:port]` strings into structured values. A missing user
//! falls back to the current OS user, a missing port to 22 and an empty host
//! (`":2222"`) to `127.0.0.1`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SshError;

pub const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_HOST: &str = "127.0.0.1";

/// A network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an endpoint, discarding any `user@` prefix
    pub fn parse(s: &str) -> Result<Self, SshError> {
        let url = SshUrl::parse(s)?;
        Ok(Self {
            host: url.host,
            port: url.port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    pub username: String,
    pub host: String,
    pub port: u16,
}

impl SshUrl {
    pub fn parse(s: &str) -> Result<Self, SshError> {
        let s = s.trim();
        let (username, host_part) = match s.rsplit_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (whoami::username(), s),
        };

        let (host, port) = split_host_port(host_part)?;
        let host = if host.is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            host
        };

        Ok(Self {
            username,
            host,
            port,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals (`[::1]:22`)
fn split_host_port(s: &str) -> Result<(String, u16), SshError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| SshError::Config(format!("Invalid endpoint '{}': missing ']'", s)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(s, p)?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => {
                return Err(SshError::Config(format!("Invalid endpoint '{}'", s)));
            }
        };
        return Ok((host.to_string(), port));
    }

    match s.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host.to_string(), parse_port(s, port)?)),
        // bare IPv6 literal without port
        Some(_) => Ok((s.to_string(), DEFAULT_SSH_PORT)),
        None => Ok((s.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn parse_port(original: &str, port: &str) -> Result<u16, SshError> {
    port.parse::<u16>()
        .map_err(|_| SshError::Config(format!("Invalid port '{}' in endpoint '{}'", port, original)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url() {
        let url = SshUrl::parse("user@192.168.0.1:22").unwrap();
        assert_eq!(url.username, "user");
        assert_eq!(url.host, "192.168.0.1");
        assert_eq!(url.port, 22);
    }

    #[test]
    fn test_empty_host_defaults_to_loopback() {
        let url = SshUrl::parse(":22").unwrap();
        assert_eq!(url.username, whoami::username());
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 22);
    }

    #[test]
    fn test_defaults() {
        let url = SshUrl::parse("example.com").unwrap();
        assert_eq!(url.username, whoami::username());
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, DEFAULT_SSH_PORT);

        let url = SshUrl::parse("admin@example.com").unwrap();
        assert_eq!(url.username, "admin");
        assert_eq!(url.port, 22);
    }

    #[test]
    fn test_custom_port() {
        let endpoint = Endpoint::parse("root@localhost:2222").unwrap();
        assert_eq!(endpoint, Endpoint::new("localhost", 2222));
        assert_eq!(endpoint.to_string(), "localhost:2222");
    }

    #[test]
    fn test_ipv6() {
        let endpoint = Endpoint::parse("[::1]:8022").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 8022);

        let endpoint = Endpoint::parse("::1").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 22);
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            Endpoint::parse("host:notaport"),
            Err(SshError::Config(_))
        ));
        assert!(Endpoint::parse("host:70000").is_err());
    }
}
