//! Core domain types

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Default SSH login when a target omits `user@`
pub const DEFAULT_USER: &str = "root";

/// Default SSH port when a target omits `:port`
pub const DEFAULT_PORT: u16 = 22;

/// Bind host used when a forward spec gives only a port
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// User-facing name of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAlias(String);

impl SessionAlias {
    /// Create a new alias
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    /// Get the raw alias string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionAlias {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionAlias {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a forward rule, unique within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `host:port` pair
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

    /// Loopback endpoint on the given port
    pub fn localhost(port: u16) -> Self {
        Self::new(DEFAULT_BIND_HOST, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s).ok_or_else(|| ParseError::Endpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::Endpoint(s.to_string()));
        }
        Ok(Self::new(host, parse_port(port)?))
    }
}

/// Split `host:port` or `[v6]:port`. Bare IPv6 addresses are rejected.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        return Some((&rest[..end], port));
    }
    let (host, port) = s.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

fn parse_port(s: &str) -> Result<u16, ParseError> {
    s.parse::<u16>().map_err(|_| ParseError::Port(s.to_string()))
}

/// Remote SSH server and login, `user@host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SessionTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `user@host`, `host:port` or `user@host:port`, filling
    /// in whatever is omitted from the given defaults.
    pub fn parse_with_defaults(
        s: &str,
        default_user: &str,
        default_port: u16,
    ) -> Result<Self, ParseError> {
        let (user, host_part) = match s.split_once('@') {
            Some(("", _)) => return Err(ParseError::Target(s.to_string(), "empty user")),
            Some((user, rest)) => (user, rest),
            None => (default_user, s),
        };

        let (host, port) = if let Some(inner) = host_part
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
        {
            (inner, default_port)
        } else if host_part.starts_with('[') {
            let endpoint: Endpoint = host_part.parse()?;
            return Ok(Self::new(user, endpoint.host, endpoint.port));
        } else {
            match host_part.rsplit_once(':') {
                Some((host, "")) if !host.contains(':') => (host, default_port),
                Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
                // bare IPv6 literal
                _ => (host_part, default_port),
            }
        };

        if host.is_empty() {
            return Err(ParseError::Target(s.to_string(), "empty host"));
        }
        Ok(Self::new(user, host, port))
    }

    /// The server address as an endpoint
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.endpoint())
    }
}

impl FromStr for SessionTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_defaults(s, DEFAULT_USER, DEFAULT_PORT)
    }
}

/// How a session authenticates to the server
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password authentication
    Password(String),
    /// Private key file, optionally encrypted
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Identities offered by the running SSH agent (`SSH_AUTH_SOCK`)
    Agent,
    /// Agent identities first, then the default key files in `~/.ssh`
    Auto,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(password.into())
    }

    /// Unencrypted private key at `path`
    pub fn key(path: impl Into<PathBuf>) -> Self {
        Self::PrivateKey {
            path: path.into(),
            passphrase: None,
        }
    }

    /// Short name for logs and status output
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "key",
            AuthMethod::Agent => "agent",
            AuthMethod::Auto => "auto",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::Agent => f.write_str("Agent"),
            AuthMethod::Auto => f.write_str("Auto"),
        }
    }
}

/// Direction of a forward, relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardDirection {
    /// Listen locally, connect out from the server
    Local,
    /// Listen on the server, connect out from the client
    Remote,
    /// Local SOCKS5 endpoint, destinations chosen per connection
    Dynamic,
}

impl fmt::Display for ForwardDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardDirection::Local => write!(f, "local"),
            ForwardDirection::Remote => write!(f, "remote"),
            ForwardDirection::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// What a forward rule does, with direction-specific fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum ForwardSpec {
    /// `-L`: `bind` is local, `target` is reached from the server
    Local { bind: Endpoint, target: Endpoint },
    /// `-R`: `bind` is on the server, `target` is reached from the client
    Remote { bind: Endpoint, target: Endpoint },
    /// `-D`: SOCKS5 endpoint on the local `bind`
    Dynamic { bind: Endpoint },
}

impl ForwardSpec {
    pub fn local(bind: Endpoint, target: Endpoint) -> Self {
        Self::Local { bind, target }
    }

    pub fn remote(bind: Endpoint, target: Endpoint) -> Self {
        Self::Remote { bind, target }
    }

    pub fn dynamic(bind: Endpoint) -> Self {
        Self::Dynamic { bind }
    }

    /// Parse an OpenSSH `-L` argument: `[bind_addr:]port:host:hostport`
    pub fn parse_local(s: &str) -> Result<Self, ParseError> {
        let (bind, target) = parse_bind_and_target(s)?;
        Ok(Self::Local { bind, target })
    }

    /// Parse an OpenSSH `-R` argument: `[bind_addr:]port:host:hostport`
    pub fn parse_remote(s: &str) -> Result<Self, ParseError> {
        let (bind, target) = parse_bind_and_target(s)?;
        Ok(Self::Remote { bind, target })
    }

    /// Parse an OpenSSH `-D` argument: `[bind_addr:]port`
    pub fn parse_dynamic(s: &str) -> Result<Self, ParseError> {
        let parts = split_spec(s).ok_or(ParseError::Forward(s.to_string(), "unbalanced brackets"))?;
        let bind = match parts.as_slice() {
            [port] => Endpoint::localhost(parse_port(port)?),
            [host, port] => Endpoint::new(bind_host(host), parse_port(port)?),
            _ => return Err(ParseError::Forward(s.to_string(), "expected [bind_addr:]port")),
        };
        Ok(Self::Dynamic { bind })
    }

    pub fn direction(&self) -> ForwardDirection {
        match self {
            ForwardSpec::Local { .. } => ForwardDirection::Local,
            ForwardSpec::Remote { .. } => ForwardDirection::Remote,
            ForwardSpec::Dynamic { .. } => ForwardDirection::Dynamic,
        }
    }

    pub fn bind(&self) -> &Endpoint {
        match self {
            ForwardSpec::Local { bind, .. }
            | ForwardSpec::Remote { bind, .. }
            | ForwardSpec::Dynamic { bind } => bind,
        }
    }

    /// Fixed target, if the direction has one
    pub fn target(&self) -> Option<&Endpoint> {
        match self {
            ForwardSpec::Local { target, .. } | ForwardSpec::Remote { target, .. } => Some(target),
            ForwardSpec::Dynamic { .. } => None,
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardSpec::Local { bind, target } => write!(f, "L {} -> {}", bind, target),
            ForwardSpec::Remote { bind, target } => write!(f, "R {} -> {}", bind, target),
            ForwardSpec::Dynamic { bind } => write!(f, "D {} (socks5)", bind),
        }
    }
}

fn parse_bind_and_target(s: &str) -> Result<(Endpoint, Endpoint), ParseError> {
    let parts = split_spec(s).ok_or(ParseError::Forward(s.to_string(), "unbalanced brackets"))?;
    let (bind_host_part, bind_port, target_host, target_port) = match parts.as_slice() {
        [port, host, hostport] => (DEFAULT_BIND_HOST, *port, *host, *hostport),
        [bind, port, host, hostport] => (bind_host(bind), *port, *host, *hostport),
        _ => {
            return Err(ParseError::Forward(
                s.to_string(),
                "expected [bind_addr:]port:host:hostport",
            ))
        }
    };
    if target_host.is_empty() {
        return Err(ParseError::Forward(s.to_string(), "empty target host"));
    }
    Ok((
        Endpoint::new(bind_host_part, parse_port(bind_port)?),
        Endpoint::new(target_host, parse_port(target_port)?),
    ))
}

/// OpenSSH treats an empty bind address and `*` as all interfaces
fn bind_host(host: &str) -> &str {
    match host {
        "" | "*" => "0.0.0.0",
        other => other,
    }
}

/// Split on `:`, keeping `[...]` groups (IPv6 literals) intact.
fn split_spec(s: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut rest = s;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            parts.push(&stripped[..end]);
            rest = &stripped[end + 1..];
            if rest.is_empty() {
                break;
            }
            rest = rest.strip_prefix(':')?;
        } else {
            match rest.find(':') {
                Some(i) => {
                    parts.push(&rest[..i]);
                    rest = &rest[i + 1..];
                    if rest.is_empty() {
                        parts.push("");
                    }
                }
                None => {
                    parts.push(rest);
                    break;
                }
            }
        }
    }

    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!("example.com:80".parse::<Endpoint>().unwrap(), Endpoint::new("example.com", 80));
        assert_eq!("[::1]:2222".parse::<Endpoint>().unwrap(), Endpoint::new("::1", 2222));
        assert!("example.com".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("::1:80".parse::<Endpoint>().is_err());
        assert_eq!(
            "host:99999".parse::<Endpoint>().unwrap_err(),
            ParseError::Port("99999".to_string())
        );
    }

    #[test]
    fn test_endpoint_display_brackets_ipv6() {
        assert_eq!(Endpoint::new("::1", 22).to_string(), "[::1]:22");
        assert_eq!(Endpoint::localhost(8080).to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_target_defaults() {
        let target: SessionTarget = "10.0.0.5".parse().unwrap();
        assert_eq!(target, SessionTarget::new("root", "10.0.0.5", 22));

        let target: SessionTarget = "deploy@build.internal:2200".parse().unwrap();
        assert_eq!(target, SessionTarget::new("deploy", "build.internal", 2200));

        let target = SessionTarget::parse_with_defaults("box:", "ops", 2022).unwrap();
        assert_eq!(target, SessionTarget::new("ops", "box", 2022));
    }

    #[test]
    fn test_target_ipv6() {
        let target: SessionTarget = "admin@[fe80::1]:2222".parse().unwrap();
        assert_eq!(target, SessionTarget::new("admin", "fe80::1", 2222));

        let target: SessionTarget = "[fe80::1]".parse().unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.host, "fe80::1");
    }

    #[test]
    fn test_target_rejects_empty_parts() {
        assert!("@host".parse::<SessionTarget>().is_err());
        assert!("user@".parse::<SessionTarget>().is_err());
        assert!("user@host:abc".parse::<SessionTarget>().is_err());
    }

    #[test]
    fn test_parse_local_forward() {
        let spec = ForwardSpec::parse_local("8080:localhost:80").unwrap();
        assert_eq!(
            spec,
            ForwardSpec::local(Endpoint::localhost(8080), Endpoint::new("localhost", 80))
        );

        let spec = ForwardSpec::parse_local("0.0.0.0:5432:db.internal:5432").unwrap();
        assert_eq!(spec.bind(), &Endpoint::new("0.0.0.0", 5432));
        assert_eq!(spec.target(), Some(&Endpoint::new("db.internal", 5432)));
    }

    #[test]
    fn test_parse_forward_ipv6_and_wildcard() {
        let spec = ForwardSpec::parse_remote("[::1]:9000:[fd00::2]:22").unwrap();
        assert_eq!(spec.direction(), ForwardDirection::Remote);
        assert_eq!(spec.bind(), &Endpoint::new("::1", 9000));
        assert_eq!(spec.target(), Some(&Endpoint::new("fd00::2", 22)));

        let spec = ForwardSpec::parse_local("*:8080:web:80").unwrap();
        assert_eq!(spec.bind().host, "0.0.0.0");
    }

    #[test]
    fn test_parse_dynamic_forward() {
        assert_eq!(
            ForwardSpec::parse_dynamic("1080").unwrap(),
            ForwardSpec::dynamic(Endpoint::localhost(1080))
        );
        let spec = ForwardSpec::parse_dynamic("[::]:1080").unwrap();
        assert_eq!(spec.bind(), &Endpoint::new("::", 1080));
        assert!(spec.target().is_none());
    }

    #[test]
    fn test_parse_forward_errors() {
        assert!(ForwardSpec::parse_local("8080").is_err());
        assert!(ForwardSpec::parse_local("8080::80").is_err());
        assert!(ForwardSpec::parse_local("[::1:8080:h:80").is_err());
        assert!(ForwardSpec::parse_dynamic("a:b:c").is_err());
        assert!(ForwardSpec::parse_dynamic("").is_err());
    }

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let debug = format!("{:?}", AuthMethod::password("hunter2"));
        assert!(!debug.contains("hunter2"));

        let key = AuthMethod::PrivateKey {
            path: PathBuf::from("/home/me/.ssh/id_ed25519"),
            passphrase: Some("swordfish".into()),
        };
        let debug = format!("{:?}", key);
        assert!(debug.contains("id_ed25519"));
        assert!(!debug.contains("swordfish"));
        assert_eq!(key.kind(), "key");
    }

    #[test]
    fn test_spec_display() {
        let spec = ForwardSpec::local(Endpoint::localhost(8080), Endpoint::new("web", 80));
        assert_eq!(spec.to_string(), "L 127.0.0.1:8080 -> web:80");
    }
}
