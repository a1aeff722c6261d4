//! Parsing `host:port`, `ipv4:port` and `[ipv6[%scope]]:port` endpoints.
//!
//! The input is first run through the host/IPv4 state machine. If that
//! rejects the shape (a second `:` or a non-digit after the separator), the
//! IPv6 bracket state machine is tried.

use std::ffi::CString;
use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};

use thiserror::Error;

use crate::resolver::NameResolver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed address {input:?}: {reason}")]
pub struct AddressError {
    pub input: String,
    pub reason: &'static str,
}

impl AddressError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_owned(),
            reason,
        }
    }
}

/// A parsed endpoint. Host names the resolver could not resolve are kept
/// by name so they can be retried later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Resolved(SocketAddr),
    Unresolved { host: String, port: u16 },
}

impl Endpoint {
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Resolved(addr) => addr.port(),
            Endpoint::Unresolved { port, .. } => *port,
        }
    }

    /// The address, once the host has resolved.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Resolved(addr) => Some(*addr),
            Endpoint::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Endpoint::Resolved(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Resolved(addr) => write!(f, "{addr}"),
            Endpoint::Unresolved { host, port } => write!(f, "{host}:{port} (unresolved)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpV4State {
    Host,
    Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpV6State {
    StartAddr,
    Host,
    Scope,
    EndAddr,
    Port,
}

/// Outcome of one state machine: it either does not recognise the shape,
/// or it does and the address is good or bad.
enum Attempt {
    NotThisForm,
    Parsed(Result<Endpoint, AddressError>),
}

/// Parse `input`, resolving host names with `resolver`.
pub fn parse(input: &str, resolver: &dyn NameResolver) -> Result<Endpoint, AddressError> {
    if input.is_empty() {
        return Err(AddressError::new(input, "address must not be empty"));
    }

    if let Attempt::Parsed(result) = try_parse_ipv4(input, resolver) {
        return result;
    }
    match try_parse_ipv6(input, resolver) {
        Attempt::Parsed(result) => result,
        Attempt::NotThisForm => Err(AddressError::new(input, "invalid format")),
    }
}

fn try_parse_ipv4(input: &str, resolver: &dyn NameResolver) -> Attempt {
    let mut state = IpV4State::Host;
    let mut separator = None;

    for (i, c) in input.char_indices() {
        match state {
            IpV4State::Host => {
                if c == ':' {
                    separator = Some(i);
                    state = IpV4State::Port;
                }
            }
            IpV4State::Port => {
                if !c.is_ascii_digit() {
                    return Attempt::NotThisForm;
                }
            }
        }
    }

    match separator {
        Some(index) if index + 1 < input.len() => {
            let host = &input[..index];
            Attempt::Parsed(parse_port(input, &input[index + 1..]).map(|port| build(host, None, port, resolver)))
        }
        _ => Attempt::Parsed(Err(AddressError::new(input, "port is required"))),
    }
}

fn try_parse_ipv6(input: &str, resolver: &dyn NameResolver) -> Attempt {
    let mut state = IpV6State::StartAddr;
    let mut scope_index = None;
    let mut port_index = None;

    for (i, c) in input.char_indices() {
        match state {
            IpV6State::StartAddr => {
                if c != '[' {
                    return Attempt::NotThisForm;
                }
                state = IpV6State::Host;
            }
            IpV6State::Host => {
                if c == ']' {
                    state = IpV6State::EndAddr;
                } else if c == '%' {
                    scope_index = Some(i);
                    state = IpV6State::Scope;
                } else if c != ':' && !c.is_ascii_hexdigit() {
                    return Attempt::NotThisForm;
                }
            }
            IpV6State::Scope => {
                if c == ']' {
                    state = IpV6State::EndAddr;
                } else if !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-')) {
                    return Attempt::NotThisForm;
                }
            }
            IpV6State::EndAddr => {
                if c != ':' {
                    return Attempt::NotThisForm;
                }
                port_index = Some(i);
                state = IpV6State::Port;
            }
            IpV6State::Port => {
                if !c.is_ascii_digit() {
                    return Attempt::NotThisForm;
                }
            }
        }
    }

    match port_index {
        Some(index) if index + 1 < input.len() => {
            // `]` sits just before the port separator.
            let host_end = scope_index.unwrap_or(index - 1);
            let host = &input[1..host_end];
            let scope = scope_index.map(|s| &input[s + 1..index - 1]);
            Attempt::Parsed(parse_port(input, &input[index + 1..]).map(|port| build(host, scope, port, resolver)))
        }
        _ => Attempt::Parsed(Err(AddressError::new(input, "port is required"))),
    }
}

fn parse_port(input: &str, digits: &str) -> Result<u16, AddressError> {
    digits
        .parse::<u16>()
        .map_err(|_| AddressError::new(input, "port must be in [0, 65535]"))
}

fn build(host: &str, scope: Option<&str>, port: u16, resolver: &dyn NameResolver) -> Endpoint {
    match resolver.resolve(host) {
        Some(IpAddr::V6(ip)) => {
            let scope_id = scope.map(scope_id_for).unwrap_or(0);
            Endpoint::Resolved(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id)))
        }
        Some(ip) => Endpoint::Resolved(SocketAddr::new(ip, port)),
        None => {
            tracing::debug!("could not resolve {host}, keeping endpoint unresolved");
            Endpoint::Unresolved {
                host: host.to_owned(),
                port,
            }
        }
    }
}

/// Numeric scopes are used as is; anything else is looked up as an
/// interface name.
fn scope_id_for(scope: &str) -> u32 {
    if let Ok(id) = scope.parse::<u32>() {
        return id;
    }
    let Ok(name) = CString::new(scope) else {
        return 0;
    };
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    unsafe { libc::if_nametoindex(name.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    /// Resolves only what it is told about.
    struct Table(HashMap<&'static str, IpAddr>);

    impl NameResolver for Table {
        fn resolve(&self, name: &str) -> Option<IpAddr> {
            name.parse().ok().or_else(|| self.0.get(name).copied())
        }
    }

    fn resolver() -> Table {
        Table(HashMap::from([("localhost", IpAddr::V4(Ipv4Addr::LOCALHOST))]))
    }

    #[test]
    fn test_hostname_and_port() {
        let endpoint = parse("localhost:54325", &resolver()).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Resolved(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 54325))
        );
    }

    #[test]
    fn test_ipv4_and_port() {
        let endpoint = parse("192.168.1.20:55", &resolver()).unwrap();
        assert_eq!(endpoint.socket_addr(), Some("192.168.1.20:55".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_and_port() {
        let endpoint = parse("[::1]:9000", &resolver()).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Resolved(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000))
        );

        let full = parse("[fe80::1:2:3:4]:1234", &resolver()).unwrap();
        assert_eq!(full.port(), 1234);
    }

    #[test]
    fn test_ipv6_numeric_scope() {
        let endpoint = parse("[fe80::1%7]:40456", &resolver()).unwrap();
        match endpoint {
            Endpoint::Resolved(SocketAddr::V6(addr)) => {
                assert_eq!(addr.scope_id(), 7);
                assert_eq!(addr.port(), 40456);
                assert_eq!(*addr.ip(), "fe80::1".parse::<Ipv6Addr>().unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_name_kept() {
        let endpoint = parse("nowhere.invalid:8080", &resolver()).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Unresolved {
                host: "nowhere.invalid".into(),
                port: 8080
            }
        );
        assert!(!endpoint.is_resolved());
    }

    #[test]
    fn test_rejects_malformed() {
        let resolver = resolver();
        for input in [
            "",
            "abc",
            "localhost:",
            "localhost:12a",
            "localhost:65536",
            "[::1]",
            "[::1]:",
            "[::1]9000",
            "[::g]:9000",
            "[::1%eth 0]:9000",
            "::1:9000:",
        ] {
            let err = parse(input, &resolver).unwrap_err();
            assert_eq!(err.input, input);
        }
    }

    #[test]
    fn test_bare_ipv6_without_brackets_rejected() {
        // Two colons send it to the IPv6 machine, which needs brackets.
        assert!(parse("::1:9000", &resolver()).is_err());
    }
}
