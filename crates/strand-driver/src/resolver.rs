//! Host name resolution for channel endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};

use thiserror::Error;

/// Turns names into addresses.
///
/// `lookup` maps a logical name used in a channel to a host name (or
/// `host:port`) before parsing; `resolve` turns a host into an address.
pub trait NameResolver: Send + Sync {
    /// Resolve `name`, or `None` if it cannot be resolved right now.
    fn resolve(&self, name: &str) -> Option<IpAddr>;

    /// Map `name`, given for channel parameter `uri_param`, to the value to
    /// parse. `is_re_lookup` is set when an existing endpoint is being
    /// looked up again.
    fn lookup(&self, name: &str, uri_param: &str, is_re_lookup: bool) -> Option<String> {
        let _ = (uri_param, is_re_lookup);
        Some(name.to_owned())
    }
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNameResolver;

impl NameResolver for DefaultNameResolver {
    fn resolve(&self, name: &str) -> Option<IpAddr> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Some(ip);
        }
        match (name, 0u16).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
            Err(err) => {
                tracing::debug!("resolving {name} failed: {err}");
                None
            }
        }
    }
}

/// A malformed lookup table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupTableError {
    #[error("lookup table entry {0:?} must have 4 comma separated fields")]
    BadEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableEntry {
    re_lookup_host: String,
    initial_host: String,
}

/// A fixed table of names, falling back to the system resolver.
///
/// Entries are `name,uri-param,re-lookup-host,initial-host` separated by
/// `|`, for example `NAME_0,endpoint,localhost:8001,localhost:8002|`.
#[derive(Debug, Clone, Default)]
pub struct StaticTableNameResolver {
    entries: HashMap<(String, String), TableEntry>,
    delegate: DefaultNameResolver,
}

impl StaticTableNameResolver {
    /// Parse a `|` separated table. Blank entries are skipped.
    pub fn parse(table: &str) -> Result<Self, LookupTableError> {
        let mut entries = HashMap::new();
        for raw in table.split('|').map(str::trim).filter(|e| !e.is_empty()) {
            let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
            let [name, param, re_lookup_host, initial_host] = fields[..] else {
                return Err(LookupTableError::BadEntry(raw.to_owned()));
            };
            entries.insert(
                (name.to_owned(), param.to_owned()),
                TableEntry {
                    re_lookup_host: re_lookup_host.to_owned(),
                    initial_host: initial_host.to_owned(),
                },
            );
        }
        Ok(Self {
            entries,
            delegate: DefaultNameResolver,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NameResolver for StaticTableNameResolver {
    fn resolve(&self, name: &str) -> Option<IpAddr> {
        self.delegate.resolve(name)
    }

    fn lookup(&self, name: &str, uri_param: &str, is_re_lookup: bool) -> Option<String> {
        match self.entries.get(&(name.to_owned(), uri_param.to_owned())) {
            Some(entry) if is_re_lookup => Some(entry.re_lookup_host.clone()),
            Some(entry) => Some(entry.initial_host.clone()),
            None => Some(name.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const TABLE: &str = "NAME_0,endpoint,localhost:8001,localhost:8002|\
                         NAME_1,endpoint,192.168.1.1:9001,192.168.1.2:9002|";

    #[test]
    fn test_static_table_lookup() {
        let resolver = StaticTableNameResolver::parse(TABLE).unwrap();
        assert_eq!(resolver.len(), 2);

        assert_eq!(resolver.lookup("NAME_0", "endpoint", true).as_deref(), Some("localhost:8001"));
        assert_eq!(resolver.lookup("NAME_0", "endpoint", false).as_deref(), Some("localhost:8002"));
        assert_eq!(resolver.lookup("NAME_1", "endpoint", true).as_deref(), Some("192.168.1.1:9001"));
        assert_eq!(resolver.lookup("NAME_1", "endpoint", false).as_deref(), Some("192.168.1.2:9002"));
    }

    #[test]
    fn test_static_table_passes_unknown_names_through() {
        let resolver = StaticTableNameResolver::parse(TABLE).unwrap();
        assert_eq!(resolver.lookup("NAME_0", "control", false).as_deref(), Some("NAME_0"));
        assert_eq!(resolver.lookup("other:1", "endpoint", false).as_deref(), Some("other:1"));
    }

    #[test]
    fn test_static_table_rejects_short_entry() {
        assert_eq!(
            StaticTableNameResolver::parse("NAME_0,endpoint,localhost:8001").unwrap_err(),
            LookupTableError::BadEntry("NAME_0,endpoint,localhost:8001".into())
        );
    }

    #[test]
    fn test_default_resolver_accepts_literals() {
        assert_eq!(
            DefaultNameResolver.resolve("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(DefaultNameResolver.resolve("::1"), Some("::1".parse().unwrap()));
    }
}
