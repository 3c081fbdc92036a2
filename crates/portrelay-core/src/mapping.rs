//! Port mappings: which local port relays to which backend.
//!
//! The raw form is a string→string map as it appears in the config document
//! (`"13306": "10.0.0.5:3306"`). [`MappingTable::from_raw`] validates it into
//! typed entries and rejects anything ambiguous up front, so the listeners
//! never have to deal with a half-valid table.

use crate::error::{RelayError, RelayResult};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// A validated `host:port` backend target.
///
/// The host is kept as text and resolved when a session dials it, so a
/// backend whose DNS name does not resolve yet still loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddr {
    host: String,
    port: u16,
}

impl BackendAddr {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for BackendAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::InvalidMapping(format!("backend {s:?} is not host:port")))?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| {
                RelayError::InvalidMapping(format!("backend {s:?} has an unterminated IPv6 literal"))
            })?;
            inner.parse::<Ipv6Addr>().map_err(|e| {
                RelayError::InvalidMapping(format!("backend {s:?} has a bad IPv6 literal: {e}"))
            })?;
            host
        } else {
            host
        };

        if host.is_empty() {
            return Err(RelayError::InvalidMapping(format!("backend {s:?} has an empty host")));
        }
        if !host.starts_with('[') && (host.contains(':') || host.chars().any(char::is_whitespace)) {
            return Err(RelayError::InvalidMapping(format!("backend {s:?} has a malformed host")));
        }

        let port = parse_port(port)
            .ok_or_else(|| RelayError::InvalidMapping(format!("backend {s:?} has a bad port")))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One listen port and the backend it relays to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub listen_port: u16,
    pub backend: BackendAddr,
}

/// The full set of mappings, ordered by listen port.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: Vec<MappingEntry>,
}

impl MappingTable {
    /// Validate raw `port → address` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidMapping`] when the table is empty, a key
    /// is not a port in `1..=65535`, two keys name the same port (`"80"` and
    /// `"080"`), or a value is not a `host:port` string.
    pub fn from_raw<I, K, V>(raw: I) -> RelayResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut by_port: BTreeMap<u16, MappingEntry> = BTreeMap::new();

        for (key, value) in raw {
            let key = key.as_ref();
            let listen_port = parse_port(key).ok_or_else(|| {
                RelayError::InvalidMapping(format!("listen port {key:?} is not in 1-65535"))
            })?;
            let backend: BackendAddr = value.as_ref().parse()?;

            if by_port.contains_key(&listen_port) {
                return Err(RelayError::InvalidMapping(format!(
                    "listen port {listen_port} appears more than once"
                )));
            }
            by_port.insert(listen_port, MappingEntry { listen_port, backend });
        }

        if by_port.is_empty() {
            return Err(RelayError::InvalidMapping("no port mappings configured".to_string()));
        }

        Ok(Self {
            entries: by_port.into_values().collect(),
        })
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for MappingTable {
    type Item = MappingEntry;
    type IntoIter = std::vec::IntoIter<MappingEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

fn parse_port(s: &str) -> Option<u16> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
