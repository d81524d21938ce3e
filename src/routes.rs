//! Host routing tables
//!
//! Two tables are built from one route list, one per listener. They are never
//! mutated after construction, so every connection task reads them through an
//! `Arc` without locking.

use crate::config::{normalize_host, RouteRecord};
use crate::error::{ProxyError, Result};
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::Uri;
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Which listener a table (or dispatcher) serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Plaintext,
    Encrypted,
}

impl Protocol {
    /// Scheme clients used to reach us
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Plaintext => "http",
            Protocol::Encrypted => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Plaintext => "HTTP",
            Protocol::Encrypted => "HTTPS",
        })
    }
}

/// A backend on the loopback interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    authority: Authority,
}

impl BackendTarget {
    /// Resolve a port string such as `":8080"` against `127.0.0.1`.
    ///
    /// An empty string means port 80. Anything that would add a path, query or
    /// credentials to the backend URL is rejected.
    pub fn resolve(hostname: &str, port: &str) -> Result<Self> {
        let invalid = |reason: String| ProxyError::InvalidBackend {
            hostname: hostname.to_string(),
            address: port.to_string(),
            reason,
        };

        let url = Url::parse(&format!("http://127.0.0.1{}", port)).map_err(|e| invalid(e.to_string()))?;

        if url.host_str() != Some("127.0.0.1") {
            return Err(invalid("backend must be a port on the local host".to_string()));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("backend address must not carry a path".to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("backend address must not carry credentials".to_string()));
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let authority = format!("127.0.0.1:{}", port)
            .parse::<Authority>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self { authority })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute URI on this backend for the given origin-form target
    pub fn uri_for(&self, path_and_query: Option<&PathAndQuery>) -> std::result::Result<Uri, hyper::http::Error> {
        Uri::builder()
            .scheme("http")
            .authority(self.authority.clone())
            .path_and_query(path_and_query.map(|pq| pq.as_str()).unwrap_or("/"))
            .build()
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// Routing decision data for one hostname on one listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub backend: BackendTarget,
    /// Redirect to HTTPS instead of proxying. Always false on the encrypted table.
    pub upgrade: bool,
}

/// Immutable hostname -> entry map for a single listener
#[derive(Debug, Clone)]
pub struct RouteTable {
    protocol: Protocol,
    entries: HashMap<String, DispatchEntry>,
}

impl RouteTable {
    /// Build the table for `protocol` from the route list.
    ///
    /// A single malformed backend or a repeated hostname fails the whole build.
    pub fn build(routes: &[RouteRecord], protocol: Protocol) -> Result<Self> {
        let mut entries = HashMap::with_capacity(routes.len());

        for (index, route) in routes.iter().enumerate() {
            let host = normalize_host(&route.hostname);
            if host.is_empty() {
                return Err(ProxyError::EmptyHostname { index });
            }

            let (port, upgrade) = match protocol {
                Protocol::Plaintext => (&route.plaintext_port, route.force_upgrade),
                Protocol::Encrypted => (&route.secure_port, false),
            };
            let backend = BackendTarget::resolve(&route.hostname, port)?;

            if entries.insert(host.clone(), DispatchEntry { backend, upgrade }).is_some() {
                return Err(ProxyError::DuplicateHostname(host));
            }
        }

        Ok(Self { protocol, entries })
    }

    /// Find the entry for a request host; the port and letter case are ignored
    pub fn lookup(&self, host: &str) -> Option<&DispatchEntry> {
        self.entries.get(&normalize_host(host))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Hostnames eligible for certificates, in route-list order
pub fn whitelist(routes: &[RouteRecord]) -> Vec<String> {
    routes.iter().map(|r| normalize_host(&r.hostname)).collect()
}

/// Everything the listeners need from the route list
#[derive(Debug, Clone)]
pub struct RouteTables {
    pub plaintext: RouteTable,
    pub encrypted: RouteTable,
    pub whitelist: Vec<String>,
}

impl RouteTables {
    pub fn build(routes: &[RouteRecord]) -> Result<Self> {
        Ok(Self {
            plaintext: RouteTable::build(routes, Protocol::Plaintext)?,
            encrypted: RouteTable::build(routes, Protocol::Encrypted)?,
            whitelist: whitelist(routes),
        })
    }
}
