//! Route list and runtime configuration
//!
//! The route list lives in a JSON settings file: an array of records, one per
//! site. The short field names (`URL`, `http`, `https`, `upgrade`) are what
//! we write; the descriptive names are accepted as aliases when reading.

use crate::error::{ProxyError, Result};
use crate::routes::BackendTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// One configured site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Host header value this route answers to
    #[serde(rename = "URL", alias = "hostname")]
    pub hostname: String,

    /// Local backend port for plaintext traffic, e.g. ":8080"
    #[serde(rename = "http", alias = "plaintext_port")]
    pub plaintext_port: String,

    /// Local backend port for traffic that arrived over TLS
    #[serde(rename = "https", alias = "secure_port")]
    pub secure_port: String,

    /// Redirect plaintext GET/HEAD to HTTPS instead of proxying
    #[serde(rename = "upgrade", alias = "force_upgrade", default)]
    pub force_upgrade: bool,
}

impl RouteRecord {
    pub fn new(hostname: &str, plaintext_port: &str, secure_port: &str, force_upgrade: bool) -> Self {
        Self {
            hostname: hostname.to_string(),
            plaintext_port: plaintext_port.to_string(),
            secure_port: secure_port.to_string(),
            force_upgrade,
        }
    }
}

/// Body served for hosts that have no route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum NotFoundMode {
    /// JSON error page naming the requested host, status 200
    #[default]
    Informative,
    /// Bare 404 with an empty body
    Bare,
}

/// What the supervisor does when one listener stops for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Stop the sibling listener and return the error
    #[default]
    Shutdown,
    /// Log the failure and keep the other listener running
    KeepServing,
}

/// Runtime configuration for the listener pair and dispatchers
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub not_found: NotFoundMode,
    pub failure_policy: FailurePolicy,
    /// Port written into upgrade redirects
    pub redirect_port: u16,
    pub handshake_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            https_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            not_found: NotFoundMode::Informative,
            failure_policy: FailurePolicy::Shutdown,
            redirect_port: 443,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Read, parse and validate the route list at `path`
pub fn load_routes<P: AsRef<Path>>(path: P) -> Result<Vec<RouteRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| ProxyError::SettingsUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let routes = parse_routes(&data)?;
    debug!(path = %path.display(), routes = routes.len(), "Loaded route list");
    Ok(routes)
}

/// Parse and validate a route list from JSON text
pub fn parse_routes(json: &str) -> Result<Vec<RouteRecord>> {
    let routes: Vec<RouteRecord> = serde_json::from_str(json)?;
    validate_routes(&routes)?;
    Ok(routes)
}

/// Reject empty or duplicate hostnames and unresolvable backend addresses.
///
/// Hostnames are compared after [`normalize_host`], so `A.example` and
/// `a.example:80` count as the same site.
pub fn validate_routes(routes: &[RouteRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(routes.len());

    for (index, route) in routes.iter().enumerate() {
        let host = normalize_host(&route.hostname);
        if host.is_empty() {
            return Err(ProxyError::EmptyHostname { index });
        }
        if !seen.insert(host.clone()) {
            return Err(ProxyError::DuplicateHostname(host));
        }

        BackendTarget::resolve(&route.hostname, &route.plaintext_port)?;
        BackendTarget::resolve(&route.hostname, &route.secure_port)?;
    }

    Ok(())
}

/// Write the route list back to `path` as pretty-printed JSON
pub fn save_routes<P: AsRef<Path>>(path: P, routes: &[RouteRecord]) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_string_pretty(routes)?;
    fs::write(path, data)?;
    Ok(())
}

/// Drop any `:port` suffix, keeping IPv6 literals bracketed
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Canonical form of a hostname for table keys, lookups and certificate names.
///
/// `A.Example.:8080` and `a.example` name the same site.
pub fn normalize_host(host: &str) -> String {
    strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase()
}
