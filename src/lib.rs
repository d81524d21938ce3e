//! HostProxy - A host-routed HTTP/HTTPS reverse proxy front door
//!
//! Provides:
//! - Exact hostname routing to one local backend per protocol
//! - Optional HTTP -> HTTPS redirects per host
//! - HTTPS with per-handshake certificate lookup for configured hosts only
//! - HTTP-01 challenge answering on the plaintext listener
//! - A supervisor that decides what a dead listener means for the process

pub mod certificate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod routes;

pub use certificate::{AcmeSettings, CertificateManager, CertificateSource};
pub use config::{load_routes, FailurePolicy, NotFoundMode, ProxyConfig, RouteRecord};
pub use dispatch::Dispatcher;
pub use error::ProxyError;
pub use proxy::ProxyServer;
pub use routes::{BackendTarget, DispatchEntry, Protocol, RouteTable, RouteTables};
