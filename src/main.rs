//! HostProxy - Main entry point
//!
//! A host-routed HTTP/HTTPS reverse proxy front door

use anyhow::{Context, Result};
use clap::Parser;
use hostproxy::{
    load_routes, AcmeSettings, CertificateManager, FailurePolicy, NotFoundMode, ProxyConfig,
    ProxyServer, RouteTables,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// HostProxy - A host-routed HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "hostproxy")]
#[command(author = "HostProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A host-routed HTTP/HTTPS reverse proxy")]
struct Args {
    /// Address for the plaintext listener
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// Address for the TLS listener
    #[arg(long, env = "HTTPS_ADDR", default_value = "0.0.0.0:443")]
    https_addr: SocketAddr,

    /// Route list (JSON array of {URL, http, https, upgrade})
    #[arg(long, env = "SETTINGS_PATH", default_value = "./settings.json")]
    settings: PathBuf,

    /// Certificate cache directory
    #[arg(long, env = "CERTS_DIR", default_value = "./cert")]
    certs_dir: PathBuf,

    /// Contact address registered with the certificate authority
    #[arg(long, env = "ACME_EMAIL")]
    acme_email: Option<String>,

    /// Accept the certificate authority's terms of service
    #[arg(long, env = "ACCEPT_TOS", default_value = "true", action = clap::ArgAction::Set)]
    accept_tos: bool,

    /// Response for hosts with no route
    #[arg(long, env = "NOT_FOUND", value_enum, default_value = "informative")]
    not_found: NotFoundMode,

    /// What to do when a listener stops
    #[arg(long, env = "ON_LISTENER_FAILURE", value_enum, default_value = "shutdown")]
    on_listener_failure: FailurePolicy,

    /// Port written into HTTPS redirects
    #[arg(long, env = "REDIRECT_PORT", default_value = "443")]
    redirect_port: u16,

    /// TLS handshake timeout in seconds
    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    handshake_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting HostProxy v1.0.0");

    let routes = load_routes(&args.settings)
        .with_context(|| format!("Could not load routes from {}", args.settings.display()))?;
    let tables = RouteTables::build(&routes)?;
    info!(routes = routes.len(), "Route tables built");

    let cert_manager = Arc::new(CertificateManager::new(
        &args.certs_dir,
        &tables.whitelist,
        AcmeSettings {
            email: args.acme_email,
            accept_tos: args.accept_tos,
        },
    )?);
    info!("Certificate manager initialized at: {}", cert_manager.certs_dir().display());

    let config = ProxyConfig {
        http_addr: args.http_addr,
        https_addr: args.https_addr,
        not_found: args.not_found,
        failure_policy: args.on_listener_failure,
        redirect_port: args.redirect_port,
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
    };

    let server = Arc::new(ProxyServer::new(config, tables, cert_manager));
    server.run().await?;

    info!("HostProxy stopped");
    Ok(())
}
