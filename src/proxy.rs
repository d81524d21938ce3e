//! Proxy server implementation
//! Runs the plaintext and TLS listeners side by side and supervises them

use crate::certificate::{challenge_token, prepare_certificate, server_config, CertificateSource};
use crate::config::{FailurePolicy, ProxyConfig};
use crate::dispatch::{text_response, Dispatcher, ProxyBody};
use crate::error::{ProxyError, Result};
use crate::routes::{Protocol, RouteTables};
use anyhow::anyhow;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

const LISTENERS: [Protocol; 2] = [Protocol::Plaintext, Protocol::Encrypted];

/// First and longest pause after `accept` runs out of resources
const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(5);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

// errno values for a full descriptor table or exhausted kernel buffers
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Terminal error reported by one listener
#[derive(Debug)]
struct ListenerFailure {
    protocol: Protocol,
    error: ProxyError,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    plaintext: Dispatcher,
    encrypted: Dispatcher,
    certificates: Arc<dyn CertificateSource>,
    tls_config: Arc<ServerConfig>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyConfig,
        tables: RouteTables,
        certificates: Arc<dyn CertificateSource>,
    ) -> Self {
        let tls_config = Arc::new(server_config(Arc::clone(&certificates)));

        Self {
            plaintext: Dispatcher::new(tables.plaintext, &config),
            encrypted: Dispatcher::new(tables.encrypted, &config),
            config,
            certificates,
            tls_config,
        }
    }

    /// Serve until Ctrl-C or until the failure policy gives up
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves or the failure policy gives up.
    ///
    /// Both listeners report terminal errors to one collector. Under
    /// [`FailurePolicy::Shutdown`] the first failure stops the sibling and is
    /// returned; under [`FailurePolicy::KeepServing`] the survivor carries on
    /// and the last failure is returned once no listener is left.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (failure_tx, mut failure_rx) = mpsc::channel::<ListenerFailure>(LISTENERS.len());

        let mut listeners = JoinSet::new();
        for protocol in LISTENERS {
            let server = Arc::clone(&self);
            let failures = failure_tx.clone();
            let shutdown = shutdown_rx.clone();
            listeners.spawn(async move {
                if let Err(error) = server.run_listener(protocol, shutdown).await {
                    let _ = failures.send(ListenerFailure { protocol, error }).await;
                }
            });
        }
        drop(failure_tx);

        tokio::pin!(shutdown);
        let mut failed = 0;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                failure = failure_rx.recv() => {
                    let Some(ListenerFailure { protocol, error }) = failure else {
                        break Ok(());
                    };
                    error!(listener = %protocol, error = %error, "Listener stopped");
                    failed += 1;

                    let err = ProxyError::ListenerFailed { protocol, reason: error.to_string() };
                    match self.config.failure_policy {
                        FailurePolicy::Shutdown => break Err(err),
                        FailurePolicy::KeepServing if failed == LISTENERS.len() => break Err(err),
                        FailurePolicy::KeepServing => {
                            warn!(listener = %protocol, "Continuing with the remaining listener");
                        }
                    }
                }
            }
        };

        let _ = shutdown_tx.send(true);
        while listeners.join_next().await.is_some() {}

        outcome
    }

    /// Accept loop for one listener. Returns `Ok` only on shutdown.
    async fn run_listener(
        self: Arc<Self>,
        protocol: Protocol,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let addr = match protocol {
            Protocol::Plaintext => self.config.http_addr,
            Protocol::Encrypted => self.config.https_addr,
        };
        let listener = TcpListener::bind(addr).await.map_err(|source| ProxyError::Bind {
            protocol,
            addr: addr.to_string(),
            source,
        })?;
        info!(listener = %protocol, addr = %addr, "Listening");

        let mut retry_delay = None;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => {
                            retry_delay = None;
                            conn
                        }
                        Err(e) if is_connection_error(&e) => {
                            debug!(listener = %protocol, error = %e, "Accept error");
                            continue;
                        }
                        Err(e) if is_resource_exhaustion(&e) => {
                            let delay = next_accept_delay(retry_delay);
                            retry_delay = Some(delay);
                            warn!(
                                listener = %protocol,
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Accept failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(source) => return Err(ProxyError::Accept { protocol, source }),
                    };

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let result = match protocol {
                            Protocol::Plaintext => server.serve_connection(stream, remote_addr, protocol).await,
                            Protocol::Encrypted => server.serve_tls(stream, remote_addr).await,
                        };
                        if let Err(e) = result {
                            debug!("{} connection error from {}: {:#}", protocol, remote_addr, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!(listener = %protocol, "Listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Terminate TLS, then serve HTTP on the decrypted stream
    async fn serve_tls(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> anyhow::Result<()> {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
            let server_name = start.client_hello().server_name().map(str::to_owned);
            if let Some(name) = server_name {
                prepare_certificate(Arc::clone(&self.certificates), name).await?;
            }
            let tls_stream = start.into_stream(Arc::clone(&self.tls_config)).await?;
            Ok::<_, anyhow::Error>(tls_stream)
        };
        let tls_stream = match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(e.context("TLS handshake failed")),
            Err(_) => return Err(anyhow!("TLS handshake timed out")),
        };

        debug!(
            remote = %remote_addr,
            server_name = ?tls_stream.get_ref().1.server_name(),
            "TLS handshake complete"
        );
        self.serve_connection(tls_stream, remote_addr, Protocol::Encrypted).await
    }

    /// Handle a single HTTP connection
    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        protocol: Protocol,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = Arc::clone(&self);
                    async move { Ok::<_, Infallible>(server.handle_request(req, remote_addr, protocol).await) }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        protocol: Protocol,
    ) -> Response<ProxyBody> {
        match protocol {
            Protocol::Plaintext => {
                if let Some(token) = challenge_token(req.uri().path()) {
                    return match self.certificates.challenge_response(token) {
                        Some(key_auth) => text_response(StatusCode::OK, &key_auth),
                        None => text_response(StatusCode::NOT_FOUND, "Challenge not found"),
                    };
                }
                self.plaintext.handle(req, remote_addr).await
            }
            Protocol::Encrypted => self.encrypted.handle(req, remote_addr).await,
        }
    }
}

/// Errors that concern one incoming connection, not the listening socket
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

/// Errors that clear up once load drops: out of descriptors or buffers
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
        || matches!(e.raw_os_error(), Some(EMFILE | ENFILE | ENOBUFS | ENOMEM))
}

/// Doubling pause between failed accepts, capped at [`ACCEPT_RETRY_MAX`]
fn next_accept_delay(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_RETRY_MIN,
        Some(d) => (d * 2).min(ACCEPT_RETRY_MAX),
    }
}
