//! Certificate manager for SSL/TLS certificate handling
//!
//! Certificates are only ever handed out for hostnames in the route list.
//! Each one is cached on disk under the certs directory and memoised in memory
//! after first use. A host without a cached certificate gets one issued on its
//! first handshake.

use crate::config::normalize_host;
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path prefix of HTTP-01 domain-validation requests
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("client did not send a server name")]
    MissingServerName,

    #[error("{0} is not a configured host")]
    NotWhitelisted(String),

    #[error("certificate authority terms of service not accepted")]
    TermsNotAccepted,

    #[error("certificate issuance failed: {0}")]
    Issue(String),

    #[error("certificate cache error: {0}")]
    Io(#[from] io::Error),
}

/// What the listeners need from certificate management
pub trait CertificateSource: Send + Sync + 'static {
    /// Certificate to present for a TLS handshake naming `server_name`.
    ///
    /// May block on disk I/O or key generation; async callers go through
    /// [`prepare_certificate`].
    fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError>;

    /// Key authorization for a pending HTTP-01 challenge token
    fn challenge_response(&self, token: &str) -> Option<String>;
}

/// Token part of a challenge request path, if `path` is one
pub fn challenge_token(path: &str) -> Option<&str> {
    path.strip_prefix(CHALLENGE_PREFIX)
}

/// Account settings passed through to the certificate authority
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub email: Option<String>,
    pub accept_tos: bool,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            email: None,
            accept_tos: true,
        }
    }
}

/// Certificate manager for handling SSL certificates
pub struct CertificateManager {
    certs_dir: PathBuf,
    whitelist: HashSet<String>,
    settings: AcmeSettings,
    certified: DashMap<String, Arc<CertifiedKey>>,
    challenges: DashMap<String, String>,
    issue_lock: Mutex<()>,
}

impl CertificateManager {
    /// Create a manager that serves `whitelist` from the cache at `certs_dir`
    pub fn new<P: AsRef<Path>>(
        certs_dir: P,
        whitelist: &[String],
        settings: AcmeSettings,
    ) -> Result<Self, CertificateError> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        if !settings.accept_tos {
            warn!("Terms of service not accepted; certificates will only come from the cache");
        }

        Ok(Self {
            certs_dir,
            whitelist: whitelist.iter().map(|h| normalize_host(h)).collect(),
            settings,
            certified: DashMap::new(),
            challenges: DashMap::new(),
            issue_lock: Mutex::new(()),
        })
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
                '*' => 'W',
                _ => '_',
            })
            .collect()
    }

    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let name = Self::sanitize_domain(domain);
        (
            self.certs_dir.join(format!("{}.crt", name)),
            self.certs_dir.join(format!("{}.key", name)),
        )
    }

    /// Load a cached certificate from disk, if one exists
    fn load_cached(&self, domain: &str) -> Result<Option<CertifiedKey>, CertificateError> {
        let (cert_path, key_path) = self.cert_paths(domain);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read(&cert_path)?;
        let key_pem = fs::read(&key_path)?;
        let key = certified_key_from_pem(&cert_pem, &key_pem)?;

        debug!(domain, path = %cert_path.display(), "Loaded cached certificate");
        Ok(Some(key))
    }

    /// Issue a new certificate for `domain` and write it to the cache
    pub fn issue(&self, domain: &str) -> Result<CertifiedKey, CertificateError> {
        if !self.settings.accept_tos {
            return Err(CertificateError::TermsNotAccepted);
        }

        let cert = generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| CertificateError::Issue(e.to_string()))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| CertificateError::Issue(e.to_string()))?;
        let key_pem = cert.serialize_private_key_pem();

        self.save(domain, &cert_pem, &key_pem)?;
        info!(
            domain,
            contact = self.settings.email.as_deref().unwrap_or("none"),
            "Issued certificate"
        );

        certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }

    /// Save certificate to cache, private key with restricted permissions
    fn save(&self, domain: &str, cert_pem: &str, key_pem: &str) -> Result<(), CertificateError> {
        let (cert_path, key_path) = self.cert_paths(domain);
        fs::write(&cert_path, cert_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            io::Write::write_all(&mut file, key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&key_path, key_pem)?;
        }

        Ok(())
    }

    /// Store ACME challenge token
    pub fn store_challenge(&self, token: &str, key_authorization: &str) {
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove ACME challenge
    pub fn remove_challenge(&self, token: &str) {
        self.challenges.remove(token);
    }

    /// Get certs directory path
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }
}

impl CertificateSource for CertificateManager {
    fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let name = normalize_host(server_name);
        if !self.whitelist.contains(&name) {
            return Err(CertificateError::NotWhitelisted(name));
        }

        if let Some(key) = self.certified.get(&name) {
            return Ok(Arc::clone(key.value()));
        }

        // One issuance at a time; a racing handshake finds the result below.
        let _guard = self.issue_lock.lock();
        if let Some(key) = self.certified.get(&name) {
            return Ok(Arc::clone(key.value()));
        }

        let key = match self.load_cached(&name)? {
            Some(key) => key,
            None => self.issue(&name)?,
        };
        let key = Arc::new(key);
        self.certified.insert(name, Arc::clone(&key));
        Ok(key)
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|c| c.value().clone())
    }
}

/// Parse a PEM chain and private key into a rustls signing identity
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, CertificateError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(CertificateError::Issue("no certificate in PEM data".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))?
        .ok_or_else(|| CertificateError::Issue("no private key in PEM data".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertificateError::Issue(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// rustls hook that asks a [`CertificateSource`] per handshake
pub struct CertResolver {
    source: Arc<dyn CertificateSource>,
}

impl CertResolver {
    pub fn new(source: Arc<dyn CertificateSource>) -> Self {
        Self { source }
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let result = match client_hello.server_name() {
            Some(name) => self.source.certificate_for(name),
            None => Err(CertificateError::MissingServerName),
        };

        match result {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(server_name = ?client_hello.server_name(), error = %e, "No certificate for handshake");
                None
            }
        }
    }
}

/// Load or issue the certificate for `server_name` on the blocking pool.
///
/// Run before the handshake continues, so that the resolver only ever finds
/// a memoised key and never does disk I/O or key generation on a runtime
/// worker.
pub async fn prepare_certificate(
    source: Arc<dyn CertificateSource>,
    server_name: String,
) -> Result<(), CertificateError> {
    tokio::task::spawn_blocking(move || source.certificate_for(&server_name).map(|_| ()))
        .await
        .map_err(|e| CertificateError::Issue(format!("certificate task failed: {}", e)))?
}

/// TLS server configuration backed by `source`, HTTP/1.1 only
pub fn server_config(source: Arc<dyn CertificateSource>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver::new(source)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}
