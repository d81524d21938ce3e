//! Request dispatch
//! Decides per request whether to redirect, reject, answer not-found or proxy,
//! then carries that decision out against the backend.

use crate::config::{strip_port, NotFoundMode, ProxyConfig};
use crate::routes::{BackendTarget, Protocol, RouteTable};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{debug, error, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe one hop and must not be forwarded
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Outcome of routing a request
#[derive(Debug, PartialEq, Eq)]
pub enum Action<'a> {
    /// No authority and no Host header
    MissingHost,
    /// Host has no route on this listener
    NotFound,
    /// Upgrade route, but the method can't be redirected safely
    RejectMethod,
    /// Upgrade route: send the client to this HTTPS URL
    Redirect(String),
    /// Proxy to the backend
    Forward(&'a BackendTarget),
}

#[derive(Serialize)]
struct ErrorPage<'a> {
    error: &'a str,
    note: String,
}

/// Per-listener request handler over an immutable route table
pub struct Dispatcher {
    table: RouteTable,
    not_found: NotFoundMode,
    redirect_port: u16,
    client: Client<HttpConnector, Incoming>,
}

impl Dispatcher {
    pub fn new(table: RouteTable, config: &ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        Self {
            table,
            not_found: config.not_found,
            redirect_port: config.redirect_port,
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.table.protocol()
    }

    /// Route a request without touching the network
    pub fn decide<'a>(&'a self, method: &Method, host: Option<&str>, uri: &Uri) -> Action<'a> {
        let Some(host) = host else {
            return Action::MissingHost;
        };

        let entry = match self.table.lookup(host) {
            Some(entry) => entry,
            None => return Action::NotFound,
        };

        if entry.upgrade && self.protocol() == Protocol::Plaintext {
            if method != Method::GET && method != Method::HEAD {
                return Action::RejectMethod;
            }
            return Action::Redirect(redirect_target(host, self.redirect_port, uri));
        }

        Action::Forward(&entry.backend)
    }

    /// Handle one request; failures become error responses
    pub async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let host = request_host(&req);

        match self.decide(req.method(), host.as_deref(), req.uri()) {
            Action::MissingHost => text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
            Action::NotFound => {
                debug!(protocol = %self.protocol(), host = ?host, "Unknown host");
                self.not_found_response(host.as_deref().unwrap_or_default())
            }
            Action::RejectMethod => text_response(StatusCode::BAD_REQUEST, "Use HTTPS"),
            Action::Redirect(location) => {
                debug!(location = %location, "Redirecting to HTTPS");
                redirect_response(&location)
            }
            Action::Forward(backend) => {
                let host = host.unwrap_or_default();
                self.forward(req, backend, &host, remote_addr).await
            }
        }
    }

    /// Response for a host with no route
    pub fn not_found_response(&self, host: &str) -> Response<ProxyBody> {
        match self.not_found {
            NotFoundMode::Bare => empty_response(StatusCode::NOT_FOUND),
            NotFoundMode::Informative => {
                let page = ErrorPage {
                    error: "Page Not Found",
                    note: format!("{} was not found. Please contact admin.", host),
                };
                match serde_json::to_vec(&page) {
                    Ok(body) => {
                        let mut response = Response::new(full_body(Bytes::from(body)));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        response
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize unknown host page");
                        empty_response(StatusCode::OK)
                    }
                }
            }
        }
    }

    /// Proxy the request to backend, streaming both bodies
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        backend: &BackendTarget,
        host: &str,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        parts.uri = match backend.uri_for(parts.uri.path_and_query()) {
            Ok(uri) => uri,
            Err(e) => {
                error!(backend = %backend, error = %e, "Invalid backend URI");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        parts.version = Version::HTTP_11;

        remove_hop_headers(&mut parts.headers);
        if let Some(protocol) = &upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol.clone());
        }
        self.add_forwarding_headers(&mut parts.headers, host, remote_addr);

        debug!(host, backend = %backend, method = %parts.method, path = %parts.uri.path(), "Proxying");

        let mut response = match self.client.request(Request::from_parts(parts, body)).await {
            Ok(r) => r,
            Err(e) => {
                error!(host, backend = %backend, error = %e, "Backend request failed");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                warn!(host, backend = %backend, "Backend switched protocols without being asked");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            };
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_upgrade, backend_upgrade, host.to_string()));

            let (parts, _) = response.into_parts();
            return Response::from_parts(parts, empty_body());
        }

        remove_hop_headers(response.headers_mut());
        response.map(|body| body.boxed())
    }

    fn add_forwarding_headers(&self, headers: &mut HeaderMap, host: &str, remote_addr: SocketAddr) {
        let client_ip = remote_addr.ip().to_string();
        let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if let Ok(value) = HeaderValue::from_str(host) {
            if !headers.contains_key(HOST) {
                headers.insert(HOST, value.clone());
            }
            headers.insert(X_FORWARDED_HOST, value);
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(self.protocol().scheme()),
        );
    }
}

/// Host the client asked for: the URI authority if absolute-form, else the Host header
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().to_string())
}

/// `https://<host without port>:<port><path and query>`
pub fn redirect_target(host: &str, port: u16, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}:{}{}", strip_port(host), port, path)
}

/// Value of the Upgrade header if the client asked to switch protocols
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Strip hop-by-hop headers, including any the Connection header names
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Copy bytes both ways between an upgraded client and backend
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, host: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(host = %host, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => debug!(host = %host, up, down, "Upgraded connection closed"),
        Err(e) => debug!(host = %host, error = %e, "Upgraded connection error"),
    }
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create redirect response
fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = empty_response(StatusCode::FOUND);
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid Host header"),
    }
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Create full body
fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
