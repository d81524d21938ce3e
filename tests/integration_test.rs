//! Integration tests for HostProxy
//!
//! Runs the full listener pair on loopback ports and checks:
//! - Plaintext and TLS proxying to the per-protocol backend
//! - HTTPS redirects and method rejection for upgrade routes
//! - Unknown host responses in both modes
//! - HTTP-01 challenge answering
//! - Upgrade tunnelling
//! - Listener failure policies and shutdown

use bytes::Bytes;
use http_body_util::Empty;
use hostproxy::{
    AcmeSettings, CertificateManager, FailurePolicy, NotFoundMode, Protocol, ProxyConfig,
    ProxyError, ProxyServer, RouteRecord, RouteTables,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(24000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn port_of(server: &MockServer) -> String {
    format!(":{}", server.address().port())
}

struct TestProxy {
    http_port: u16,
    https_port: u16,
    certs: Arc<CertificateManager>,
    handle: JoinHandle<Result<(), ProxyError>>,
    dir: TempDir,
}

impl TestProxy {
    fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.http_port, path)
    }
}

fn test_config(http_port: u16, https_port: u16) -> ProxyConfig {
    ProxyConfig {
        http_addr: SocketAddr::from(([127, 0, 0, 1], http_port)),
        https_addr: SocketAddr::from(([127, 0, 0, 1], https_port)),
        handshake_timeout: Duration::from_secs(2),
        ..ProxyConfig::default()
    }
}

fn build_server(routes: &[RouteRecord], config: ProxyConfig, dir: &TempDir) -> (Arc<ProxyServer>, Arc<CertificateManager>) {
    let tables = RouteTables::build(routes).unwrap();
    let certs = Arc::new(
        CertificateManager::new(dir.path().join("certs"), &tables.whitelist, AcmeSettings::default())
            .unwrap(),
    );
    let server = Arc::new(ProxyServer::new(config, tables, certs.clone()));
    (server, certs)
}

/// Start a proxy for `routes` and wait for it to bind
async fn start_proxy(routes: Vec<RouteRecord>, not_found: NotFoundMode) -> TestProxy {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();

    let config = ProxyConfig {
        not_found,
        ..test_config(http_port, https_port)
    };
    let (server, certs) = build_server(&routes, config, &dir);
    let handle = tokio::spawn(server.run_until(std::future::pending()));

    // Wait for listeners to start
    sleep(Duration::from_millis(100)).await;

    TestProxy {
        http_port,
        https_port,
        certs,
        handle,
        dir,
    }
}

fn plain_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// TLS client that sends SNI `host` but connects to the proxy's loopback port
fn tls_client(host: &str, https_port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve(host, SocketAddr::from(([127, 0, 0, 1], https_port)))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_plaintext_proxy_forwards_request() {
    let plain = MockServer::start().await;
    let secure = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(header("x-custom", "kept"))
        .and(header("host", "b.example"))
        .respond_with(ResponseTemplate::new(200).set_body_string("PLAIN_BACKEND"))
        .mount(&plain)
        .await;

    let proxy = start_proxy(
        vec![RouteRecord::new("b.example", &port_of(&plain), &port_of(&secure), false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .get(proxy.http_url("/search?q=rust"))
        .header("Host", "b.example")
        .header("X-Custom", "kept")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "PLAIN_BACKEND");
}

#[tokio::test]
async fn test_plaintext_proxy_post_body() {
    let plain = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/data"))
        .and(body_string("test body content"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&plain)
        .await;

    let proxy = start_proxy(
        vec![RouteRecord::new("b.example", &port_of(&plain), ":1", false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .post(proxy.http_url("/api/data"))
        .header("Host", "b.example")
        .body("test body content")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.text().await.unwrap(), "created");
}

#[tokio::test]
async fn test_forwarding_headers() {
    let plain = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("x-forwarded-for", "127.0.0.1"))
        .and(header("x-forwarded-proto", "http"))
        .and(header("x-forwarded-host", "b.example"))
        .respond_with(ResponseTemplate::new(200).set_body_string("HEADERS_OK"))
        .mount(&plain)
        .await;

    let proxy = start_proxy(
        vec![RouteRecord::new("b.example", &port_of(&plain), ":1", false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .get(proxy.http_url("/"))
        .header("Host", "b.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "HEADERS_OK");
}

#[tokio::test]
async fn test_upgrade_route_redirects_get_and_head() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", true)],
        NotFoundMode::Informative,
    )
    .await;
    let client = plain_client();

    let response = client
        .get(proxy.http_url("/"))
        .header("Host", "a.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(response.headers()["location"], "https://a.example:443/");

    let response = client
        .head(proxy.http_url("/docs?page=2"))
        .header("Host", "a.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(response.headers()["location"], "https://a.example:443/docs?page=2");
}

#[tokio::test]
async fn test_upgrade_route_rejects_post() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", true)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .post(proxy.http_url("/form"))
        .header("Host", "a.example")
        .body("x=1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(response.text().await.unwrap(), "Use HTTPS");
}

#[tokio::test]
async fn test_unknown_host_informative() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .get(proxy.http_url("/anything"))
        .header("Host", "unknown.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["error"], "Page Not Found");
    assert_eq!(body["note"], "unknown.example was not found. Please contact admin.");
}

#[tokio::test]
async fn test_unknown_host_bare() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Bare,
    )
    .await;

    let response = plain_client()
        .get(proxy.http_url("/anything"))
        .header("Host", "unknown.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_host_400() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Informative,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_port)).await.unwrap();
    stream.write_all(b"GET /test HTTP/1.1\r\n\r\n").await.unwrap();

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await.unwrap();
    let response_str = String::from_utf8_lossy(&response[..n]);

    assert!(response_str.starts_with("HTTP/1.1 400"));
    assert!(response_str.contains("Missing Host header"));
}

#[tokio::test]
async fn test_empty_host_gets_not_found() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Bare,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_port)).await.unwrap();
    stream.write_all(b"GET /test HTTP/1.1\r\nHost:\r\n\r\n").await.unwrap();

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await.unwrap();
    let response_str = String::from_utf8_lossy(&response[..n]);

    assert!(response_str.starts_with("HTTP/1.1 404"));
    assert!(!response_str.contains("Missing Host header"));
}

#[tokio::test]
async fn test_backend_unreachable_502() {
    let backend_port = get_unique_port(); // No server running on this port
    let proxy = start_proxy(
        vec![RouteRecord::new("b.example", &format!(":{}", backend_port), ":1", false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = plain_client()
        .get(proxy.http_url("/test"))
        .header("Host", "b.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert!(!proxy.handle.is_finished());
}

#[tokio::test]
async fn test_acme_challenge_answered_before_dispatch() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", true)],
        NotFoundMode::Informative,
    )
    .await;
    proxy.certs.store_challenge("tok123", "tok123.thumbprint");
    let client = plain_client();

    // An upgrade host would otherwise be redirected.
    let response = client
        .get(proxy.http_url("/.well-known/acme-challenge/tok123"))
        .header("Host", "a.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "tok123.thumbprint");

    let response = client
        .get(proxy.http_url("/.well-known/acme-challenge/unknown"))
        .header("Host", "a.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_https_proxies_to_secure_backend() {
    let plain = MockServer::start().await;
    let secure = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("x-forwarded-proto", "https"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SECURE_BACKEND"))
        .mount(&secure)
        .await;

    // force_upgrade must not affect the encrypted listener
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", &port_of(&plain), &port_of(&secure), true)],
        NotFoundMode::Informative,
    )
    .await;

    let response = tls_client("a.example", proxy.https_port)
        .get(format!("https://a.example:{}/", proxy.https_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "SECURE_BACKEND");
    assert!(proxy.dir.path().join("certs").join("a.example.crt").exists());
}

#[tokio::test]
async fn test_https_unknown_host_header() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Informative,
    )
    .await;

    let response = tls_client("a.example", proxy.https_port)
        .get(format!("https://a.example:{}/", proxy.https_port))
        .header("Host", "unknown.example")
        .send()
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    assert!(body.contains("unknown.example was not found. Please contact admin."));
}

#[tokio::test]
async fn test_https_refuses_unlisted_server_name() {
    let proxy = start_proxy(
        vec![RouteRecord::new("a.example", ":9001", ":9002", false)],
        NotFoundMode::Informative,
    )
    .await;

    let result = tls_client("evil.example", proxy.https_port)
        .get(format!("https://evil.example:{}/", proxy.https_port))
        .send()
        .await;

    assert!(result.is_err());
    assert!(!proxy.dir.path().join("certs").join("evil.example.crt").exists());
}

#[tokio::test]
async fn test_concurrent_hosts_do_not_block() {
    let slow = MockServer::start().await;
    let fast = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(1000)),
        )
        .mount(&slow)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
        .mount(&fast)
        .await;

    let proxy = start_proxy(
        vec![
            RouteRecord::new("slow.example", &port_of(&slow), ":1", false),
            RouteRecord::new("fast.example", &port_of(&fast), ":1", false),
        ],
        NotFoundMode::Informative,
    )
    .await;
    let client = plain_client();
    let started = Instant::now();

    let slow_request = async {
        let response = client
            .get(proxy.http_url("/"))
            .header("Host", "slow.example")
            .send()
            .await
            .unwrap();
        response.text().await.unwrap()
    };
    let fast_request = async {
        sleep(Duration::from_millis(50)).await;
        let response = client
            .get(proxy.http_url("/"))
            .header("Host", "fast.example")
            .send()
            .await
            .unwrap();
        (response.text().await.unwrap(), started.elapsed())
    };

    let (slow_body, (fast_body, fast_elapsed)) = tokio::join!(slow_request, fast_request);

    assert_eq!(slow_body, "slow");
    assert_eq!(fast_body, "fast");
    assert!(fast_elapsed < Duration::from_millis(800), "fast request took {:?}", fast_elapsed);
}

/// Backend that accepts any upgrade and echoes bytes back
async fn run_echo_upgrade_backend(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();

            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        if let Ok(upgraded) = on_upgrade.await {
                            let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        }
                    });

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(101)
                            .header("connection", "upgrade")
                            .header("upgrade", "echo")
                            .body(Empty::<Bytes>::new())
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
}

#[tokio::test]
async fn test_upgrade_tunnel() {
    let backend_port = get_unique_port();
    run_echo_upgrade_backend(backend_port).await;

    let proxy = start_proxy(
        vec![RouteRecord::new("b.example", &format!(":{}", backend_port), ":1", false)],
        NotFoundMode::Informative,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_port)).await.unwrap();
    stream
        .write_all(b"GET /chat HTTP/1.1\r\nHost: b.example\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    timeout(Duration::from_secs(5), async {
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
    })
    .await
    .unwrap();
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_listener_failure_shuts_down_sibling() {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", http_port)).unwrap();

    let routes = vec![RouteRecord::new("a.example", ":9001", ":9002", false)];
    let (server, _) = build_server(&routes, test_config(http_port, https_port), &dir);

    let result = timeout(Duration::from_secs(5), server.run_until(std::future::pending()))
        .await
        .expect("supervisor should stop after a listener failure");

    match result {
        Err(ProxyError::ListenerFailed { protocol, reason }) => {
            assert_eq!(protocol, Protocol::Plaintext);
            assert!(reason.contains("bind"), "unexpected reason: {}", reason);
        }
        other => panic!("expected listener failure, got {:?}", other),
    }

    // The TLS listener was stopped and its port released.
    assert!(TcpStream::connect(("127.0.0.1", https_port)).await.is_err());
}

#[tokio::test]
async fn test_keep_serving_after_listener_failure() {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", http_port)).unwrap();

    let routes = vec![RouteRecord::new("a.example", ":9001", ":9002", false)];
    let config = ProxyConfig {
        failure_policy: FailurePolicy::KeepServing,
        ..test_config(http_port, https_port)
    };
    let (server, _) = build_server(&routes, config, &dir);
    let handle = tokio::spawn(server.run_until(std::future::pending()));

    sleep(Duration::from_millis(300)).await;

    assert!(!handle.is_finished());
    assert!(TcpStream::connect(("127.0.0.1", https_port)).await.is_ok());
    handle.abort();
}

#[tokio::test]
async fn test_keep_serving_stops_when_all_listeners_fail() {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();
    let _http_blocker = std::net::TcpListener::bind(("127.0.0.1", http_port)).unwrap();
    let _https_blocker = std::net::TcpListener::bind(("127.0.0.1", https_port)).unwrap();

    let routes = vec![RouteRecord::new("a.example", ":9001", ":9002", false)];
    let config = ProxyConfig {
        failure_policy: FailurePolicy::KeepServing,
        ..test_config(http_port, https_port)
    };
    let (server, _) = build_server(&routes, config, &dir);

    let result = timeout(Duration::from_secs(5), server.run_until(std::future::pending()))
        .await
        .expect("supervisor should stop once no listener is left");

    assert!(matches!(result, Err(ProxyError::ListenerFailed { .. })));
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let dir = tempdir().unwrap();
    let http_port = get_unique_port();
    let https_port = get_unique_port();

    let routes = vec![RouteRecord::new("a.example", ":9001", ":9002", false)];
    let (server, _) = build_server(&routes, test_config(http_port, https_port), &dir);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", http_port)).await.is_ok());

    tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}
