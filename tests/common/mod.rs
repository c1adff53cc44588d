//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use sni_gate::cert::{Issuer, SelfSignedIssuer};
use sni_gate::config::ProxyConfig;
use sni_gate::store::{BackendRecord, MemoryStore, ProxyRecord, StoredCertificate};
use sni_gate::{
    ConfigStore, ProxyDependencies, ProxyError, ProxyServer, ProxyState, Result, TargetConfig,
    TlsCertificate,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Find an available port
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Unique temporary directory, removed on drop
pub struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}-{}-{:016x}",
            prefix,
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&path).expect("Failed to create temp dir");
        Self { path }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Proxy record with plain http backends on 127.0.0.1
pub fn proxy_record(name: &str, hosts: &[&str], ports: &[u16]) -> ProxyRecord {
    ProxyRecord {
        name: name.to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        force_https: false,
        headers: HashMap::new(),
        backends: ports
            .iter()
            .map(|p| BackendRecord::new("http", "127.0.0.1", *p))
            .collect(),
    }
}

/// Configuration store wrapper that counts calls and can inject failures
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub route_lookups: AtomicUsize,
    pub cert_lookups: AtomicUsize,
    pub cert_saves: AtomicUsize,
    pub fail_routes: AtomicBool,
    pub fail_saves: AtomicBool,
    /// Delay applied to every certificate lookup, in milliseconds
    pub cert_delay_ms: AtomicU64,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_proxy(proxy: ProxyRecord) -> Arc<Self> {
        let store = Self::default();
        store.inner.upsert_proxy(proxy);
        Arc::new(store)
    }

    pub fn route_lookups(&self) -> usize {
        self.route_lookups.load(Ordering::SeqCst)
    }

    pub fn cert_lookups(&self) -> usize {
        self.cert_lookups.load(Ordering::SeqCst)
    }

    pub fn cert_saves(&self) -> usize {
        self.cert_saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for CountingStore {
    async fn lookup_route(&self, host: &str) -> Result<Option<TargetConfig>> {
        self.route_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_routes.load(Ordering::SeqCst) {
            return Err(ProxyError::store("database unavailable"));
        }
        self.inner.lookup_route(host).await
    }

    async fn lookup_certificate(&self, host: &str) -> Result<Option<StoredCertificate>> {
        self.cert_lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.cert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.lookup_certificate(host).await
    }

    async fn save_certificate(&self, host: &str, cert: &TlsCertificate) -> Result<()> {
        self.cert_saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ProxyError::store("read-only store"));
        }
        self.inner.save_certificate(host, cert).await
    }
}

/// Issuer wrapper that counts calls, with optional delay and failure
pub struct CountingIssuer {
    inner: SelfSignedIssuer,
    pub issued: AtomicUsize,
    pub delay: Duration,
    pub fail: AtomicBool,
}

impl CountingIssuer {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: SelfSignedIssuer::new(Duration::from_secs(24 * 3600)),
            issued: AtomicUsize::new(0),
            delay,
            fail: AtomicBool::new(false),
        })
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Issuer for CountingIssuer {
    async fn issue(&self, server_name: &str) -> Result<TlsCertificate> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProxyError::issuance("rate limited by CA"));
        }
        self.inner.issue(server_name).await
    }
}

/// HTTP backend that echoes request headers in its body as `name: value` lines
///
/// The first line is `<port> <method> <path>`.
pub async fn start_header_echo_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo backend");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let port = addr.port();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let mut body = format!(
                        "{} {} {}\n",
                        port,
                        req.method(),
                        req.uri()
                            .path_and_query()
                            .map(|pq| pq.as_str())
                            .unwrap_or("/")
                    );
                    for (name, value) in req.headers() {
                        body.push_str(&format!(
                            "{}: {}\n",
                            name,
                            value.to_str().unwrap_or("<binary>")
                        ));
                    }
                    let response = Response::builder()
                        .header("x-backend-port", port.to_string())
                        .header("connection", "keep-alive")
                        .header("keep-alive", "timeout=5")
                        .body(Full::new(Bytes::from(body)))
                        .expect("valid response");
                    Ok::<_, Infallible>(response)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, handle)
}

/// Backend that accepts connections and never answers
pub async fn start_stalled_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stalled backend");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    (addr, handle)
}

/// Proxy configuration bound to ephemeral loopback ports, trusting loopback peers
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.http_addr = "127.0.0.1:0".to_string();
    config.server.https_addr = "127.0.0.1:0".to_string();
    config.server.listeners = 2;
    config.server.handshake_timeout_secs = 5;
    config.trust.networks = vec!["127.0.0.0/8".to_string()];
    config.upstream.connect_timeout_ms = 500;
    config.upstream.tls_handshake_timeout_ms = 500;
    config
}

/// Running proxy for tests
pub struct TestProxy {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub state: Arc<ProxyState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestProxy {
    pub async fn start(
        config: ProxyConfig,
        store: Arc<dyn ConfigStore>,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        let state = Arc::new(
            ProxyState::with_dependencies(config, ProxyDependencies::new(store, issuer))
                .expect("Failed to build proxy state"),
        );
        let server = ProxyServer::bind(Arc::clone(&state)).expect("Failed to bind proxy");
        let http_addr = server.http_addr().expect("http listener");
        let https_addr = server.https_addr().expect("https listener");

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        Self {
            http_addr,
            https_addr,
            state,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

/// Simplified response for assertions
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: String,
}

impl TestResponse {
    /// Value of an echoed request header (`name: value` line) in the body
    pub fn echoed(&self, name: &str) -> Option<String> {
        let prefix = format!("{}: ", name.to_ascii_lowercase());
        self.body
            .lines()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(str::to_string)
    }

    /// Port of the backend that answered
    pub fn backend_port(&self) -> Option<u16> {
        self.headers
            .get("x-backend-port")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

async fn send_over<S>(stream: S, request: Request<Empty<Bytes>>) -> std::result::Result<TestResponse, String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake failed: {}", e))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("request failed: {}", e))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("body failed: {}", e))?
        .to_bytes();

    Ok(TestResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn build_request(host: &str, path: &str, headers: &[(&str, &str)]) -> Request<Empty<Bytes>> {
    let mut builder = Request::builder().uri(path).header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Empty::new()).expect("valid request")
}

/// Plain HTTP/1.1 request through the proxy
pub async fn http_get(
    addr: SocketAddr,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> std::result::Result<TestResponse, String> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect failed: {}", e))?;
    tokio::time::timeout(
        Duration::from_secs(10),
        send_over(stream, build_request(host, path, headers)),
    )
    .await
    .map_err(|_| "timeout".to_string())?
}

/// HTTPS request through the proxy using `server_name` as SNI; certificate is not verified
pub async fn https_get(
    addr: SocketAddr,
    server_name: &str,
    path: &str,
) -> std::result::Result<TestResponse, String> {
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    let config = sni_gate::tls::build_client_config(true).map_err(|e| e.to_string())?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| e.to_string())?;

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect failed: {}", e))?;
    let tls = connector
        .connect(name, stream)
        .await
        .map_err(|e| format!("tls failed: {}", e))?;

    tokio::time::timeout(
        Duration::from_secs(10),
        send_over(tls, build_request(server_name, path, &[])),
    )
    .await
    .map_err(|_| "timeout".to_string())?
}
