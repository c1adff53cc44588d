use crate::error::Result;
use crate::tls::build_client_config;
use http::Uri;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_service::Service;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 上游连接配置
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// 每个后端保留的最大空闲连接数
    pub max_idle_per_host: usize,
    /// 空闲连接回收时间
    pub idle_timeout: Duration,
    /// TCP 建连超时
    pub connect_timeout: Duration,
    /// TLS 握手超时（在建连之后计时）
    pub tls_handshake_timeout: Duration,
    /// TCP keepalive 间隔
    pub keepalive: Duration,
    /// 单个请求（含等待响应头）的截止时间，超时按客户端中止处理
    pub request_timeout: Option<Duration>,
    /// 跳过后端证书验证
    pub skip_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 512,
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            request_timeout: None,
            skip_verify: false,
        }
    }
}

/// 建连（含 TLS 握手）超时
#[derive(Debug, thiserror::Error)]
#[error("upstream connect timed out after {0:?}")]
pub struct ConnectTimeout(pub Duration);

/// 为内部连接器的整个建连过程加上超时
#[derive(Debug, Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<C::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);

        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(ConnectTimeout(timeout)) as BoxError),
            }
        })
    }
}

pub type UpstreamConnector = TimeoutConnector<HttpsConnector<HttpConnector>>;

/// 所有请求共享的上游客户端
pub type UpstreamClient = Client<UpstreamConnector, Incoming>;

/// 创建共享的上游客户端
///
/// 同时支持 http/https 后端；TLS 后端优先通过 ALPN 协商 HTTP/2。
/// 不做透明压缩，响应体原样转发。
pub fn build_upstream_client(config: &UpstreamConfig) -> Result<UpstreamClient> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(config.connect_timeout));
    http.set_keepalive(Some(config.keepalive));

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(build_client_config(config.skip_verify)?)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    let connector = TimeoutConnector::new(
        https,
        config.connect_timeout + config.tls_handshake_timeout,
    );

    debug!(
        "Upstream client: max_idle_per_host={}, idle_timeout={:?}, connect_timeout={:?}",
        config.max_idle_per_host, config.idle_timeout, config.connect_timeout
    );

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.idle_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_timer(TokioTimer::new())
        .build(connector))
}
