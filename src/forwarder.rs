use crate::cert::{Http01Challenges, ACME_CHALLENGE_PREFIX};
use crate::error::{ProxyError, Result};
use crate::route::{RoutingResolver, SelectedTarget};
use crate::trust::TrustedProxyResolver;
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 返回给客户端的响应体
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// 逐跳头，不向下一跳转发
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// 入站连接的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundScheme {
    Http,
    Https,
}

impl InboundScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// HTTP 请求转发
pub struct RequestForwarder {
    routes: Arc<RoutingResolver>,
    trust: Arc<TrustedProxyResolver>,
    client: UpstreamClient,
    request_timeout: Option<Duration>,
    challenges: Arc<Http01Challenges>,
}

impl RequestForwarder {
    pub fn new(
        routes: Arc<RoutingResolver>,
        trust: Arc<TrustedProxyResolver>,
        client: UpstreamClient,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            routes,
            trust,
            client,
            request_timeout,
            challenges: Arc::new(Http01Challenges::new()),
        }
    }

    /// 共享 ACME HTTP-01 挑战应答表
    pub fn with_challenges(mut self, challenges: Arc<Http01Challenges>) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn routes(&self) -> &Arc<RoutingResolver> {
        &self.routes
    }

    /// 处理一个入站请求
    ///
    /// 返回 `Err` 表示请求已被取消或超过截止时间：不写任何响应，由连接层直接关闭。
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        scheme: InboundScheme,
    ) -> Result<Response<ProxyBody>> {
        let host = request_host(&req).unwrap_or_default();

        if scheme == InboundScheme::Http {
            if let Some(response) = self.challenge_response(&host, req.uri()) {
                return Ok(response);
            }
        }

        let target = match self.routes.get_target(&host).await {
            Ok(target) => target,
            Err(e) if e.is_no_route() => {
                debug!("No route for host '{}'", host);
                return Ok(text_response(StatusCode::NOT_FOUND, "Service not found"));
            }
            Err(e) => {
                error!("Route lookup for '{}' failed: {}", host, e);
                return Ok(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service unavailable",
                ));
            }
        };

        if scheme == InboundScheme::Http && target.force_https {
            return Ok(redirect_to_https(&host, req.uri()));
        }

        let backend = target.backend.clone();
        let upstream_req = match self.prepare_request(req, &host, peer, scheme, &target) {
            Ok(req) => req,
            Err(e) => {
                error!("Proxy error for {} -> {}: {}", host, backend, e);
                return Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    "Destination unreachable",
                ));
            }
        };

        let sending = self.client.request(upstream_req);
        let result = match self.request_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, sending).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Request to {} for {} exceeded deadline", backend, host);
                    return Err(ProxyError::forwarding("request deadline exceeded"));
                }
            },
            None => sending.await,
        };

        match result {
            Ok(response) => {
                debug!(
                    "{} {} -> {} {}",
                    scheme.as_str(),
                    host,
                    backend,
                    response.status()
                );
                Ok(prepare_response(response))
            }
            Err(e) if is_canceled(&e) => {
                debug!("Request to {} for {} canceled", backend, host);
                Err(ProxyError::forwarding("request canceled"))
            }
            Err(e) => {
                error!("Proxy error for {} -> {}: {}", host, backend, error_chain(&e));
                Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    "Destination unreachable",
                ))
            }
        }
    }

    /// ACME HTTP-01 验证请求在路由之前应答
    fn challenge_response(&self, host: &str, uri: &Uri) -> Option<Response<ProxyBody>> {
        if !uri.path().starts_with(ACME_CHALLENGE_PREFIX) {
            return None;
        }

        let response = match self.challenges.response_for_path(uri.path()) {
            Some(key_authorization) => {
                debug!("Answering http-01 challenge for '{}'", host);
                let mut response = Response::new(owned(key_authorization));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                );
                response
            }
            None => text_response(StatusCode::NOT_FOUND, "Challenge not found"),
        };
        Some(response)
    }

    /// 改写为发往后端的请求
    fn prepare_request(
        &self,
        req: Request<Incoming>,
        host: &str,
        peer: SocketAddr,
        scheme: InboundScheme,
        target: &SelectedTarget,
    ) -> Result<Request<Incoming>> {
        let (mut parts, body) = req.into_parts();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!(
            "{}://{}{}",
            target.backend.scheme,
            target.backend.authority(),
            path
        )
        .parse::<Uri>()
        .map_err(|e| ProxyError::forwarding(format!("invalid upstream uri: {}", e)))?;
        // 连接层按协商结果决定实际使用 HTTP/1.1 还是 HTTP/2
        parts.version = Version::HTTP_11;

        let client_ip = {
            let forwarded = parts
                .headers
                .get(self.trust.header_name())
                .and_then(|v| v.to_str().ok());
            self.trust.client_ip_for(peer.ip(), forwarded)
        };

        strip_hop_by_hop(&mut parts.headers);

        for (name, value) in target.headers.iter() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    parts.headers.insert(name, value);
                }
                _ => warn!("Skipping invalid header override '{}' for {}", name, host),
            }
        }

        if let Ok(value) = HeaderValue::from_str(host) {
            parts.headers.insert(header::HOST, value.clone());
            parts.headers.insert(X_FORWARDED_HOST, value);
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

        if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
            parts.headers.insert(X_FORWARDED_FOR, value.clone());
            parts.headers.insert(X_REAL_IP, value);
        }

        Ok(Request::from_parts(parts, body))
    }
}

/// 入站请求的原始主机名（HTTP/1 取 Host 头，HTTP/2 取 :authority）
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn prepare_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

/// 移除逐跳头，包括 `Connection` 中列出的头
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn redirect_to_https(host: &str, uri: &Uri) -> Response<ProxyBody> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = Response::new(empty());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Bad request"),
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full(message: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn owned(body: String) -> ProxyBody {
    Full::new(Bytes::from(body))
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// 请求是否在发出前被取消
fn is_canceled(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_canceled)
        {
            return true;
        }
        source = e.source();
    }
    false
}

/// 拼接完整的错误链
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}
