use crate::cert::CertificateResolver;
use crate::error::{ProxyError, Result};
use crate::forwarder::{InboundScheme, RequestForwarder};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// 处理一个明文 HTTP 连接
pub async fn serve_http(stream: TcpStream, peer: SocketAddr, forwarder: Arc<RequestForwarder>) {
    serve(stream, peer, InboundScheme::Http, forwarder).await;
}

/// 处理一个 TLS 连接
///
/// 先读取 ClientHello，根据 SNI 解析证书后再完成握手；
/// 整个握手（包括证书解析）受 `handshake_timeout` 约束。
/// 失败只影响当前连接。
pub async fn serve_https(
    stream: TcpStream,
    peer: SocketAddr,
    certificates: Arc<CertificateResolver>,
    forwarder: Arc<RequestForwarder>,
    handshake_timeout: Duration,
) -> Result<()> {
    let handshake = async {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let server_name = start.client_hello().server_name().map(str::to_string);
        let certificate = certificates.certificate(server_name.as_deref()).await?;
        let tls = start.into_stream(certificate.server_config()).await?;
        Ok::<_, ProxyError>(tls)
    };

    let tls = tokio::time::timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| ProxyError::tls(format!("handshake timed out after {:?}", handshake_timeout)))??;

    serve(tls, peer, InboundScheme::Https, forwarder).await;
    Ok(())
}

/// 以 HTTP/1.1 或 HTTP/2（自动识别）服务一个连接
async fn serve<S>(stream: S, peer: SocketAddr, scheme: InboundScheme, forwarder: Arc<RequestForwarder>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let forwarder = Arc::clone(&forwarder);
        async move { forwarder.handle(req, peer, scheme).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
        debug!("{} connection from {} closed: {}", scheme.as_str(), peer, e);
    }
}
