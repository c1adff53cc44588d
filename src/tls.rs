use crate::error::{ProxyError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// 入站 TLS 协商的 ALPN 协议（优先 HTTP/2）
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// 已解析、可直接用于握手的证书
///
/// 同时保留 PEM 原文以便写回配置存储；`server_config` 在构造时一次性生成，
/// 握手路径上只需克隆 `Arc`。
#[derive(Clone)]
pub struct TlsCertificate {
    hostname: String,
    cert_pem: String,
    key_pem: String,
    not_after: SystemTime,
    server_config: Arc<rustls::ServerConfig>,
}

impl TlsCertificate {
    /// 从 PEM 格式的证书链与私钥构造
    pub fn from_pem(
        hostname: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
        not_after: SystemTime,
    ) -> Result<Self> {
        let hostname = hostname.into();
        let cert_pem = cert_pem.into();
        let key_pem = key_pem.into();

        let certs = parse_certificates(&cert_pem)?;
        let key = parse_private_key(&key_pem)?;
        let server_config = build_server_config(certs, key)?;

        Ok(Self {
            hostname,
            cert_pem,
            key_pem,
            not_after,
            server_config,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// 在给定时刻是否已过期
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.not_after <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// 握手用的服务端配置
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificate")
            .field("hostname", &self.hostname)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// 当前进程使用的加密库
///
/// 优先使用进程级默认值，未安装时回退到 aws-lc-rs。
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// 解析 PEM 证书链
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::tls("No certificate found in PEM data"));
    }
    Ok(certs)
}

/// 解析 PEM 私钥
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ProxyError::tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ProxyError::tls("No private key found in PEM data"))
}

/// 创建服务器 TLS 配置（ALPN: h2, http/1.1）
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::tls(format!("Unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::tls(format!("Failed to create server config: {}", e)))?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// 创建访问上游后端的客户端 TLS 配置
///
/// 默认使用系统 CA；`skip_verify` 仅用于测试或内网自签名后端。
/// ALPN 由 HTTPS 连接器负责设置。
pub fn build_client_config(skip_verify: bool) -> Result<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();

    if !skip_verify {
        // 使用系统 CA 证书
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }
    }

    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::tls(format!("Unsupported protocol versions: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(config)
}

/// 不验证证书的验证器
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
