use crate::error::{ProxyError, Result};
use crate::tls::TlsCertificate;
use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::info;

/// 默认证书有效期
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// 证书签发者
///
/// ACME 等外部签发方通过实现此 trait 接入；失败时返回 `ProxyError::Issuance`。
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(&self, server_name: &str) -> Result<TlsCertificate>;
}

/// 自签名证书签发者
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    validity: Duration,
}

impl SelfSignedIssuer {
    pub fn new(validity: Duration) -> Self {
        Self { validity }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDITY)
    }
}

/// 生成自签名证书，返回 (证书 PEM, 私钥 PEM, 到期时间)
pub fn generate_self_signed(
    server_name: &str,
    validity: Duration,
) -> Result<(String, String, SystemTime)> {
    let mut params = CertificateParams::new(vec![server_name.to_string()])
        .map_err(|e| ProxyError::issuance(format!("invalid name '{}': {}", server_name, e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, server_name);
    params.distinguished_name = dn;

    let validity = time::Duration::try_from(validity)
        .map_err(|e| ProxyError::issuance(format!("invalid validity: {}", e)))?;
    let now = OffsetDateTime::now_utc();
    // 容忍少量时钟偏差
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now
        .checked_add(validity)
        .ok_or_else(|| ProxyError::issuance("validity exceeds supported date range"))?;

    let key_pair = KeyPair::generate()
        .map_err(|e| ProxyError::issuance(format!("key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::issuance(format!("signing failed: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem(), params.not_after.into()))
}

#[async_trait]
impl Issuer for SelfSignedIssuer {
    async fn issue(&self, server_name: &str) -> Result<TlsCertificate> {
        let name = server_name.to_string();
        let validity = self.validity;

        // 密钥生成是 CPU 密集操作
        let (cert_pem, key_pem, not_after) =
            tokio::task::spawn_blocking(move || generate_self_signed(&name, validity))
                .await
                .map_err(|e| ProxyError::issuance(format!("issuance task failed: {}", e)))??;

        info!("Issued self-signed certificate for {}", server_name);
        TlsCertificate::from_pem(server_name, cert_pem, key_pem, not_after)
            .map_err(|e| ProxyError::issuance(e.to_string()))
    }
}
