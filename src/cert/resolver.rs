use super::cache::CertificateCache;
use super::issuer::Issuer;
use crate::error::{ProxyError, Result};
use crate::route::normalize_host;
use crate::store::ConfigStore;
use crate::tls::TlsCertificate;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

type IssueResult = std::result::Result<Arc<TlsCertificate>, String>;
type InFlight = Shared<BoxFuture<'static, IssueResult>>;

/// 单个查找阶段的结果
enum Stage {
    Hit(Arc<TlsCertificate>),
    Miss(&'static str),
}

/// 握手时按 SNI 解析证书：内存缓存 -> 配置存储 -> 签发
///
/// 各阶段只在成功退出时产生副作用（写缓存、持久化）。
/// 只为配置存储中存在路由的主机签发。
/// 同一主机名的并发签发合并为一次，槽位在签发结束后清除。
pub struct CertificateResolver {
    cache: Arc<CertificateCache>,
    store: Arc<dyn ConfigStore>,
    issuer: Arc<dyn Issuer>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl CertificateResolver {
    pub fn new(
        cache: Arc<CertificateCache>,
        store: Arc<dyn ConfigStore>,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        Self {
            cache,
            store,
            issuer,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// 解析 SNI 对应的证书
    pub async fn certificate(&self, server_name: Option<&str>) -> Result<Arc<TlsCertificate>> {
        let host = server_name.map(normalize_host).unwrap_or_default();
        if host.is_empty() {
            return Err(ProxyError::NoSni);
        }

        let now = SystemTime::now();

        match self.from_cache(&host, now) {
            Stage::Hit(cert) => return Ok(cert),
            Stage::Miss(reason) => debug!("Certificate cache miss for {}: {}", host, reason),
        }

        match self.from_store(&host, now).await {
            Stage::Hit(cert) => {
                self.cache.set(host.as_str(), Arc::clone(&cert));
                return Ok(cert);
            }
            Stage::Miss(reason) => debug!("Certificate store miss for {}: {}", host, reason),
        }

        self.ensure_routable(&host).await?;
        self.issue(&host).await
    }

    /// 未配置的主机名不签发，存储错误时同样拒绝
    async fn ensure_routable(&self, host: &str) -> Result<()> {
        match self.store.lookup_route(host).await? {
            Some(_) => Ok(()),
            None => Err(ProxyError::no_route(host)),
        }
    }

    fn from_cache(&self, host: &str, now: SystemTime) -> Stage {
        match self.cache.get(host) {
            Some(cert) if cert.is_expired_at(now) => {
                self.cache.invalidate(host);
                Stage::Miss("expired")
            }
            Some(cert) => Stage::Hit(cert),
            None => Stage::Miss("absent"),
        }
    }

    async fn from_store(&self, host: &str, now: SystemTime) -> Stage {
        let stored = match self.store.lookup_certificate(host).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Stage::Miss("absent"),
            Err(e) => {
                warn!("Certificate store lookup for {} failed: {}", host, e);
                return Stage::Miss("store error");
            }
        };

        if stored.is_expired_at(now) {
            return Stage::Miss("expired");
        }

        match TlsCertificate::from_pem(host, stored.cert_pem, stored.key_pem, stored.not_after) {
            Ok(cert) => Stage::Hit(Arc::new(cert)),
            Err(e) => {
                warn!("Stored certificate for {} is unusable: {}", host, e);
                Stage::Miss("unusable")
            }
        }
    }

    async fn issue(&self, host: &str) -> Result<Arc<TlsCertificate>> {
        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(host) {
                Some(pending) => {
                    debug!("Joining in-flight issuance for {}", host);
                    pending.clone()
                }
                None => {
                    // 签发结果先写缓存再释放槽位，迟到的调用方在此命中
                    if let Some(cert) = self.cache.get(host) {
                        if !cert.is_expired() {
                            debug!("Certificate for {} issued while waiting on store", host);
                            return Ok(cert);
                        }
                    }

                    let pending = self.start_issue(host);
                    in_flight.insert(host.to_string(), pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(host).is_some_and(|p| p.ptr_eq(&pending)) {
                in_flight.remove(host);
            }
        }

        result.map_err(ProxyError::Issuance)
    }

    fn start_issue(&self, host: &str) -> InFlight {
        let host = host.to_string();
        let issuer = Arc::clone(&self.issuer);
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);

        async move {
            info!("Issuing certificate for {}", host);
            let cert = issuer.issue(&host).await.map_err(|e| match e {
                ProxyError::Issuance(msg) => msg,
                other => other.to_string(),
            })?;
            let cert = Arc::new(cert);

            cache.set(host.as_str(), Arc::clone(&cert));
            if let Err(e) = store.save_certificate(&host, &cert).await {
                warn!("Failed to persist certificate for {}: {}", host, e);
            }

            Ok(cert)
        }
        .boxed()
        .shared()
    }
}
