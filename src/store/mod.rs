//! 配置存储：主机名 -> 后端池，以及持久化的证书
//!
//! 代理核心只依赖 [`ConfigStore`] trait；内置内存实现与基于文件的实现。

mod file;
mod hosts;
mod memory;

pub use file::FileStore;
pub use hosts::{wildcard_match, BackendRecord, HostsFile, ProxyRecord};
pub use memory::MemoryStore;

use crate::error::Result;
use crate::route::TargetConfig;
use crate::tls::TlsCertificate;
use async_trait::async_trait;
use std::time::SystemTime;

/// 存储中的证书记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: SystemTime,
}

impl StoredCertificate {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.not_after <= now
    }

    pub fn from_certificate(cert: &TlsCertificate) -> Self {
        Self {
            cert_pem: cert.cert_pem().to_string(),
            key_pem: cert.key_pem().to_string(),
            not_after: cert.not_after(),
        }
    }
}

/// 配置存储接口
///
/// 约定：
/// - 查询结果 `Ok(None)` 表示确定不存在（可负缓存）；
/// - `Err(ProxyError::Store(_))` 表示暂时不可用，调用方不得缓存；
/// - 路由查询只返回启用的后端，先精确匹配再通配符匹配。
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// 按规范化主机名查询后端池配置
    async fn lookup_route(&self, host: &str) -> Result<Option<TargetConfig>>;

    /// 查询已持久化的证书
    async fn lookup_certificate(&self, host: &str) -> Result<Option<StoredCertificate>>;

    /// 持久化证书；主机名必须属于某个已配置的代理
    async fn save_certificate(&self, host: &str, cert: &TlsCertificate) -> Result<()>;
}
