use super::{ConfigStore, HostsFile, ProxyRecord, StoredCertificate};
use crate::error::{ProxyError, Result};
use crate::route::{normalize_host, TargetConfig};
use crate::tls::TlsCertificate;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// 进程内配置存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    hosts: RwLock<HostsFile>,
    certificates: RwLock<HashMap<String, StoredCertificate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: HostsFile) -> Self {
        Self {
            hosts: RwLock::new(hosts),
            certificates: RwLock::new(HashMap::new()),
        }
    }

    /// 插入或替换同名代理
    pub fn upsert_proxy(&self, proxy: ProxyRecord) {
        self.hosts.write().upsert(proxy);
    }

    pub fn remove_proxy(&self, name: &str) -> Option<ProxyRecord> {
        self.hosts.write().remove(name)
    }

    /// 整体替换主机配置
    pub fn replace_hosts(&self, hosts: HostsFile) {
        *self.hosts.write() = hosts;
    }

    /// 直接写入一份证书记录（不要求主机已配置）
    pub fn insert_certificate(&self, host: &str, cert: StoredCertificate) {
        self.certificates.write().insert(normalize_host(host), cert);
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates.read().len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn lookup_route(&self, host: &str) -> Result<Option<TargetConfig>> {
        Ok(self.hosts.read().target_for(host))
    }

    async fn lookup_certificate(&self, host: &str) -> Result<Option<StoredCertificate>> {
        Ok(self.certificates.read().get(&normalize_host(host)).cloned())
    }

    async fn save_certificate(&self, host: &str, cert: &TlsCertificate) -> Result<()> {
        if self.hosts.read().find(host).is_none() {
            return Err(ProxyError::store(format!(
                "cannot save certificate, host '{}' is not configured",
                host
            )));
        }

        self.certificates
            .write()
            .insert(normalize_host(host), StoredCertificate::from_certificate(cert));
        Ok(())
    }
}
