use super::{ConfigStore, HostsFile, StoredCertificate};
use crate::error::{ProxyError, Result};
use crate::route::{normalize_host, TargetConfig};
use crate::tls::TlsCertificate;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// 基于文件的配置存储
///
/// 主机配置来自一个 TOML 文件，修改时间变化后自动重新解析；
/// 重新解析失败时继续使用上一份有效配置。
/// 证书每个主机一个 TOML 文件，写入时先写临时文件再原子重命名。
pub struct FileStore {
    hosts_path: PathBuf,
    certs_dir: PathBuf,
    hosts: RwLock<LoadedHosts>,
}

struct LoadedHosts {
    modified: Option<SystemTime>,
    hosts: Arc<HostsFile>,
}

/// 证书文件格式
#[derive(Debug, Serialize, Deserialize)]
struct CertificateFile {
    hostname: String,
    cert_pem: String,
    key_pem: String,
    /// Unix 时间戳（秒）
    not_after: u64,
}

impl FileStore {
    /// 打开存储；主机配置文件必须存在且有效
    pub fn open(hosts_path: impl Into<PathBuf>, certs_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let hosts_path = hosts_path.into();
        let certs_dir = certs_dir.into();

        let hosts = HostsFile::load(&hosts_path)?;
        let modified = std::fs::metadata(&hosts_path)
            .and_then(|m| m.modified())
            .ok();

        std::fs::create_dir_all(&certs_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create certificate directory {:?}: {}", certs_dir, e)
        })?;

        info!(
            "Loaded {} proxies ({} hosts) from {:?}",
            hosts.proxies.len(),
            hosts.host_count(),
            hosts_path
        );

        Ok(Self {
            hosts_path,
            certs_dir,
            hosts: RwLock::new(LoadedHosts {
                modified,
                hosts: Arc::new(hosts),
            }),
        })
    }

    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// 当前主机配置（必要时重新加载）
    pub async fn hosts(&self) -> Result<Arc<HostsFile>> {
        let modified = tokio::fs::metadata(&self.hosts_path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| {
                ProxyError::store(format!("hosts file {:?} unavailable: {}", self.hosts_path, e))
            })?;

        {
            let loaded = self.hosts.read();
            if loaded.modified == Some(modified) {
                return Ok(Arc::clone(&loaded.hosts));
            }
        }

        let content = tokio::fs::read_to_string(&self.hosts_path)
            .await
            .map_err(|e| {
                ProxyError::store(format!("failed to read {:?}: {}", self.hosts_path, e))
            })?;

        let mut loaded = self.hosts.write();
        match HostsFile::parse(&content) {
            Ok(hosts) => {
                info!(
                    "Reloaded {} proxies from {:?}",
                    hosts.proxies.len(),
                    self.hosts_path
                );
                loaded.hosts = Arc::new(hosts);
            }
            Err(e) => {
                warn!(
                    "Ignoring invalid hosts file {:?}, keeping previous configuration: {:#}",
                    self.hosts_path, e
                );
            }
        }
        loaded.modified = Some(modified);
        Ok(Arc::clone(&loaded.hosts))
    }

    fn certificate_path(&self, host: &str) -> PathBuf {
        self.certs_dir
            .join(format!("{}.toml", certificate_file_stem(&normalize_host(host))))
    }
}

/// 主机名 -> 安全的文件名
fn certificate_file_stem(host: &str) -> String {
    host.replace('*', "_wildcard_")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn lookup_route(&self, host: &str) -> Result<Option<TargetConfig>> {
        Ok(self.hosts().await?.target_for(host))
    }

    async fn lookup_certificate(&self, host: &str) -> Result<Option<StoredCertificate>> {
        let path = self.certificate_path(host);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::store(format!("failed to read {:?}: {}", path, e)));
            }
        };

        let file: CertificateFile = toml::from_str(&content)
            .map_err(|e| ProxyError::store(format!("corrupt certificate file {:?}: {}", path, e)))?;

        Ok(Some(StoredCertificate {
            cert_pem: file.cert_pem,
            key_pem: file.key_pem,
            not_after: UNIX_EPOCH + Duration::from_secs(file.not_after),
        }))
    }

    async fn save_certificate(&self, host: &str, cert: &TlsCertificate) -> Result<()> {
        if self.hosts().await?.find(host).is_none() {
            return Err(ProxyError::store(format!(
                "cannot save certificate, host '{}' is not configured",
                host
            )));
        }

        let file = CertificateFile {
            hostname: normalize_host(host),
            cert_pem: cert.cert_pem().to_string(),
            key_pem: cert.key_pem().to_string(),
            not_after: to_unix_secs(cert.not_after()),
        };
        let content = toml::to_string(&file)
            .map_err(|e| ProxyError::store(format!("failed to encode certificate: {}", e)))?;

        let path = self.certificate_path(host);
        let tmp_path = path.with_extension("toml.tmp");

        tokio::fs::create_dir_all(&self.certs_dir)
            .await
            .map_err(|e| ProxyError::store(format!("failed to create {:?}: {}", self.certs_dir, e)))?;
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| ProxyError::store(format!("failed to write {:?}: {}", tmp_path, e)))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| ProxyError::store(format!("failed to rename {:?}: {}", tmp_path, e)))?;

        debug!("Saved certificate for {} to {:?}", host, path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_file_stem() {
        assert_eq!(certificate_file_stem("a.example.com"), "a.example.com");
        assert_eq!(
            certificate_file_stem("*.example.com"),
            "_wildcard_.example.com"
        );
        assert_eq!(certificate_file_stem("../etc/passwd"), ".._etc_passwd");
        assert_eq!(certificate_file_stem("[::1]"), "___1_");
    }

    #[test]
    fn test_to_unix_secs() {
        assert_eq!(to_unix_secs(UNIX_EPOCH + Duration::from_secs(42)), 42);
        assert_eq!(to_unix_secs(UNIX_EPOCH), 0);
    }
}
