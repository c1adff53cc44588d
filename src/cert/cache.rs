use crate::tls::TlsCertificate;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// 默认最大条目数
pub const DEFAULT_CERT_CAPACITY: usize = 1000;

struct CertEntry {
    certificate: Arc<TlsCertificate>,
    /// 相对缓存 epoch 的纳秒数
    last_access: AtomicU64,
}

/// 主机名 -> 证书的有界缓存
///
/// 没有 TTL，过期由证书自身的 `not_after` 决定（调用方检查）。
/// 表满时淘汰访问时间最早的条目。
pub struct CertificateCache {
    entries: RwLock<HashMap<String, CertEntry>>,
    capacity: usize,
    epoch: Instant,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CERT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// 查询证书，命中时刷新访问时间
    pub fn get(&self, host: &str) -> Option<Arc<TlsCertificate>> {
        let entries = self.entries.read();
        let entry = entries.get(host)?;
        entry.last_access.store(self.now(), Ordering::Relaxed);
        Some(Arc::clone(&entry.certificate))
    }

    /// 写入证书，表满且为新键时淘汰一个最久未访问的条目
    pub fn set(&self, host: impl Into<String>, certificate: Arc<TlsCertificate>) {
        let host = host.into();
        let now = self.now();

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&host) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(host, _)| host.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!("Evicted least recently used certificate for {}", oldest);
            }
        }

        entries.insert(
            host,
            CertEntry {
                certificate,
                last_access: AtomicU64::new(now),
            },
        );
    }

    pub fn invalidate(&self, host: &str) {
        self.entries.write().remove(host);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    fn set_last_access(&self, host: &str, nanos: u64) {
        if let Some(entry) = self.entries.read().get(host) {
            entry.last_access.store(nanos, Ordering::Relaxed);
        }
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::time::{Duration, SystemTime};

    fn certificate() -> Arc<TlsCertificate> {
        static PEM: OnceLock<(String, String)> = OnceLock::new();
        let (cert_pem, key_pem) = PEM.get_or_init(|| {
            let certified =
                rcgen::generate_simple_self_signed(vec!["cache.example.com".to_string()]).unwrap();
            (certified.cert.pem(), certified.signing_key.serialize_pem())
        });
        Arc::new(
            TlsCertificate::from_pem(
                "cache.example.com",
                cert_pem.clone(),
                key_pem.clone(),
                SystemTime::now() + Duration::from_secs(3600),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = CertificateCache::new();
        assert!(cache.get("a.example.com").is_none());

        let cert = certificate();
        cache.set("a.example.com", Arc::clone(&cert));
        assert!(Arc::ptr_eq(&cache.get("a.example.com").unwrap(), &cert));

        cache.invalidate("a.example.com");
        assert!(cache.get("a.example.com").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_and_lru_eviction() {
        let cache = CertificateCache::with_capacity(2);
        cache.set("a", certificate());
        cache.set("b", certificate());
        cache.set_last_access("a", 200);
        cache.set_last_access("b", 100);

        cache.set("c", certificate());

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_get_refreshes_access_time() {
        let cache = CertificateCache::with_capacity(2);
        cache.set("a", certificate());
        cache.set("b", certificate());
        cache.set_last_access("a", 0);
        cache.set_last_access("b", 0);

        // 访问 a 后，b 成为最久未访问
        std::thread::sleep(Duration::from_millis(2));
        cache.get("a");
        cache.set("c", certificate());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }
}
