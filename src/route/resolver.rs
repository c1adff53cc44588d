use super::cache::RouteCache;
use super::model::{normalize_host, SelectedTarget, TargetConfig};
use crate::error::{ProxyError, Result};
use crate::store::ConfigStore;
use std::sync::Arc;
use tracing::debug;

/// 主机名 -> 后端选择（旁路缓存 + 负缓存 + 轮询）
///
/// 同一主机名的并发未命中可能各自查询一次存储，不做合并。
pub struct RoutingResolver {
    store: Arc<dyn ConfigStore>,
    cache: Arc<RouteCache>,
}

impl RoutingResolver {
    pub fn new(store: Arc<dyn ConfigStore>, cache: Arc<RouteCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<RouteCache> {
        &self.cache
    }

    /// 为请求的主机名选出一个后端
    ///
    /// - 负缓存命中直接返回 `NoRouteFound`，不查询存储；
    /// - 未命中时查询存储：不存在则写入负缓存，存储故障不写缓存；
    /// - 首次填充使用第 0 个后端，之后每次命中按计数器轮询。
    pub async fn get_target(&self, host: &str) -> Result<SelectedTarget> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(ProxyError::no_route(host));
        }

        let (config, rotation) = match self.cache.get(&host) {
            Some(hit) if !hit.is_expired() => match hit.target {
                Some(config) => (config, hit.rotation),
                None => {
                    debug!("Negative route cache hit for {}", host);
                    return Err(ProxyError::no_route(host));
                }
            },
            _ => (self.load(&host).await?, 0),
        };

        if config.backends.is_empty() {
            return Err(ProxyError::no_route(host));
        }

        let index = (rotation % config.backends.len() as u64) as usize;
        let backend = config.backends[index].clone();
        debug!("Selected backend {} for {} (rotation {})", backend, host, rotation);

        Ok(SelectedTarget {
            backend,
            headers: Arc::clone(&config.headers),
            force_https: config.force_https,
        })
    }

    async fn load(&self, host: &str) -> Result<Arc<TargetConfig>> {
        debug!("Route cache miss for {}, querying store", host);

        let found = self.store.lookup_route(host).await.map_err(|e| match e {
            ProxyError::Store(_) => e,
            other => ProxyError::store(other.to_string()),
        })?;

        match found {
            Some(config) => {
                let config = Arc::new(config);
                self.cache.set(host, Some(Arc::clone(&config)));
                Ok(config)
            }
            None => {
                self.cache.set(host, None);
                Err(ProxyError::no_route(host))
            }
        }
    }
}
