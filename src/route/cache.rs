use super::model::TargetConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// 默认最大条目数
pub const DEFAULT_ROUTE_CAPACITY: usize = 1000;
/// 默认条目有效期
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(3600);
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

/// 缓存中的单个路由
///
/// `target` 为 `None` 表示已确认"无路由"（负缓存），不等同于缺失。
/// 结构性变更需要写锁；访问时间与轮询计数器只用原子操作更新。
struct RouteEntry {
    target: Option<Arc<TargetConfig>>,
    /// 相对缓存 epoch 的纳秒数
    expires_at: u64,
    rotation: AtomicU64,
    last_access: AtomicU64,
}

/// 一次命中的快照
#[derive(Debug, Clone)]
pub struct RouteLookup {
    pub target: Option<Arc<TargetConfig>>,
    /// 本次命中后的轮询计数器值
    pub rotation: u64,
    pub expires_at: Instant,
}

impl RouteLookup {
    /// 是否已过期（解析层的防御性复查）
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }

    /// 是否为负缓存
    pub fn is_negative(&self) -> bool {
        self.target.is_none()
    }
}

/// 主机名 -> 后端池配置的并发缓存（TTL + 尽力而为的 LRU）
///
/// 读路径只持有读锁；仅在发现过期条目时短暂获取写锁删除。
/// LRU 淘汰通过全表扫描访问时间实现，不追求精确。
pub struct RouteCache {
    entries: RwLock<HashMap<String, Arc<RouteEntry>>>,
    capacity: usize,
    ttl: Duration,
    epoch: Instant,
}

impl RouteCache {
    /// 使用默认容量与 TTL 创建
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_ROUTE_CAPACITY, DEFAULT_ROUTE_TTL)
    }

    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn instant_at(&self, nanos: u64) -> Instant {
        self.epoch + Duration::from_nanos(nanos)
    }

    /// 查询缓存
    ///
    /// 过期条目在写锁下二次确认后删除并视为未命中；
    /// 命中时原子地刷新访问时间并递增轮询计数器（溢出回绕到 0）。
    pub fn get(&self, host: &str) -> Option<RouteLookup> {
        let entry = self.entries.read().get(host).cloned()?;
        let now = self.now();

        if entry.expires_at <= now {
            let mut entries = self.entries.write();
            // 其他写者可能已经删除或替换了该条目
            if let Some(current) = entries.get(host) {
                if current.expires_at <= now {
                    entries.remove(host);
                    debug!("Route cache entry for {} expired", host);
                }
            }
            return None;
        }

        entry.last_access.store(now, Ordering::Relaxed);
        let rotation = entry
            .rotation
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        Some(RouteLookup {
            target: entry.target.clone(),
            rotation,
            expires_at: self.instant_at(entry.expires_at),
        })
    }

    /// 写入（或覆盖）一个条目，`None` 表示负缓存
    ///
    /// 表满且为新键时先淘汰访问时间最早的一个条目。
    pub fn set(&self, host: impl Into<String>, target: Option<Arc<TargetConfig>>) {
        let host = host.into();
        let now = self.now();

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&host) {
            Self::evict_lru(&mut entries);
        }

        entries.insert(
            host,
            Arc::new(RouteEntry {
                target,
                expires_at: now.saturating_add(self.ttl.as_nanos() as u64),
                rotation: AtomicU64::new(0),
                last_access: AtomicU64::new(now),
            }),
        );
    }

    fn evict_lru(entries: &mut HashMap<String, Arc<RouteEntry>>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(host, _)| host.clone());

        if let Some(host) = oldest {
            entries.remove(&host);
            debug!("Evicted least recently used route for {}", host);
        }
    }

    /// 无条件删除
    pub fn invalidate(&self, host: &str) {
        self.entries.write().remove(host);
    }

    /// 清理所有过期条目，返回删除数量
    pub fn cleanup_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();

        if removed > 0 {
            debug!("Cleaned up {} expired route cache entries", removed);
        }
        removed
    }

    /// 启动后台清理任务，间隔至少 1 毫秒
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_CLEANUP_INTERVAL);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.cleanup_expired();
            }
        })
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

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 表中是否存在该键（不论是否过期，不更新访问时间）
    pub fn contains(&self, host: &str) -> bool {
        self.entries.read().contains_key(host)
    }

    #[cfg(test)]
    fn set_last_access(&self, host: &str, nanos: u64) {
        if let Some(entry) = self.entries.read().get(host) {
            entry.last_access.store(nanos, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn set_rotation(&self, host: &str, value: u64) {
        if let Some(entry) = self.entries.read().get(host) {
            entry.rotation.store(value, Ordering::Relaxed);
        }
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new()
    }
}
