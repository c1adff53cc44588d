use crate::route::{normalize_host, Backend, TargetConfig};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// 主机配置文件（hosts.toml）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostsFile {
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyRecord>,
}

/// 一组共享后端池、请求头和 HTTPS 策略的主机名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyRecord {
    pub name: String,
    /// 精确主机名或通配符模式（`*` 匹配任意字符序列）
    pub hosts: Vec<String>,
    #[serde(default)]
    pub force_https: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendRecord {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_enabled() -> bool {
    true
}

impl BackendRecord {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            enabled: true,
        }
    }

    fn to_backend(&self) -> Backend {
        Backend::new(self.scheme.to_lowercase(), self.host.clone(), self.port)
    }
}

impl ProxyRecord {
    /// 转换为路由配置，只保留启用的后端
    pub fn to_target(&self) -> TargetConfig {
        TargetConfig::new(
            self.backends
                .iter()
                .filter(|b| b.enabled)
                .map(BackendRecord::to_backend)
                .collect(),
        )
        .with_headers(self.headers.clone())
        .with_force_https(self.force_https)
    }

    fn matches_exact(&self, host: &str) -> bool {
        self.hosts
            .iter()
            .any(|h| !h.contains('*') && normalize_host(h) == host)
    }

    fn matches_wildcard(&self, host: &str) -> bool {
        self.hosts
            .iter()
            .any(|h| h.contains('*') && wildcard_match(&h.to_lowercase(), host))
    }
}

impl HostsFile {
    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hosts file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid hosts file: {:?}", path))
    }

    /// 从 TOML 文本解析并校验
    pub fn parse(content: &str) -> Result<Self> {
        let hosts: HostsFile = toml::from_str(content).context("Failed to parse hosts TOML")?;
        hosts.validate()?;
        Ok(hosts)
    }

    /// 校验记录
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut seen_hosts = HashSet::new();

        for proxy in &self.proxies {
            if proxy.name.trim().is_empty() {
                bail!("Proxy name cannot be empty");
            }
            if !names.insert(proxy.name.as_str()) {
                bail!("Duplicate proxy name: {}", proxy.name);
            }
            if proxy.hosts.is_empty() {
                bail!("Proxy '{}' has no hosts", proxy.name);
            }

            for host in &proxy.hosts {
                let normalized = normalize_host(host);
                if normalized.is_empty() {
                    bail!("Proxy '{}' has an empty host name", proxy.name);
                }
                if !seen_hosts.insert(normalized.clone()) {
                    bail!("Host '{}' is declared more than once", normalized);
                }
            }

            for backend in &proxy.backends {
                let scheme = backend.scheme.to_lowercase();
                if scheme != "http" && scheme != "https" {
                    bail!(
                        "Proxy '{}' backend '{}' has unsupported scheme '{}'",
                        proxy.name,
                        backend.host,
                        backend.scheme
                    );
                }
                if backend.host.trim().is_empty() {
                    bail!("Proxy '{}' has a backend without host", proxy.name);
                }
            }

            for name in proxy.headers.keys() {
                if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                    bail!("Proxy '{}' has invalid header name '{}'", proxy.name, name);
                }
            }
        }

        Ok(())
    }

    /// 查找主机名所属的代理：先精确匹配，再按声明顺序匹配通配符
    pub fn find(&self, host: &str) -> Option<&ProxyRecord> {
        let host = normalize_host(host);
        self.proxies
            .iter()
            .find(|p| p.matches_exact(&host))
            .or_else(|| self.proxies.iter().find(|p| p.matches_wildcard(&host)))
    }

    /// 查询主机名对应的路由配置
    pub fn target_for(&self, host: &str) -> Option<TargetConfig> {
        self.find(host).map(ProxyRecord::to_target)
    }

    /// 插入或替换同名代理
    pub fn upsert(&mut self, proxy: ProxyRecord) {
        match self.proxies.iter_mut().find(|p| p.name == proxy.name) {
            Some(existing) => *existing = proxy,
            None => self.proxies.push(proxy),
        }
    }

    /// 按名称删除代理
    pub fn remove(&mut self, name: &str) -> Option<ProxyRecord> {
        let index = self.proxies.iter().position(|p| p.name == name)?;
        Some(self.proxies.remove(index))
    }

    pub fn host_count(&self) -> usize {
        self.proxies.iter().map(|p| p.hosts.len()).sum()
    }
}

/// 通配符匹配，`*` 匹配任意（可为空的）字符序列
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // 没有 `*`，必须完全相同
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[proxy]]
name = "web"
hosts = ["a.example.com", "www.example.com"]
force_https = true
headers = { "X-Tenant" = "web" }

[[proxy.backend]]
host = "10.0.0.1"
port = 8081

[[proxy.backend]]
host = "10.0.0.2"
port = 8082

[[proxy.backend]]
host = "10.0.0.3"
port = 8083
enabled = false

[[proxy]]
name = "tenants"
hosts = ["*.tenants.example.com"]

[[proxy.backend]]
scheme = "https"
host = "tenants.internal"
"#;

    #[test]
    fn test_parse_sample() {
        let hosts = HostsFile::parse(SAMPLE).unwrap();
        assert_eq!(hosts.proxies.len(), 2);
        assert_eq!(hosts.host_count(), 3);
        assert_eq!(hosts.proxies[1].backends[0].port, 0);
    }

    #[test]
    fn test_enabled_backends_in_order() {
        let hosts = HostsFile::parse(SAMPLE).unwrap();
        let target = hosts.target_for("A.Example.com").unwrap();

        let ports: Vec<u16> = target.backends.iter().map(|b| b.port).collect();
        assert_eq!(ports, vec![8081, 8082]);
        assert!(target.force_https);
        assert_eq!(target.headers.get("X-Tenant").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_wildcard_lookup() {
        let hosts = HostsFile::parse(SAMPLE).unwrap();
        let target = hosts.target_for("shop.tenants.example.com").unwrap();
        assert_eq!(target.backends[0].scheme, "https");
        assert!(hosts.target_for("tenants.example.com").is_none());
        assert!(hosts.target_for("b.example.com").is_none());
    }

    #[test]
    fn test_exact_wins_over_wildcard() {
        let mut hosts = HostsFile::parse(SAMPLE).unwrap();
        hosts.upsert(ProxyRecord {
            name: "vip".to_string(),
            hosts: vec!["vip.tenants.example.com".to_string()],
            force_https: false,
            headers: HashMap::new(),
            backends: vec![BackendRecord::new("http", "10.9.9.9", 80)],
        });

        let target = hosts.target_for("vip.tenants.example.com").unwrap();
        assert_eq!(target.backends[0].host, "10.9.9.9");
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.example.com", "a.example.com"));
        assert!(wildcard_match("*.example.com", "a.b.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(wildcard_match("api-*.example.com", "api-eu.example.com"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*b*c", "abc"));
        assert!(!wildcard_match("a*b*c", "acb"));
        assert!(wildcard_match("exact.com", "exact.com"));
        assert!(!wildcard_match("exact.com", "exact.co"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let content = r#"
[[proxy]]
name = "one"
hosts = ["a.example.com"]

[[proxy]]
name = "two"
hosts = ["A.example.com"]
"#;
        let err = HostsFile::parse(content).unwrap_err();
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let content = r#"
[[proxy]]
name = "one"
hosts = ["a.example.com"]

[[proxy.backend]]
scheme = "ftp"
host = "10.0.0.1"
"#;
        assert!(HostsFile::parse(content).is_err());
    }

    #[test]
    fn test_empty_document() {
        let hosts = HostsFile::parse("").unwrap();
        assert!(hosts.proxies.is_empty());
        assert!(hosts.find("a.example.com").is_none());
    }

    #[test]
    fn test_remove() {
        let mut hosts = HostsFile::parse(SAMPLE).unwrap();
        assert!(hosts.remove("web").is_some());
        assert!(hosts.remove("web").is_none());
        assert!(hosts.target_for("a.example.com").is_none());
    }
}
