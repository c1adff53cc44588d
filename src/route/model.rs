use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 后端地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backend {
    /// http 或 https
    pub scheme: String,
    pub host: String,
    /// 0 表示使用协议默认端口
    pub port: u16,
}

impl Backend {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// URI authority 部分（IPv6 地址自动加方括号）
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == 0 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// 静态请求头覆盖表，多个并发选择共享同一份，不可原地修改
pub type HeaderOverrides = Arc<HashMap<String, String>>;

/// 某个主机名的后端池配置
///
/// 由配置存储返回后即视为不可变；`backends` 的顺序就是轮询顺序。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetConfig {
    pub backends: Vec<Backend>,
    pub headers: HeaderOverrides,
    pub force_https: bool,
}

impl TargetConfig {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            headers: Arc::new(HashMap::new()),
            force_https: false,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub fn with_force_https(mut self, force_https: bool) -> Self {
        self.force_https = force_https;
        self
    }
}

/// 单次请求选中的目标，不进入缓存
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTarget {
    pub backend: Backend,
    pub headers: HeaderOverrides,
    pub force_https: bool,
}

/// 规范化主机名：去掉端口、转小写、去掉末尾的点
///
/// 带方括号的 IPv6 字面量保留方括号；裸 IPv6 地址不做端口拆分。
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };

    without_port.to_lowercase().trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("A.Example.com:8080"), "a.example.com");
        assert_eq!(normalize_host("[::1]:8443"), "[::1]");
        assert_eq!(normalize_host("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn test_backend_authority() {
        assert_eq!(
            Backend::new("http", "10.0.0.1", 8081).authority(),
            "10.0.0.1:8081"
        );
        assert_eq!(Backend::new("https", "api.internal", 0).authority(), "api.internal");
        assert_eq!(Backend::new("http", "::1", 9000).authority(), "[::1]:9000");
        assert_eq!(
            Backend::new("http", "10.0.0.1", 8081).to_string(),
            "http://10.0.0.1:8081"
        );
    }

    #[test]
    fn test_target_config_default_headers_not_shared_mutably() {
        let config = TargetConfig::new(vec![Backend::new("http", "10.0.0.1", 80)]);
        assert!(config.headers.is_empty());
        assert!(!config.force_https);
    }
}
