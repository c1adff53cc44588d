// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::route::{DEFAULT_ROUTE_CAPACITY, DEFAULT_ROUTE_TTL};
use crate::trust::{CLOUDFLARE_NETWORKS, DEFAULT_TRUSTED_HEADER};
use crate::upstream::UpstreamConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 进程配置（proxy.toml）
///
/// 所有字段都有默认值，空文件即为有效配置。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub trust: TrustSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub issuer: IssuerSettings,
}

/// 监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// 明文 HTTP 监听地址
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// HTTPS 监听地址
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// 每个端口的监听实例数（0 表示 CPU 数）
    #[serde(default)]
    pub listeners: usize,
    /// TLS 握手超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            listeners: 0,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl ServerSettings {
    pub fn http_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http_addr
            .parse()
            .with_context(|| format!("Invalid http_addr: {}", self.http_addr))
    }

    pub fn https_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.https_addr
            .parse()
            .with_context(|| format!("Invalid https_addr: {}", self.https_addr))
    }

    /// 实际的监听实例数
    pub fn listener_count(&self) -> usize {
        if self.listeners > 0 {
            self.listeners
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// 受信任上游（CDN）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSettings {
    #[serde(default = "default_trusted_header")]
    pub header: String,
    #[serde(default = "default_trusted_networks")]
    pub networks: Vec<String>,
}

fn default_trusted_header() -> String {
    DEFAULT_TRUSTED_HEADER.to_string()
}

fn default_trusted_networks() -> Vec<String> {
    CLOUDFLARE_NETWORKS.iter().map(|s| s.to_string()).collect()
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            header: default_trusted_header(),
            networks: default_trusted_networks(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_route_capacity")]
    pub route_capacity: usize,
    #[serde(default = "default_route_ttl_secs")]
    pub route_ttl_secs: u64,
    #[serde(default = "default_cert_capacity")]
    pub cert_capacity: usize,
    /// 过期路由清理间隔（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_route_capacity() -> usize {
    DEFAULT_ROUTE_CAPACITY
}

fn default_route_ttl_secs() -> u64 {
    DEFAULT_ROUTE_TTL.as_secs()
}

fn default_cert_capacity() -> usize {
    crate::cert::DEFAULT_CERT_CAPACITY
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            route_capacity: default_route_capacity(),
            route_ttl_secs: default_route_ttl_secs(),
            cert_capacity: default_cert_capacity(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheSettings {
    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 上游连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tls_handshake_timeout_ms")]
    pub tls_handshake_timeout_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// 单请求截止时间（秒），不设置则不限制
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// 跳过后端证书验证
    #[serde(default)]
    pub skip_verify: bool,
}

fn default_max_idle_per_host() -> usize {
    512
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_tls_handshake_timeout_ms() -> u64 {
    10000
}

fn default_keepalive_secs() -> u64 {
    30
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            request_timeout_secs: None,
            skip_verify: false,
        }
    }
}

impl UpstreamSettings {
    pub fn to_upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            tls_handshake_timeout: Duration::from_millis(self.tls_handshake_timeout_ms),
            keepalive: Duration::from_secs(self.keepalive_secs),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            skip_verify: self.skip_verify,
        }
    }
}

/// 配置存储位置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("hosts.toml")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("certs")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            hosts_file: default_hosts_file(),
            certs_dir: default_certs_dir(),
        }
    }
}

impl StoreSettings {
    /// 相对路径按配置文件所在目录解析
    pub fn resolve_relative_to(&mut self, base: &Path) {
        if self.hosts_file.is_relative() {
            self.hosts_file = base.join(&self.hosts_file);
        }
        if self.certs_dir.is_relative() {
            self.certs_dir = base.join(&self.certs_dir);
        }
    }
}

/// 证书签发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerKind {
    /// 自签名证书
    #[default]
    SelfSigned,
    /// ACME（HTTP-01 挑战，由 HTTP 监听端口应答）
    Acme,
}

/// 自签名证书有效期上限（天）
pub const MAX_VALIDITY_DAYS: u64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerSettings {
    #[serde(default)]
    pub kind: IssuerKind,
    /// 自签名证书有效期；ACME 证书的有效期由 CA 决定
    #[serde(default = "default_validity_days")]
    pub validity_days: u64,
    #[serde(default)]
    pub acme: AcmeSettings,
}

fn default_validity_days() -> u64 {
    90
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            kind: IssuerKind::default(),
            validity_days: default_validity_days(),
            acme: AcmeSettings::default(),
        }
    }
}

impl IssuerSettings {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_days.saturating_mul(24 * 60 * 60))
    }
}

/// ACME 账户与目录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    /// 账户联系邮箱
    #[serde(default)]
    pub email: String,
    /// "letsencrypt"、"letsencrypt-staging" 或 https 目录地址
    #[serde(default = "default_acme_directory")]
    pub directory: String,
    /// 账户凭据文件，省略时为 certs_dir 下的 acme-account.json
    #[serde(default)]
    pub account_file: Option<PathBuf>,
    /// 单个订单从创建到下载证书的最长时间（秒）
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

fn default_acme_directory() -> String {
    "letsencrypt".to_string()
}

fn default_order_timeout_secs() -> u64 {
    90
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            directory: default_acme_directory(),
            account_file: None,
            order_timeout_secs: default_order_timeout_secs(),
        }
    }
}

impl AcmeSettings {
    /// 目录别名解析为 URL；无法识别时返回 None
    pub fn directory_url(&self) -> Option<String> {
        crate::cert::acme::resolve_directory(&self.directory)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    /// 账户凭据文件路径
    pub fn account_path(&self, certs_dir: &Path) -> PathBuf {
        self.account_file
            .clone()
            .unwrap_or_else(|| certs_dir.join("acme-account.json"))
    }
}

impl ProxyConfig {
    /// 从 TOML 文本解析并验证
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ProxyConfig = toml::from_str(content).context("Failed to parse TOML")?;
        ConfigValidator::validate(&config).context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载；存储路径按配置文件所在目录解析
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config =
            Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))?;

        if let Some(base) = path.parent() {
            config.store.resolve_relative_to(base);
            if let Some(account_file) = config.issuer.acme.account_file.as_mut() {
                if account_file.is_relative() {
                    *account_file = base.join(&*account_file);
                }
            }
        }
        Ok(config)
    }
}
