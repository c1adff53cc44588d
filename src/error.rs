/// 自定义错误类型
///
/// 区分"永久不存在"（可负缓存）与"暂时不可用"（不缓存）两类解析失败，
/// 调用方据此决定 HTTP 状态码或是否中止 TLS 握手
use std::io;
use thiserror::Error;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 未知主机名，或该主机没有启用的后端
    #[error("No route found for host '{host}'")]
    NoRouteFound { host: String },

    /// 配置存储暂时不可用（不缓存）
    #[error("Configuration store error: {0}")]
    Store(String),

    /// TLS 握手未携带 SNI
    #[error("TLS handshake without server name")]
    NoSni,

    /// 证书自动签发失败
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// 上游连接/读写失败（非客户端取消）
    #[error("Forwarding error: {0}")]
    Forwarding(String),

    /// 启动阶段的配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 证书材料无法解析或装载
    #[error("TLS material error: {0}")]
    Tls(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建路由未找到错误
    pub fn no_route(host: impl Into<String>) -> Self {
        Self::NoRouteFound { host: host.into() }
    }

    /// 创建存储错误
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// 创建签发错误
    pub fn issuance(msg: impl Into<String>) -> Self {
        Self::Issuance(msg.into())
    }

    /// 创建转发错误
    pub fn forwarding(msg: impl Into<String>) -> Self {
        Self::Forwarding(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建证书材料错误
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// 是否为路由未找到
    pub fn is_no_route(&self) -> bool {
        matches!(self, Self::NoRouteFound { .. })
    }

    /// 是否为暂时性错误（可重试，不应缓存）
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Forwarding(_) | Self::Io(_))
    }

    /// 是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// 对外可见的 HTTP 状态码
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            Self::NoRouteFound { .. } => http::StatusCode::NOT_FOUND,
            Self::Store(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            Self::Forwarding(_) => http::StatusCode::BAD_GATEWAY,
            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
