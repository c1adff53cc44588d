//! SNI Gate 库入口
//!
//! 多租户 TLS 终止反向代理的核心模块，导出为库方便测试和复用
pub mod cert;
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod route;
pub mod server;
pub mod store;
pub mod tls;
pub mod trust;
pub mod upstream;

// 重新导出常用类型
pub use cert::{
    AcmeIssuer, CertificateCache, CertificateResolver, Http01Challenges, Issuer, SelfSignedIssuer,
};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use forwarder::{InboundScheme, RequestForwarder};
pub use route::{Backend, RouteCache, RoutingResolver, SelectedTarget, TargetConfig};
pub use server::{ProxyDependencies, ProxyServer, ProxyState};
pub use store::{ConfigStore, FileStore, MemoryStore, StoredCertificate};
pub use tls::TlsCertificate;
pub use trust::TrustedProxyResolver;
