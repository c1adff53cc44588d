// 入站服务：HTTP / HTTPS 监听、连接处理与后台任务

pub mod connection;
pub mod listener;

use crate::cert::{
    AcmeConfig, AcmeIssuer, CertificateCache, CertificateResolver, Http01Challenges, Issuer,
    SelfSignedIssuer,
};
use crate::config::{IssuerKind, ProxyConfig};
use crate::error::ProxyError;
use crate::forwarder::{InboundScheme, RequestForwarder};
use crate::route::{RouteCache, RoutingResolver};
use crate::store::{ConfigStore, FileStore};
use crate::trust::TrustedProxyResolver;
use crate::upstream::build_upstream_client;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 外部依赖（配置存储、证书签发者），测试时可替换
pub struct ProxyDependencies {
    pub store: Arc<dyn ConfigStore>,
    pub issuer: Arc<dyn Issuer>,
    /// HTTP 监听端口应答的 ACME 挑战，与签发者共享
    pub challenges: Arc<Http01Challenges>,
}

impl ProxyDependencies {
    pub fn new(store: Arc<dyn ConfigStore>, issuer: Arc<dyn Issuer>) -> Self {
        Self {
            store,
            issuer,
            challenges: Arc::new(Http01Challenges::new()),
        }
    }
}

/// 服务器共享状态
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub trust: Arc<TrustedProxyResolver>,
    pub route_cache: Arc<RouteCache>,
    pub routes: Arc<RoutingResolver>,
    pub certificates: Arc<CertificateResolver>,
    pub forwarder: Arc<RequestForwarder>,
    pub challenges: Arc<Http01Challenges>,
}

impl ProxyState {
    /// 按配置创建：文件存储 + 配置指定的签发者
    ///
    /// 受信任网段最先构建，格式错误时在打开存储和绑定端口之前失败。
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let trust = build_trust(&config)?;

        let store = FileStore::open(&config.store.hosts_file, &config.store.certs_dir)
            .context("Failed to open configuration store")?;
        let challenges = Arc::new(Http01Challenges::new());
        let issuer = build_issuer(&config, Arc::clone(&challenges))?;

        Self::assemble(
            config,
            trust,
            ProxyDependencies {
                store: Arc::new(store),
                issuer,
                challenges,
            },
        )
    }

    /// 使用自定义依赖创建
    pub fn with_dependencies(config: ProxyConfig, deps: ProxyDependencies) -> Result<Self> {
        let trust = build_trust(&config)?;
        Self::assemble(config, trust, deps)
    }

    fn assemble(
        config: ProxyConfig,
        trust: TrustedProxyResolver,
        deps: ProxyDependencies,
    ) -> Result<Self> {
        let trust = Arc::new(trust);
        let route_cache = Arc::new(RouteCache::with_capacity_and_ttl(
            config.cache.route_capacity,
            config.cache.route_ttl(),
        ));
        let routes = Arc::new(RoutingResolver::new(
            Arc::clone(&deps.store),
            Arc::clone(&route_cache),
        ));
        let certificates = Arc::new(CertificateResolver::new(
            Arc::new(CertificateCache::with_capacity(config.cache.cert_capacity)),
            Arc::clone(&deps.store),
            deps.issuer,
        ));

        let upstream = config.upstream.to_upstream_config();
        let client =
            build_upstream_client(&upstream).context("Failed to create upstream client")?;
        let forwarder = Arc::new(
            RequestForwarder::new(
                Arc::clone(&routes),
                Arc::clone(&trust),
                client,
                upstream.request_timeout,
            )
            .with_challenges(Arc::clone(&deps.challenges)),
        );

        Ok(Self {
            config: Arc::new(config),
            trust,
            route_cache,
            routes,
            certificates,
            forwarder,
            challenges: deps.challenges,
        })
    }
}

fn build_issuer(
    config: &ProxyConfig,
    challenges: Arc<Http01Challenges>,
) -> Result<Arc<dyn Issuer>> {
    match config.issuer.kind {
        IssuerKind::SelfSigned => {
            info!(
                "Issuing self-signed certificates valid for {} days",
                config.issuer.validity_days
            );
            Ok(Arc::new(SelfSignedIssuer::new(config.issuer.validity())))
        }
        IssuerKind::Acme => {
            let acme = &config.issuer.acme;
            let directory_url = acme.directory_url().ok_or_else(|| {
                ProxyError::config_error(format!("unknown ACME directory '{}'", acme.directory))
            })?;
            info!("Issuing ACME certificates from {}", directory_url);

            let issuer = AcmeIssuer::new(
                AcmeConfig {
                    directory_url,
                    contacts: vec![acme.email.trim().to_string()],
                    account_file: acme.account_path(&config.store.certs_dir),
                    order_timeout: acme.order_timeout(),
                },
                challenges,
            );
            Ok(Arc::new(issuer))
        }
    }
}

fn build_trust(config: &ProxyConfig) -> Result<TrustedProxyResolver> {
    let trust = TrustedProxyResolver::new(&config.trust.networks, config.trust.header.clone())
        .context("Failed to load trusted networks")?;
    info!(
        "Trusting {} header from {} networks",
        trust.header_name(),
        trust.network_count()
    );
    Ok(trust)
}

/// 已绑定端口、尚未开始服务的代理服务器
pub struct ProxyServer {
    state: Arc<ProxyState>,
    http: Vec<TcpListener>,
    https: Vec<TcpListener>,
}

impl ProxyServer {
    /// 绑定 HTTP 与 HTTPS 监听端口（需在 tokio 运行时内调用）
    pub fn bind(state: Arc<ProxyState>) -> Result<Self> {
        let server = &state.config.server;
        let count = server.listener_count();

        let http_addr = server.http_socket_addr()?;
        let https_addr = server.https_socket_addr()?;

        let http = listener::bind_group(http_addr, count)
            .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;
        let https = listener::bind_group(https_addr, count)
            .with_context(|| format!("Failed to bind HTTPS listener on {}", https_addr))?;

        Ok(Self { state, http, https })
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.first().and_then(|l| l.local_addr().ok())
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.first().and_then(|l| l.local_addr().ok())
    }

    /// 运行直到 `shutdown` 完成；停止接受新连接后返回
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let (Some(http), Some(https)) = (self.http_addr(), self.https_addr()) {
            info!(
                "Listening on http://{} and https://{} ({} listeners per port)",
                http,
                https,
                self.http.len()
            );
        }
        let state = self.state;

        let mut tasks = JoinSet::new();
        for listener in self.http {
            tasks.spawn(accept_loop(listener, InboundScheme::Http, Arc::clone(&state)));
        }
        for listener in self.https {
            tasks.spawn(accept_loop(listener, InboundScheme::Https, Arc::clone(&state)));
        }

        let cleanup = Arc::clone(&state.route_cache)
            .start_cleanup_task(state.config.cache.cleanup_interval());

        shutdown.await;

        info!("Shutting down, no longer accepting connections");
        cleanup.abort();
        tasks.shutdown().await;

        info!("Server stopped gracefully");
        Ok(())
    }
}

/// 按配置启动服务器，直到收到 Ctrl+C
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let state = Arc::new(ProxyState::new(config)?);
    let server = ProxyServer::bind(state)?;

    info!("Press Ctrl+C to stop");
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
}

async fn accept_loop(listener: TcpListener, scheme: InboundScheme, state: Arc<ProxyState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // 文件描述符耗尽等情况下避免空转
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match scheme {
                InboundScheme::Http => {
                    connection::serve_http(stream, peer, Arc::clone(&state.forwarder)).await;
                }
                InboundScheme::Https => {
                    let result = connection::serve_https(
                        stream,
                        peer,
                        Arc::clone(&state.certificates),
                        Arc::clone(&state.forwarder),
                        state.config.server.handshake_timeout(),
                    )
                    .await;

                    match result {
                        Ok(()) => {}
                        Err(e @ ProxyError::Issuance(_)) => {
                            warn!("TLS handshake with {} failed: {}", peer, e)
                        }
                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                    }
                }
            }
        });
    }
}
