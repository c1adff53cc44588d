use anyhow::{bail, Result};
use std::net::SocketAddr;
use tracing::warn;

use super::{
    CacheSettings, IssuerKind, IssuerSettings, ProxyConfig, ServerSettings, TrustSettings,
    UpstreamSettings, MAX_VALIDITY_DAYS,
};
use crate::trust::TrustedProxyResolver;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证完整配置
    pub fn validate(config: &ProxyConfig) -> Result<()> {
        Self::validate_server(&config.server)?;
        Self::validate_trust(&config.trust)?;
        Self::validate_cache(&config.cache)?;
        Self::validate_upstream(&config.upstream)?;
        Self::validate_issuer(&config.issuer)?;

        if config.issuer.kind == IssuerKind::Acme && config.server.handshake_timeout_secs < 30 {
            warn!(
                "server.handshake_timeout_secs = {} may be too short for ACME issuance",
                config.server.handshake_timeout_secs
            );
        }
        Ok(())
    }

    /// 验证监听地址
    pub fn validate_address(addr: &str, context: &str) -> Result<SocketAddr> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        match addr.parse() {
            Ok(addr) => Ok(addr),
            Err(e) => bail!("{}: invalid address '{}': {}", context, addr, e),
        }
    }

    /// 验证数值不为 0
    pub fn validate_nonzero(value: u64, context: &str) -> Result<()> {
        if value == 0 {
            bail!("{} cannot be 0", context);
        }
        Ok(())
    }

    pub fn validate_server(server: &ServerSettings) -> Result<()> {
        let http = Self::validate_address(&server.http_addr, "server.http_addr")?;
        let https = Self::validate_address(&server.https_addr, "server.https_addr")?;

        if http == https && http.port() != 0 {
            bail!("server.http_addr and server.https_addr must differ ({})", http);
        }

        Self::validate_nonzero(server.handshake_timeout_secs, "server.handshake_timeout_secs")?;

        if server.listeners > 256 {
            warn!("server.listeners = {} is unusually high", server.listeners);
        }
        Ok(())
    }

    /// 网段格式错误同样以配置错误返回
    pub fn validate_trust(trust: &TrustSettings) -> Result<()> {
        TrustedProxyResolver::new(&trust.networks, trust.header.clone())?;

        if trust.networks.is_empty() {
            warn!("No trusted networks configured, {} header will be ignored", trust.header);
        }
        Ok(())
    }

    pub fn validate_cache(cache: &CacheSettings) -> Result<()> {
        Self::validate_nonzero(cache.route_capacity as u64, "cache.route_capacity")?;
        Self::validate_nonzero(cache.route_ttl_secs, "cache.route_ttl_secs")?;
        Self::validate_nonzero(cache.cert_capacity as u64, "cache.cert_capacity")?;
        Self::validate_nonzero(cache.cleanup_interval_secs, "cache.cleanup_interval_secs")?;
        Ok(())
    }

    pub fn validate_upstream(upstream: &UpstreamSettings) -> Result<()> {
        Self::validate_nonzero(upstream.idle_timeout_secs, "upstream.idle_timeout_secs")?;
        Self::validate_nonzero(upstream.connect_timeout_ms, "upstream.connect_timeout_ms")?;
        Self::validate_nonzero(
            upstream.tls_handshake_timeout_ms,
            "upstream.tls_handshake_timeout_ms",
        )?;
        Self::validate_nonzero(upstream.keepalive_secs, "upstream.keepalive_secs")?;

        if let Some(timeout) = upstream.request_timeout_secs {
            Self::validate_nonzero(timeout, "upstream.request_timeout_secs")?;
        }

        if upstream.skip_verify {
            warn!("upstream.skip_verify is enabled, backend certificates will not be verified");
        }
        Ok(())
    }

    pub fn validate_issuer(issuer: &IssuerSettings) -> Result<()> {
        if issuer.validity_days == 0 || issuer.validity_days > MAX_VALIDITY_DAYS {
            bail!(
                "issuer.validity_days must be between 1 and {}, got {}",
                MAX_VALIDITY_DAYS,
                issuer.validity_days
            );
        }

        if issuer.kind != IssuerKind::Acme {
            return Ok(());
        }

        let acme = &issuer.acme;
        let email = acme.email.trim();
        if email.is_empty() {
            bail!("issuer.acme.email is required when issuer.kind = \"acme\"");
        }
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => bail!("issuer.acme.email '{}' is not a valid address", email),
        }

        if acme.directory_url().is_none() {
            bail!(
                "issuer.acme.directory '{}' must be \"letsencrypt\", \"letsencrypt-staging\" or an https URL",
                acme.directory
            );
        }
        Self::validate_nonzero(acme.order_timeout_secs, "issuer.acme.order_timeout_secs")?;
        Ok(())
    }
}
