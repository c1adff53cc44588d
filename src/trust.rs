use crate::error::{ProxyError, Result};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// 上游 CDN 写入真实客户端地址的请求头
pub const DEFAULT_TRUSTED_HEADER: &str = "CF-Connecting-IP";

/// Cloudflare 公布的边缘网络地址段
pub const CLOUDFLARE_NETWORKS: &[&str] = &[
    // IPv4
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
    // IPv6
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

/// 受信任上游网络判定与真实客户端 IP 解析
///
/// 启动时加载一次，之后只读；任何一个网段解析失败都会返回配置错误。
/// 只有来自受信任网段的对端才会采信请求头中的地址，防止客户端伪造。
#[derive(Debug, Clone)]
pub struct TrustedProxyResolver {
    networks: Vec<IpNetwork>,
    header: String,
}

impl TrustedProxyResolver {
    /// 从 CIDR 列表创建
    pub fn new<S: AsRef<str>>(cidrs: &[S], header: impl Into<String>) -> Result<Self> {
        let header = header.into();
        if header.trim().is_empty() {
            return Err(ProxyError::config_error("trusted header name cannot be empty"));
        }

        let networks = cidrs
            .iter()
            .map(|cidr| {
                let cidr = cidr.as_ref().trim();
                cidr.parse::<IpNetwork>().map_err(|e| {
                    ProxyError::config_error(format!("invalid trusted network '{}': {}", cidr, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { networks, header })
    }

    /// 使用 Cloudflare 网段和 `CF-Connecting-IP` 头创建
    pub fn cloudflare() -> Result<Self> {
        Self::new(CLOUDFLARE_NETWORKS, DEFAULT_TRUSTED_HEADER)
    }

    /// 受信任的请求头名称
    pub fn header_name(&self) -> &str {
        &self.header
    }

    /// 已加载的网段数量
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    /// 判断 IP 是否属于任一受信任网段
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// 根据对端地址与受信任请求头推导真实客户端 IP
    ///
    /// `peer` 接受 `ip:port` 或裸 IP；无法解析时返回 `None`，调用方不得使用。
    pub fn real_client_ip(&self, peer: &str, header_value: Option<&str>) -> Option<IpAddr> {
        let peer_ip = match peer.parse::<SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => peer.parse::<IpAddr>().ok()?,
        };
        Some(self.client_ip_for(peer_ip, header_value))
    }

    /// 与 [`real_client_ip`](Self::real_client_ip) 相同，但对端地址已是结构化形式
    pub fn client_ip_for(&self, peer_ip: IpAddr, header_value: Option<&str>) -> IpAddr {
        let peer_ip = peer_ip.to_canonical();

        if !self.is_trusted(peer_ip) {
            return peer_ip;
        }

        match header_value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => match value.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => {
                    debug!(
                        "Malformed {} header '{}' from trusted peer {}, using peer address",
                        self.header, value, peer_ip
                    );
                    peer_ip
                }
            },
            None => peer_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TrustedProxyResolver {
        TrustedProxyResolver::cloudflare().unwrap()
    }

    #[test]
    fn test_builtin_networks_parse() {
        let r = resolver();
        assert_eq!(r.network_count(), CLOUDFLARE_NETWORKS.len());
        assert_eq!(r.header_name(), "CF-Connecting-IP");
    }

    #[test]
    fn test_invalid_network_is_config_error() {
        let err = TrustedProxyResolver::new(&["10.0.0.0/8", "not-a-cidr"], "X-Real-IP").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("not-a-cidr"));
    }

    #[test]
    fn test_empty_header_is_config_error() {
        let err = TrustedProxyResolver::new(&["10.0.0.0/8"], " ").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_is_trusted() {
        let r = resolver();
        assert!(r.is_trusted("173.245.48.1".parse().unwrap()));
        assert!(r.is_trusted("2606:4700::1111".parse().unwrap()));
        assert!(!r.is_trusted("8.8.8.8".parse().unwrap()));
        assert!(!r.is_trusted("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_peer_is_trusted() {
        let r = resolver();
        assert!(r.is_trusted("::ffff:173.245.48.1".parse().unwrap()));
    }

    #[test]
    fn test_untrusted_peer_ignores_header() {
        let r = resolver();
        let ip = r.real_client_ip("8.8.8.8:5555", Some("1.2.3.4")).unwrap();
        assert_eq!(ip, "8.8.8.8".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_trusted_peer_uses_header() {
        let r = resolver();
        let ip = r
            .real_client_ip("173.245.48.10:443", Some("203.0.113.7"))
            .unwrap();
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_trusted_peer_malformed_header_falls_back() {
        let r = resolver();
        let ip = r
            .real_client_ip("173.245.48.10:443", Some("203.0.113.7, 10.0.0.1"))
            .unwrap();
        assert_eq!(ip, "173.245.48.10".parse::<IpAddr>().unwrap());

        let ip = r.real_client_ip("173.245.48.10:443", None).unwrap();
        assert_eq!(ip, "173.245.48.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_unparseable_peer() {
        let r = resolver();
        assert!(r.real_client_ip("garbage", Some("1.2.3.4")).is_none());
        assert!(r.real_client_ip("", None).is_none());
    }

    #[test]
    fn test_ipv6_peer_with_port() {
        let r = resolver();
        let ip = r
            .real_client_ip("[2606:4700::1]:443", Some("2001:db8::42"))
            .unwrap();
        assert_eq!(ip, "2001:db8::42".parse::<IpAddr>().unwrap());
    }
}
