use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{IssuerKind, ProxyConfig};
use crate::store::HostsFile;

#[derive(Parser, Debug)]
#[command(name = "sni-gate")]
#[command(author, version, about = "Multi-tenant TLS-terminating reverse proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: PathBuf,
    },
    /// 检查配置文件与主机配置是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: PathBuf,
    },
    /// 输出配置模板
    Template {
        /// 模板类型 (proxy, hosts)
        #[arg(value_parser = ["proxy", "hosts"])]
        template_type: String,

        /// 输出文件路径（缺省输出到标准输出）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

const PROXY_TEMPLATE: &str = include_str!("../templates/proxy.toml");
const HOSTS_TEMPLATE: &str = include_str!("../templates/hosts.toml");

/// 模板内容
pub fn template_content(template_type: &str) -> Option<&'static str> {
    match template_type {
        "proxy" => Some(PROXY_TEMPLATE),
        "hosts" => Some(HOSTS_TEMPLATE),
        _ => None,
    }
}

/// 输出配置模板
pub fn generate_template(template_type: &str, output: Option<&Path>) -> Result<()> {
    let content = template_content(template_type)
        .with_context(|| format!("Unknown template type: {}", template_type))?;

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write template to {:?}", path))?;
        println!("Generated {} template: {}", template_type, path.display());
    } else {
        println!("{}", content);
    }

    Ok(())
}

/// 检查配置并打印摘要
pub fn check_config(path: &Path) -> Result<()> {
    let config = ProxyConfig::from_file(path)?;
    let hosts = HostsFile::load(&config.store.hosts_file)?;

    println!("✓ Configuration file is valid: {}", path.display());
    println!();
    println!("  HTTP address:       {}", config.server.http_addr);
    println!("  HTTPS address:      {}", config.server.https_addr);
    println!("  Listeners per port: {}", config.server.listener_count());
    println!(
        "  Trusted header:     {} ({} networks)",
        config.trust.header,
        config.trust.networks.len()
    );
    println!(
        "  Route cache:        {} entries, ttl {}s",
        config.cache.route_capacity, config.cache.route_ttl_secs
    );
    println!("  Certificate cache:  {} entries", config.cache.cert_capacity);
    println!("  Certificates dir:   {}", config.store.certs_dir.display());
    match config.issuer.kind {
        IssuerKind::SelfSigned => println!(
            "  Issuer:             self-signed, {} days",
            config.issuer.validity_days
        ),
        IssuerKind::Acme => println!(
            "  Issuer:             acme {} ({})",
            config.issuer.acme.directory, config.issuer.acme.email
        ),
    }
    println!();
    println!(
        "✓ Hosts file is valid: {} ({} proxies, {} hosts)",
        config.store.hosts_file.display(),
        hosts.proxies.len(),
        hosts.host_count()
    );
    for proxy in &hosts.proxies {
        let enabled = proxy.backends.iter().filter(|b| b.enabled).count();
        println!(
            "  - {}: {} -> {} backend(s){}",
            proxy.name,
            proxy.hosts.join(", "),
            enabled,
            if proxy.force_https { ", force https" } else { "" }
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["sni-gate", "--log-level", "debug", "run", "-c", "a.toml"])
            .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run { config } => assert_eq!(config, PathBuf::from("a.toml")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_template_rejects_unknown() {
        assert!(Cli::try_parse_from(["sni-gate", "template", "server"]).is_err());
    }

    #[test]
    fn test_templates_parse() {
        let config = ProxyConfig::parse(template_content("proxy").unwrap()).unwrap();
        assert_eq!(config.cache.route_capacity, 1000);

        let hosts = HostsFile::parse(template_content("hosts").unwrap()).unwrap();
        assert!(!hosts.proxies.is_empty());
    }
}
