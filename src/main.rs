use anyhow::Result;
use clap::Parser;
use sni_gate::cli::{self, Cli, Commands};
use sni_gate::config::ProxyConfig;
use sni_gate::server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先于 --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Check { config } => {
            cli::check_config(config)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            cli::generate_template(template_type, output.as_deref())?;
        }
        Commands::Run { config } => {
            info!("SNI Gate v{}", env!("CARGO_PKG_VERSION"));
            info!("Loading configuration from: {}", config.display());
            let config = ProxyConfig::from_file(config)?;

            server::run_server(config).await?;
        }
    }

    Ok(())
}
