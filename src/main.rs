//! Proxychain CLI entry point
//!
//! Starts the endpoints described by a YAML configuration file: an optional
//! anonymized proxy for the configured upstream, plus any number of CONNECT
//! tunnels, then runs until interrupted.

use clap::Parser;
use proxychain::{AnonymizeOptions, Config, ProxyChain, TunnelOptions, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "proxychain")]
#[command(version = VERSION)]
#[command(about = "Anonymizing HTTP proxy chaining and CONNECT tunnels")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "proxychain.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured log level
    let default_directive = format!(
        "proxychain={}",
        config.log_level.as_deref().unwrap_or("info")
    );
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .init();

    info!("proxychain v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let chain = ProxyChain::new();
    let upstream = match config.upstream_proxy.clone() {
        Some(upstream) => upstream,
        None => {
            error!("Nothing to run: upstream-proxy is not configured");
            std::process::exit(1);
        }
    };

    if let Some(anonymize) = &config.anonymize {
        let url = chain
            .anonymize_proxy(
                &upstream,
                AnonymizeOptions {
                    port: anonymize.port,
                    port_retries: config.port_retries,
                },
            )
            .await?;
        info!("Anonymized proxy available at {}", url);
    }

    for tunnel in &config.tunnels {
        let path = chain
            .create_tunnel(
                &upstream,
                &tunnel.target,
                TunnelOptions {
                    port: tunnel.port,
                    hostname: tunnel.hostname.clone(),
                    port_retries: config.port_retries,
                },
            )
            .await?;
        info!("Tunnel to {} available at {}", tunnel.target, path);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    chain.shutdown();
    info!("All listeners closed");
    Ok(())
}
