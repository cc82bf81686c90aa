use clap::Parser;

use vitals_engine::{Relay, RelayConfig};
use vitals_transport_tcp::TcpTransport;

#[derive(Parser)]
#[command(name = "vitals-relay", about = "Routes vitals records to healthy and unhealthy topics")]
struct Cli {
    /// Path to TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long, env = "VITALS_CONFIG")]
    config: Option<String>,

    /// Print the resolved configuration (password redacted) and exit.
    #[arg(long)]
    check_config: bool,
}

fn resolve_config(cli: &Cli) -> Result<RelayConfig, vitals_engine::RelayError> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path, "loading configuration");
            RelayConfig::load(path)?
        }
        None => RelayConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler, using Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutting down...");
}

#[tokio::main]
async fn main() {
    // Variables from .env never override ones already set.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if cli.check_config {
        match config.to_redacted_toml() {
            Ok(rendered) => {
                println!("{rendered}");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                std::process::exit(1);
            }
        }
    }

    let transport = TcpTransport::new(config.broker.address.clone(), config.broker.security.clone());

    tracing::info!(
        input = %config.topics.input,
        healthy = %config.topics.healthy,
        unhealthy = %config.topics.unhealthy,
        "vitals-relay started, press Ctrl+C to stop"
    );
    let mut relay = Relay::new(&config, &transport);
    if let Err(e) = relay.run(shutdown_signal()).await {
        tracing::error!(error = %e, "relay stopped with error");
        std::process::exit(1);
    }
}
