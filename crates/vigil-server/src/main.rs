use anyhow::Result;
use chrono::Utc;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vigil_notify::{ChannelTransport, PlaceholderRenderer};
use vigil_sched::{Collaborators, RuleSet, Schedule};
use vigil_storage::SqliteStore;

use vigil_server::app;
use vigil_server::config::ServerConfig;
use vigil_server::evaluator::HttpEvaluator;
use vigil_server::state::AppState;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  vigil-server [config.toml]                Start the scheduler and HTTP API");
    eprintln!("  vigil-server check-config <config.toml>   Validate a configuration file and exit");
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    vigil_common::id::init(1, 1);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("check-config") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check-config requires a <config.toml> argument")
            })?;
            let config = ServerConfig::load(config_path)?;
            tracing::info!(
                alerts = config.alerts.len(),
                notifications = config.notifications.len(),
                "Configuration is valid"
            );
            Ok(())
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/vigil.toml");
            run_server(config_path).await
        }
    }
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    tracing::info!(
        config = config_path,
        alerts = config.alerts.len(),
        notifications = config.notifications.len(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteStore::open(Path::new(&config.data_dir))?);
    let rules = Arc::new(RuleSet::new(
        config.alerts.clone(),
        config.notifications.clone(),
    ));
    let evaluator = Arc::new(HttpEvaluator::new(&config.evaluator)?);
    let renderer = Arc::new(PlaceholderRenderer::new(config.templates.clone()));
    let transport = Arc::new(ChannelTransport::new(config.smtp.as_ref())?);

    let schedule = Arc::new(Schedule::new(
        Arc::new(config.system.clone()),
        rules,
        Collaborators::from_store(store),
        evaluator,
        renderer,
        transport,
    ));
    schedule.run()?;

    let state = AppState {
        schedule: schedule.clone(),
        config: Arc::new(config.clone()),
        start_time: Utc::now(),
    };

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(addr = %http_addr, "HTTP API listening");

    let result = axum::serve(listener, app::build_http_app(state))
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            tracing::info!("Shutting down gracefully");
        })
        .await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server error");
    }

    schedule.close().await;
    result?;
    Ok(())
}
