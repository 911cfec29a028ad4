//! mirrorpool Gateway
//!
//! HTTP front end for chunked uploads into the primary account pool and
//! reads with backup fallback.

mod routes;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mirrorpool_common::Config;
use mirrorpool_core::{
    FsPrimaryStore, FsSecondaryStore, ServiceDeps, StorageService, budget_from_config,
};
use mirrorpool_meta_store::RedbMetaStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "mirrorpool-gateway")]
#[command(about = "mirrorpool upload and read gateway")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "MIRRORPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `network.listen`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

/// Layer the optional config file under `MIRRORPOOL__*` environment overrides
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    let config: Config = builder
        .add_source(
            config::Environment::with_prefix("MIRRORPOOL")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("failed to parse configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting mirrorpool gateway");

    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.network.listen = listen;
    }
    info!(
        "{} primary accounts, metadata at {}, backups under {}",
        config.pool.accounts.len(),
        config.storage.metadata_path.display(),
        config.storage.secondary_root.display()
    );

    let meta = RedbMetaStore::open(&config.storage.metadata_path).with_context(|| {
        format!(
            "failed to open metadata store {}",
            config.storage.metadata_path.display()
        )
    })?;
    let deps = ServiceDeps {
        primary: Arc::new(FsPrimaryStore::new()),
        secondary: Arc::new(FsSecondaryStore::new(&config.storage.secondary_root)),
        meta: Arc::new(meta),
        budget: budget_from_config(&config.admission),
    };

    let listen = config.network.listen;
    let service =
        Arc::new(StorageService::start(config, deps).context("failed to start service")?);
    let app = routes::router(Arc::clone(&service));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("Gateway listening on {}", listen);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    service.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[admission]
max_concurrent_uploads = 2

[[pool.accounts]]
id = "a"
endpoint = "/srv/a"
quota_bytes = 1048576
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.admission.max_concurrent_uploads, 2);
        assert_eq!(config.pool.accounts.len(), 1);
        assert_eq!(config.pool.accounts[0].quota_bytes, 1_048_576);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[admission]\nmax_concurrent_uploads = 0").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }
}
