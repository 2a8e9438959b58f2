use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chunkgw::metadata::{BackupCatalog, PostgresMetadata};
use chunkgw::storage::{BackendFactory, ObjectStoreFactory};
use chunkgw::{config, server, Gateway};

#[derive(Parser, Debug)]
#[command(name = "chunkgw", version, about = "Object gateway for database backup chunks")]
struct Cli {
    /// Gateway config file (TOML, or JSON with a .json suffix)
    #[arg(short, long, env = "CHUNKGW_CONFIG")]
    config: PathBuf,

    /// Overrides `log_level` from the config file; RUST_LOG overrides both
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    let factory = ObjectStoreFactory;
    let storage = factory.open(&config.storage)?;
    let backup_storage = factory.open(config.backup_storage())?;
    let metadata = PostgresMetadata::new(config.metadata.clone(), BackupCatalog::new(backup_storage));

    if config.crypto.is_some() {
        tracing::warn!(
            "crypto is configured but no crypter is linked into this build; \
             encrypted requests will fail"
        );
    }

    let gw = Arc::new(Gateway::new(config, storage, Arc::new(metadata)));
    server::run(gw).await
}
