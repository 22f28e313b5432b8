use anyhow::Result;
use tracing::info;

mod auth;
mod config;
mod db;
mod server;
mod telemetry;

pub use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("PERCH_LOG_PRETTY").map(|v| v == "1" || v.to_lowercase() == "true") == Ok(true)
    {
        telemetry::init_local()
            .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    } else {
        telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    }

    info!("Perch starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    config.log_config();

    let db = match &config.db_path {
        Some(path) => db::Database::open_local("perch", path).await?,
        None => db::Database::in_memory("perch").await?,
    };

    db::MigrationRunner::global().run(&db).await?;
    info!("Database initialized and migrations complete");

    server::start(config, db).await?;

    Ok(())
}
