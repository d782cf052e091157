use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txbatch::config::{LogFormat, ServiceConfig, StoreBackend};
use txbatch::server::{BatchServer, HealthCheck};
use txbatch::service::BatchService;
use txbatch::store::{MemoryStore, StoreGateway};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::parse();
    init_tracing(&config.log_level, config.log_format);

    let store = connect_store(&config).await?;
    let batch_config = config.batch_config();
    let service = BatchService::new(store, &batch_config);
    let server = BatchServer::new(
        &config.service_name,
        service,
        HealthCheck::new(&config.health_check_path),
    );

    let listener = BatchServer::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal...");
        }
        signal.cancel();
    });

    info!(
        service = %config.service_name,
        audit_enabled = batch_config.audit_enabled,
        write_concern = %batch_config.write_concern,
        "Starting service"
    );
    server.serve(listener, shutdown).await?;
    Ok(())
}

fn init_tracing(log_level: &str, log_format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn connect_store(config: &ServiceConfig) -> Result<Arc<dyn StoreGateway>> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Mongo => connect_mongo(config).await,
    }
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(config: &ServiceConfig) -> Result<Arc<dyn StoreGateway>> {
    let gateway = txbatch::store::MongoGateway::connect(
        &config.mongo_url,
        &config.db_name,
        config.db_pool_size,
    )
    .await
    .context("failed to connect to MongoDB")?;
    info!(database = %config.db_name, pool_size = config.db_pool_size, "Connected to MongoDB");
    Ok(Arc::new(gateway))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_config: &ServiceConfig) -> Result<Arc<dyn StoreGateway>> {
    anyhow::bail!("STORE_BACKEND=mongo requires building with the `mongodb` feature")
}
