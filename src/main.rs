use catalog_sync::broker::{AmqpTransport, MemoryBroker, Transport};
use catalog_sync::catalog::{Catalog, CatalogStores};
use catalog_sync::config::{CatalogConfig, StoreBackend};
use catalog_sync::connection::ConnectionManager;
use catalog_sync::consumer::Dispatcher;
use catalog_sync::health;
use catalog_sync::service::SyncServer;
use catalog_sync::shutdown::ShutdownSignal;
use catalog_sync::subscription::SubscriptionRegistry;
use catalog_sync::validation::SchemaValidator;
use deadpool_redis::Runtime;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting catalog-sync v{}", env!("CARGO_PKG_VERSION"));

    // 2. Load Configuration
    let config = CatalogConfig::load()?;

    // 3. Stores and sync services
    let stores = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, synchronized data is lost on exit");
            CatalogStores::in_memory()
        }
        StoreBackend::Redis => {
            let pool = deadpool_redis::Config::from_url(config.store.url.clone())
                .create_pool(Some(Runtime::Tokio1))?;
            CatalogStores::redis(pool, &config.store.prefix)
        }
    };

    let catalog = Catalog::new(stores, Arc::new(SchemaValidator::new()))
        .with_queue_options(config.consumer.queue_options());
    let mut registry = SubscriptionRegistry::new();
    catalog.register(&mut registry);

    // 4. Broker
    let transport: Arc<dyn Transport> = if config.broker.is_memory() {
        warn!("Using the in-process broker, no upstream events will arrive");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpTransport::new())
    };
    let manager = ConnectionManager::new(
        transport,
        config.broker.uri.clone(),
        config.broker.connect_options(),
        config.broker.reconnect_policy(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        config.consumer.dead_letter_policy(),
        config.consumer.failure_outcome,
    ));

    let server = Arc::new(SyncServer::new(
        manager,
        dispatcher,
        config.topology(),
        &registry,
        config.broker.consumer_tag(),
    ));
    server.start().await?;

    // 5. Health server and graceful shutdown
    let shutdown = ShutdownSignal::new();
    let http = tokio::spawn(health::serve(
        health::router(server.clone()),
        config.server.port,
        shutdown.clone(),
    ));

    shutdown.wait().await;

    if let Err(e) = server.stop().await {
        error!(error = %e, "Failed to close broker connection");
    }

    match tokio::time::timeout(shutdown.timeout(), http).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Health server failed"),
        Ok(Err(e)) => error!(error = %e, "Health server task panicked"),
        Err(_) => warn!("Health server did not stop in time"),
    }

    info!("catalog-sync shutdown complete");
    Ok(())
}
