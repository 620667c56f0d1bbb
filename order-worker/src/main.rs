//! Consume the order stream and persist each order at most once.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::sync::watch;

use order_common::dedup::DuplicateFilter;
use order_common::health::HealthRegistry;
use order_common::lock::LockManager;
use order_common::metrics::{serve, setup_metrics_recorder};
use order_common::records::PgOrderStore;
use order_common::redis::{Client, RedisClient};
use order_common::stream::StreamConsumer;
use order_worker::config::Config;
use order_worker::error::WorkerError;
use order_worker::handlers;
use order_worker::worker::OrderWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    // Startup is the only place connectivity failures are fatal: once the
    // loop runs, store errors are retried on later cycles.
    let client: Arc<dyn Client + Send + Sync> =
        Arc::new(RedisClient::new(config.redis_url.clone()).await?);

    let store = Arc::new(
        PgOrderStore::new(&config.database_url, config.max_pg_connections).await?,
    );
    sqlx::migrate!("./migrations")
        .run(store.pool())
        .await
        .expect("failed to run migrations");

    let consumer_name = config.consumer_name();
    let consumer = StreamConsumer::new(
        client.clone(),
        config.stream_name.as_str(),
        config.group_name.as_str(),
        &consumer_name,
    );
    consumer.ensure_group().await?;

    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let worker = OrderWorker::new(
        consumer,
        LockManager::new(client.clone(), config.lock_ttl.0),
        DuplicateFilter::new(client, store.clone(), config.dedup_ttl.0),
        store,
        config.poll_interval.0,
        config.batch_size,
        worker_liveness,
    );

    let bind = config.bind();
    let app = handlers::app(liveness, Some(setup_metrics_recorder()));
    tokio::task::spawn(async move {
        serve(app, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for the shutdown signal");
        _ = shutdown_tx.send(true);
    });

    tracing::info!(consumer = %consumer_name, "starting order worker");
    worker.run(shutdown_rx).await;

    Ok(())
}
