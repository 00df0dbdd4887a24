mod api;
mod config;
mod crypto;
mod db;
mod dispatcher;
mod error;
mod fcm;
mod logging;
mod memory_store;
mod metrics;
mod models;
mod payload;
mod queue;
mod resolver;
mod store;
mod transport;
mod web_push;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use config::Config;
use dispatcher::FanOutDispatcher;
use fcm::FcmTransport;
use payload::PayloadBuilder;
use queue::DispatchQueue;
use store::Store;
use transport::TransportRouter;
use web_push::WebPushTransport;

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async {
        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        logging::setup_logging();

        info!("Starting Social Push Notification Service");

        let config = Config::from_env()?;

        match config.database_url.clone() {
            Some(database_url) => {
                let db_pool = db::init_db_pool(&database_url).await?;
                let store = db::PgStore::new(db_pool, config.profile_cache_ttl);
                serve(config, store).await
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory store; nothing will persist");
                serve(config, memory_store::MemoryStore::new()).await
            }
        }
    })
}

async fn serve<S: Store>(config: Config, store: S) -> Result<()> {
    let store = Arc::new(store);

    if config.fcm.is_none() {
        warn!("FCM_PROJECT_ID / FCM_ACCESS_TOKEN not set, FCM devices will not receive pushes");
    }
    let transport = Arc::new(TransportRouter::new(
        FcmTransport::new(config.fcm.clone(), config.push_timeout)?,
        WebPushTransport::new(config.push_timeout, config.vapid.as_ref())?,
    ));

    let dispatcher = Arc::new(FanOutDispatcher::new(
        store.clone(),
        transport,
        PayloadBuilder::new(config.default_notification_icon.clone()),
        config.max_in_flight_sends,
    ));

    let (queue, event_receiver) = DispatchQueue::new(config.dispatch_queue_capacity);
    let worker_handle = tokio::spawn(queue::run_dispatch_worker(event_receiver, dispatcher, None));

    let api_state = Arc::new(api::ApiState {
        store,
        queue,
        api_key: config.api_key.clone(),
    });
    let api_router = api::create_api_router(api_state);

    info!("Starting API server on {}", config.api_bind_address);
    let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.api_bind_address))?;

    axum::serve(listener, api_router)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Received shutdown signal, shutting down gracefully");
        })
        .await
        .context("API server failed")?;

    // The router held the last queue sender; the worker drains and exits.
    let _ = worker_handle.await;

    info!("Shutdown complete");
    Ok(())
}
