use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storage_orchestrator::{
    api,
    backend::StorageBackend,
    cache::{CounterCache, MemoryCache, RedisCache},
    config::{Config, StorageProviderConfig},
    events::{EventBus, EventType, TracingHandler},
    metrics, object_store as obj,
    preprocess::Passthrough,
    scheduler,
    storage::Database,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "storage-orchestrator starting");

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration for node: {}", config.node.id);

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Local store is always present: uploads are staged there and it is the last fallback
    let local = Arc::new(obj::LocalStore::new(&config.storage.local_storage_path)?);
    info!(
        "Using local storage at: {}",
        config.storage.local_storage_path
    );

    let mut remotes: Vec<Arc<dyn obj::ObjectStore>> = Vec::new();
    for provider in config.remote_providers() {
        match provider {
            StorageProviderConfig::ManagedObjectStore {
                bucket,
                credentials_file,
            } => {
                let store = obj::GcsStore::new(
                    bucket,
                    credentials_file.as_deref(),
                    config.storage.remote_timeout,
                )
                .await?;
                info!("Using managed object store, bucket: {}", bucket);
                remotes.push(Arc::new(store));
            }
            StorageProviderConfig::S3Compatible {
                endpoint,
                bucket,
                region,
                access_key_id,
                secret_access_key,
                path_style,
            } => {
                let store = obj::S3Store::new(
                    endpoint,
                    bucket,
                    region,
                    obj::S3Credentials {
                        access_key_id: access_key_id.clone(),
                        secret_access_key: secret_access_key.clone(),
                    },
                    *path_style,
                    config.storage.remote_timeout,
                )?;
                info!("Using S3-compatible store at {}, bucket: {}", endpoint, bucket);
                remotes.push(Arc::new(store));
            }
            StorageProviderConfig::Local => {}
        }
    }
    let backend = StorageBackend::new(
        local,
        remotes,
        config.storage.remote_timeout,
        config.storage.remote_retries,
    );

    // Counter cache
    let cache: Arc<dyn CounterCache> = match config.cache.redis_url {
        Some(ref url) => {
            let cache = RedisCache::new(
                url,
                &config.cache.key_prefix,
                config.cache.pool_size,
                config.cache.timeout,
            )?;
            info!("Using Redis counter cache");
            Arc::new(cache)
        }
        None => {
            warn!("No CACHE_REDIS_URL set, counters are kept in process memory");
            Arc::new(MemoryCache::new())
        }
    };

    // Event bus: durable if the broker answers now, in-process otherwise
    let events = Arc::new(EventBus::connect(&config.events, &config.node.id).await);
    for event_type in EventType::ALL {
        events.subscribe(event_type, Arc::new(TracingHandler));
    }

    metrics::register_metrics();

    let state = Arc::new(AppState::assemble(
        config.clone(),
        db,
        backend,
        cache,
        Arc::clone(&events),
        Arc::new(Passthrough),
    ));

    // Background loops
    let cancel = CancellationToken::new();
    let mut handles = events.start_consumers(cancel.clone());
    handles.extend(scheduler::spawn(
        Arc::clone(&state.lifecycle),
        Arc::clone(&state.quota),
        Arc::clone(&state.metadata),
        config.lifecycle.sweep_interval,
        config.reconcile_interval,
        cancel.clone(),
    ));

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop loops, then drain accepted background work
    info!("Shutting down background tasks");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }
    state.queue.shutdown(config.workers.shutdown_grace).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
