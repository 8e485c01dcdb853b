use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::plans::Plan;
use crate::storage::models::StorageType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub dedup: DedupConfig,
    pub lifecycle: LifecycleConfig,
    pub workers: WorkerConfig,
    pub plans: PlansConfig,
    /// How often dirty owners (then all owners) get their quota recomputed
    pub reconcile_interval: Duration,
    /// Maximum upload size in bytes, applied before any plan limit
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub id: String,
}

/// One storage provider. Remotes are tried in the order they appear in
/// [`StorageConfig::providers`]; `Local` ends the chain.
#[derive(Clone)]
pub enum StorageProviderConfig {
    Local,
    S3Compatible {
        endpoint: String,
        bucket: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
        path_style: bool,
    },
    ManagedObjectStore {
        bucket: String,
        /// Path to service account JSON (optional, defaults to the metadata server)
        credentials_file: Option<String>,
    },
}

impl StorageProviderConfig {
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageProviderConfig::Local => StorageType::Local,
            StorageProviderConfig::S3Compatible { .. } => StorageType::S3Compatible,
            StorageProviderConfig::ManagedObjectStore { .. } => StorageType::ManagedObjectStore,
        }
    }

    fn priority(&self) -> u8 {
        match self {
            StorageProviderConfig::ManagedObjectStore { .. } => 0,
            StorageProviderConfig::S3Compatible { .. } => 1,
            StorageProviderConfig::Local => 2,
        }
    }
}

impl std::fmt::Debug for StorageProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProviderConfig::Local => f.write_str("Local"),
            StorageProviderConfig::S3Compatible {
                endpoint, bucket, ..
            } => f
                .debug_struct("S3Compatible")
                .field("endpoint", endpoint)
                .field("bucket", bucket)
                .finish_non_exhaustive(),
            StorageProviderConfig::ManagedObjectStore { bucket, .. } => f
                .debug_struct("ManagedObjectStore")
                .field("bucket", bucket)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root of the local store; every upload is staged here first
    pub local_storage_path: String,
    pub providers: Vec<StorageProviderConfig>,
    pub remote_timeout: Duration,
    /// Extra attempts per remote after the first one
    pub remote_retries: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Counters stay in process memory when unset
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub pool_size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Fallback (in-process) delivery when unset or unreachable at startup
    pub redis_url: Option<String>,
    pub stream_prefix: String,
    pub consumer_group: String,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Entries pending this long under any consumer are claimed for redelivery
    pub claim_idle: Duration,
    /// Deliveries after which an entry is dropped
    pub max_deliveries: u64,
    pub stream_max_len: usize,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Files below this many bytes are deduplicated before the response
    pub sync_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub sweep_interval: Duration,
    pub default_cold_after_days: u32,
    pub default_archive_after_days: u32,
    pub cold_batch: usize,
    pub archive_batch: usize,
    pub purge_batch: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct PlansConfig {
    pub catalogue: Vec<Plan>,
    pub default_plan: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_path: "./files".to_string(),
            providers: vec![StorageProviderConfig::Local],
            remote_timeout: Duration::from_secs(30),
            remote_retries: 1,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "storage".to_string(),
            pool_size: 16,
            timeout: Duration::from_secs(2),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream_prefix: "storage-events".to_string(),
            consumer_group: "storage-orchestrator".to_string(),
            connect_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
            claim_idle: Duration::from_secs(60),
            max_deliveries: 5,
            stream_max_len: 100_000,
            source: "storage-orchestrator".to_string(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 10 * 1024 * 1024,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(24 * 3600),
            default_cold_after_days: 90,
            default_archive_after_days: 365,
            cold_batch: 100,
            archive_batch: 50,
            purge_batch: 50,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            catalogue: Plan::builtin(),
            default_plan: "free".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                bind_address: "0.0.0.0:8080".to_string(),
                data_dir: "./data".to_string(),
                id: "local".to_string(),
            },
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            events: EventsConfig::default(),
            dedup: DedupConfig::default(),
            lifecycle: LifecycleConfig::default(),
            workers: WorkerConfig::default(),
            plans: PlansConfig::default(),
            reconcile_interval: Duration::from_secs(15 * 60),
            max_upload_size: 5 * 1024 * 1024 * 1024,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Stable across restarts so a restarted node picks its own pending
/// entries back up: `NODE_ID`, then the host name, then a random id.
fn node_id() -> String {
    std::env::var("NODE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .or_else(|_| std::env::var("HOST"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn required(name: &str, provider: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| {
        ConfigError::ValidationError(format!(
            "{name} is required when STORAGE_PROVIDERS includes {provider}"
        ))
    })
}

/// Parse `STORAGE_PROVIDERS` (comma separated: `managed`, `s3`, `local`).
fn load_providers() -> Result<Vec<StorageProviderConfig>, ConfigError> {
    let raw = std::env::var("STORAGE_PROVIDERS").unwrap_or_else(|_| "local".to_string());

    let mut providers = Vec::new();
    for name in raw.split(',').map(|s| s.trim().to_lowercase()) {
        let provider = match name.as_str() {
            "" => continue,
            "local" => StorageProviderConfig::Local,
            "s3" | "s3-compatible" => StorageProviderConfig::S3Compatible {
                endpoint: required("S3_ENDPOINT", "s3")?,
                bucket: required("S3_BUCKET", "s3")?,
                region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                access_key_id: required("S3_ACCESS_KEY_ID", "s3")?,
                secret_access_key: required("S3_SECRET_ACCESS_KEY", "s3")?,
                path_style: env_flag("S3_PATH_STYLE"),
            },
            "managed" | "gcs" | "managed-object-store" => {
                StorageProviderConfig::ManagedObjectStore {
                    bucket: required("GCS_BUCKET", "managed")?,
                    credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown storage provider: {other}"
                )))
            }
        };
        providers.push(provider);
    }

    providers.sort_by_key(StorageProviderConfig::priority);
    providers.dedup_by_key(|p| p.storage_type());
    Ok(providers)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let node_id = node_id();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| defaults.node.bind_address.clone());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| defaults.node.data_dir.clone());

        let storage = StorageConfig {
            local_storage_path: std::env::var("LOCAL_STORAGE_PATH")
                .unwrap_or_else(|_| defaults.storage.local_storage_path.clone()),
            providers: load_providers()?,
            remote_timeout: Duration::from_millis(env_parse("STORAGE_TIMEOUT_MS", 30_000)),
            remote_retries: env_parse("STORAGE_RETRIES", defaults.storage.remote_retries),
        };

        let cache = CacheConfig {
            redis_url: std::env::var("CACHE_REDIS_URL").ok(),
            key_prefix: std::env::var("CACHE_KEY_PREFIX")
                .unwrap_or_else(|_| defaults.cache.key_prefix.clone()),
            pool_size: env_parse("CACHE_POOL_SIZE", defaults.cache.pool_size),
            timeout: Duration::from_millis(env_parse("CACHE_TIMEOUT_MS", 2_000)),
        };

        let events = EventsConfig {
            redis_url: std::env::var("EVENTS_REDIS_URL")
                .ok()
                .or_else(|| cache.redis_url.clone()),
            stream_prefix: std::env::var("EVENTS_STREAM_PREFIX")
                .unwrap_or_else(|_| defaults.events.stream_prefix.clone()),
            consumer_group: std::env::var("EVENTS_CONSUMER_GROUP")
                .unwrap_or_else(|_| defaults.events.consumer_group.clone()),
            connect_timeout: Duration::from_millis(env_parse("EVENTS_CONNECT_TIMEOUT_MS", 3_000)),
            poll_interval: Duration::from_millis(env_parse("EVENTS_POLL_INTERVAL_MS", 500)),
            batch_size: env_parse("EVENTS_BATCH_SIZE", defaults.events.batch_size),
            claim_idle: Duration::from_millis(env_parse("EVENTS_CLAIM_IDLE_MS", 60_000)),
            max_deliveries: env_parse("EVENTS_MAX_DELIVERIES", defaults.events.max_deliveries),
            stream_max_len: env_parse("EVENTS_STREAM_MAX_LEN", defaults.events.stream_max_len),
            source: format!("storage-orchestrator/{node_id}"),
        };

        let lifecycle = LifecycleConfig {
            sweep_interval: Duration::from_secs(env_parse("LIFECYCLE_SWEEP_INTERVAL_SECS", 86_400)),
            default_cold_after_days: env_parse(
                "LIFECYCLE_COLD_AFTER_DAYS",
                defaults.lifecycle.default_cold_after_days,
            ),
            default_archive_after_days: env_parse(
                "LIFECYCLE_ARCHIVE_AFTER_DAYS",
                defaults.lifecycle.default_archive_after_days,
            ),
            cold_batch: env_parse("LIFECYCLE_COLD_BATCH", defaults.lifecycle.cold_batch),
            archive_batch: env_parse("LIFECYCLE_ARCHIVE_BATCH", defaults.lifecycle.archive_batch),
            purge_batch: env_parse("LIFECYCLE_PURGE_BATCH", defaults.lifecycle.purge_batch),
        };

        let workers = WorkerConfig {
            workers: env_parse("BACKGROUND_WORKERS", defaults.workers.workers),
            queue_capacity: env_parse("BACKGROUND_QUEUE_CAPACITY", defaults.workers.queue_capacity),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30)),
        };

        let config = Config {
            node: NodeConfig {
                id: node_id,
                bind_address,
                data_dir,
            },
            storage,
            cache,
            events,
            dedup: DedupConfig {
                sync_threshold: env_parse("DEDUP_SYNC_THRESHOLD", defaults.dedup.sync_threshold),
            },
            lifecycle,
            workers,
            plans: PlansConfig {
                catalogue: Plan::builtin(),
                default_plan: std::env::var("DEFAULT_PLAN")
                    .unwrap_or_else(|_| defaults.plans.default_plan.clone()),
            },
            reconcile_interval: Duration::from_secs(env_parse("RECONCILE_INTERVAL_SECS", 900)),
            max_upload_size: env_parse("MAX_UPLOAD_SIZE", defaults.max_upload_size),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "NODE_ID cannot be empty".to_string(),
            ));
        }

        if self.storage.providers.is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_PROVIDERS must name at least one provider".to_string(),
            ));
        }

        if !self
            .plans
            .catalogue
            .iter()
            .any(|p| p.name == self.plans.default_plan)
        {
            return Err(ConfigError::ValidationError(format!(
                "DEFAULT_PLAN {} is not a known plan",
                self.plans.default_plan
            )));
        }

        if self.dedup.sync_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "DEDUP_SYNC_THRESHOLD must be positive".to_string(),
            ));
        }

        if self.workers.workers == 0 || self.workers.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "BACKGROUND_WORKERS and BACKGROUND_QUEUE_CAPACITY must be positive".to_string(),
            ));
        }

        if self.lifecycle.default_archive_after_days < self.lifecycle.default_cold_after_days {
            tracing::warn!(
                cold_days = self.lifecycle.default_cold_after_days,
                archive_days = self.lifecycle.default_archive_after_days,
                "Archive threshold is shorter than the cold threshold; \
                 files archive as soon as they go cold"
            );
        }

        Ok(())
    }

    /// Remote providers in priority order.
    pub fn remote_providers(&self) -> impl Iterator<Item = &StorageProviderConfig> {
        self.storage
            .providers
            .iter()
            .filter(|p| p.storage_type().is_remote())
    }
}
