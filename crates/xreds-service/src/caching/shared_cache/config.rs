use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemSharedCacheConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSharedCacheConfig {
    /// Host name of the redis server, defaults to `REDIS_HOST` or `localhost`.
    pub host: String,
    /// Port of the redis server, defaults to `REDIS_PORT` or `6379`.
    pub port: u16,
    /// The logical database to use.
    pub db: i64,
}

impl Default for RedisSharedCacheConfig {
    fn default() -> Self {
        Self {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".into()),
            port: env::var("REDIS_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(6379),
            db: 0,
        }
    }
}

impl RedisSharedCacheConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// The backend to use for the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedCacheBackendConfig {
    Redis(RedisSharedCacheConfig),
    Filesystem(FilesystemSharedCacheConfig),
}

/// A cache of loaded datasets that is shared between worker processes.
///
/// Datasets not in the in-memory cache are looked up here before they are loaded from their
/// source. The loading markers used to coordinate loads across processes live here as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheConfig {
    /// The number of allowed concurrent uploads to the shared cache.
    ///
    /// Uploading a snapshot is not required for serving the dataset that was just loaded, so
    /// this limits the resources tied up by uploads.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// The number of queued up uploads to the cache.
    ///
    /// If more snapshots need to be uploaded than are allowed concurrently the uploads are
    /// queued. If the queue is full the uploads are dropped.
    #[serde(default = "default_max_upload_queue_size")]
    pub max_upload_queue_size: usize,

    /// The backend to use for the shared cache.
    #[serde(flatten)]
    pub backend: SharedCacheBackendConfig,
}

fn default_max_upload_queue_size() -> usize {
    400
}

fn default_max_concurrent_uploads() -> usize {
    20
}
