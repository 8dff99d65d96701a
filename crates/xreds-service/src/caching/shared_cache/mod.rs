//! A dataset cache to be shared between different worker processes.
//!
//! Every worker process has its own in-memory cache, which means a dataset would be loaded once
//! per worker. This cache lives outside of the processes, holds serialized dataset snapshots, and
//! additionally carries the loading markers used to avoid concurrent loads across processes.
//!
//! All operations hide their errors: they are logged and reported as metrics, and otherwise
//! behave like a cache miss.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Error, Result};
use redis::aio::MultiplexedConnection;
use sentry::protocol::Context;
use sentry::{Hub, SentryFutureExt};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::{OnceCell, mpsc, oneshot};

use super::CacheKey;
use super::cache_key::safe_path_segment;

pub mod config;

pub use config::SharedCacheConfig;
use config::{FilesystemSharedCacheConfig, RedisSharedCacheConfig, SharedCacheBackendConfig};

// TODO: make these configurable once a deployment needs different values.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors using the cache backend.
///
/// Timeouts are tracked separately, since they are expected to happen now and then and are not
/// worth an error report.
#[derive(thiserror::Error, Debug)]
enum CacheError {
    #[error("timeout talking to cache service")]
    Timeout,
    #[error(transparent)]
    Other(#[from] Error),
}

impl CacheError {
    fn details(&self) -> &'static str {
        match self {
            CacheError::Timeout => "timeout",
            CacheError::Other(_) => "other",
        }
    }

    fn report(self, operation: &str, backend: &str) {
        if let CacheError::Other(err) = self {
            let stderr: &dyn std::error::Error = &*err;
            tracing::error!(stderr, "Error during {} on {} shared cache", operation, backend);
        } else {
            tracing::debug!("{} during {} on {} shared cache", self, operation, backend);
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Other(Error::new(err).context("Bad redis response for shared_cache"))
    }
}

/// Applies [`OPERATION_TIMEOUT`] to a backend operation.
async fn with_timeout<T, F>(future: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(OPERATION_TIMEOUT, future)
        .await
        .unwrap_or(Err(CacheError::Timeout))
}

/// Deletes the marker at `KEYS[1]` only if it still holds the owner token `ARGV[1]`.
const CLEAR_MARKER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

struct RedisState {
    config: RedisSharedCacheConfig,
    connection: MultiplexedConnection,
    clear_marker_script: redis::Script,
}

impl fmt::Debug for RedisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisState")
            .field("config", &self.config)
            .field("connection", &"<MultiplexedConnection>")
            .finish()
    }
}

impl RedisState {
    pub async fn try_new(config: RedisSharedCacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).context("Invalid redis url")?;

        // The redis server may not accept connections yet when the whole deployment starts at
        // once, so we need to retry this for a bit.
        const MAX_DELAY: Duration = Duration::from_secs(30);
        const RETRY_INTERVAL: Duration = Duration::from_millis(500);
        let start = Instant::now();
        let connection = loop {
            let future = client.get_multiplexed_async_connection();
            let result = match tokio::time::timeout(CONNECT_TIMEOUT, future).await {
                Ok(result) => result.context("Failed to connect to redis"),
                Err(_) => Err(Error::msg("Timeout connecting to redis")),
            };
            match result {
                Ok(connection) => break connection,
                Err(err) if start.elapsed() > MAX_DELAY => return Err(err),
                Err(err) => {
                    let remaining = MAX_DELAY - start.elapsed();
                    tracing::warn!("Error connecting to redis: {:#}", err);
                    tracing::info!(
                        "Waiting for redis at {}:{}, {}s remaining",
                        config.host,
                        config.port,
                        remaining.as_secs(),
                    );
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        };

        Ok(Self {
            config,
            connection,
            clear_marker_script: redis::Script::new(CLEAR_MARKER_SCRIPT),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(expiry_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        // `SET NX` replies with `OK` if the key was set, and nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(expiry_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_owned(&self, key: &str, owner: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .clear_marker_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }
}

/// Redis rejects an expiry of zero.
fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Milliseconds since the unix epoch.
///
/// The file-system backend can be shared by multiple processes, so this has to be wall clock time.
fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Writes `[expires_at: u64 BE][value]` to `path` via a temporary file.
///
/// Returns `false` if `noclobber` is set and the file already exists.
fn write_entry(
    dir: &Path,
    path: PathBuf,
    value: &[u8],
    ttl: Duration,
    noclobber: bool,
) -> Result<bool> {
    let temp_dir = dir.join(".tmp");
    std::fs::create_dir_all(&temp_dir).context("failed to create tempdir")?;
    let mut temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;

    let expires_at = unix_millis(SystemTime::now() + ttl);
    temp_file
        .write_all(&expires_at.to_be_bytes())
        .and_then(|_| temp_file.write_all(value))
        .context("Failed to copy data into file")?;

    if !noclobber {
        temp_file
            .persist(path)
            .context("Failed to save file in shared cache")?;
        return Ok(true);
    }
    match temp_file.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).context("Failed to save file in shared cache"),
    }
}

impl FilesystemSharedCacheConfig {
    fn path_for(&self, key: &str) -> PathBuf {
        self.path.join(safe_path_segment(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key);
        tracing::trace!("Fetching shared cache entry from {}", path.display());
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("Failed to open file in shared cache")?,
        };

        let Some((header, value)) = contents.split_first_chunk::<8>() else {
            return Err(Error::msg("Truncated file in shared cache"))?;
        };
        let expires_at = u64::from_be_bytes(*header);
        if unix_millis(SystemTime::now()) >= expires_at {
            // Another process may have replaced it in the meantime, which we don't care about.
            fs::remove_file(&path).await.ok();
            return Ok(None);
        }
        Ok(Some(value.to_vec()))
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        noclobber: bool,
    ) -> Result<bool, CacheError> {
        let dir = self.path.clone();
        let path = self.path_for(key);
        fs::create_dir_all(&dir)
            .await
            .context("Failed to create shared cache directory")?;
        let written = tokio::task::spawn_blocking(move || {
            write_entry(&dir, path, &value, ttl, noclobber)
        })
        .await
        .context("Shared cache write panicked")??;
        Ok(written)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.write(key, value, ttl, false).await.map(|_| ())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        // This removes an expired entry, so that it does not block the create below.
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.write(key, value, ttl, true).await
    }

    /// Removes the entry if it holds `owner`.
    ///
    /// Unlike redis this is not atomic, a marker replaced between the read and the removal is
    /// lost. Such a replacement needs the previous marker to expire first.
    async fn delete_if_owned(&self, key: &str, owner: &[u8]) -> Result<bool, CacheError> {
        if self.get(key).await?.as_deref() != Some(owner) {
            return Ok(false);
        }
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("Failed to remove file from shared cache")?,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[derive(Debug)]
enum SharedCacheBackend {
    Redis(RedisState),
    Fs(FilesystemSharedCacheConfig),
}

impl SharedCacheBackend {
    /// Creates the backend.
    ///
    /// If the backend can not be created the error will already be reported.
    async fn maybe_new(cfg: SharedCacheBackendConfig) -> Option<Self> {
        match cfg {
            SharedCacheBackendConfig::Redis(cfg) => {
                match RedisState::try_new(cfg)
                    .await
                    .context("Failed to initialise redis backend for shared cache")
                {
                    Ok(state) => Some(SharedCacheBackend::Redis(state)),
                    Err(err) => {
                        tracing::error!("{:#}", err);
                        sentry::capture_error(&*err);
                        None
                    }
                }
            }
            SharedCacheBackendConfig::Filesystem(cfg) => Some(SharedCacheBackend::Fs(cfg)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Fs(_) => "filesystem",
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self {
            Self::Redis(state) => with_timeout(state.get(key)).await,
            Self::Fs(cfg) => cfg.get(key).await,
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            Self::Redis(state) => with_timeout(state.set_with_expiry(key, &value, ttl)).await,
            Self::Fs(cfg) => cfg.set_with_expiry(key, value, ttl).await,
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        match self {
            Self::Redis(state) => with_timeout(state.set_if_absent(key, &value, ttl)).await,
            Self::Fs(cfg) => cfg.set_if_absent(key, value, ttl).await,
        }
    }

    async fn delete_if_owned(&self, key: &str, owner: &[u8]) -> Result<bool, CacheError> {
        match self {
            Self::Redis(state) => with_timeout(state.delete_if_owned(key, owner)).await,
            Self::Fs(cfg) => cfg.delete_if_owned(key, owner).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        match self {
            Self::Redis(state) => with_timeout(state.exists(key)).await,
            Self::Fs(cfg) => cfg.exists(key).await,
        }
    }
}

/// Message to send upload tasks across the [`SharedCacheService::upload_queue_tx`].
#[derive(Debug)]
struct UploadMessage {
    /// The cache key to store the data at.
    key: String,
    /// The serialized dataset.
    content: Vec<u8>,
    /// How long the backend should keep the entry.
    ttl: Duration,
    /// A channel to notify completion of storage.
    done_tx: oneshot::Sender<()>,
}

pub type SharedCacheRef = Arc<OnceCell<SharedCacheService>>;

/// A shared cache service.
///
/// Initialising is asynchronous since it may take some time.
#[derive(Debug, Clone)]
pub struct SharedCacheService {
    backend: Arc<SharedCacheBackend>,
    upload_queue_tx: mpsc::Sender<UploadMessage>,
}

impl SharedCacheService {
    /// Creates the service in the background, the returned cell stays empty until it is ready.
    pub fn new(
        config: Option<SharedCacheConfig>,
        runtime: tokio::runtime::Handle,
    ) -> SharedCacheRef {
        let cache = SharedCacheRef::default();
        if let Some(config) = config {
            let cell = cache.clone();
            runtime.spawn(async move {
                if let Some(service) = Self::create(config).await {
                    let _ = cell.set(service);
                }
            });
        }
        cache
    }

    /// Creates the service, waiting for the backend to become available.
    ///
    /// Returns `None` if the backend could not be created, which is already reported.
    pub async fn create(config: SharedCacheConfig) -> Option<Self> {
        let (tx, rx) = mpsc::channel(config.max_upload_queue_size);
        let backend = Arc::new(SharedCacheBackend::maybe_new(config.backend).await?);
        tracing::info!("Using {} shared cache", backend.name());
        tokio::spawn(
            Self::upload_worker(rx, backend.clone(), config.max_concurrent_uploads)
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
        Some(SharedCacheService {
            backend,
            upload_queue_tx: tx,
        })
    }

    /// Wraps a ready service into a [`SharedCacheRef`].
    pub fn into_ref(self) -> SharedCacheRef {
        Arc::new(OnceCell::new_with(Some(self)))
    }

    /// Long running task managing concurrent uploads to the shared cache.
    async fn upload_worker(
        mut work_rx: mpsc::Receiver<UploadMessage>,
        backend: Arc<SharedCacheBackend>,
        max_concurrent_uploads: usize,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent_uploads.max(1));
        let mut uploads_counter = max_concurrent_uploads;
        loop {
            tokio::select! {
                Some(message) = work_rx.recv(), if uploads_counter > 0 => {
                    uploads_counter -= 1;
                    tokio::spawn(
                        Self::single_uploader(done_tx.clone(), backend.clone(), message)
                            .bind_hub(Hub::new_from_top(Hub::current()))
                    );
                    let uploads_in_flight: u64 = (max_concurrent_uploads - uploads_counter) as u64;
                    metric!(gauge("services.shared_cache.uploads_in_flight") = uploads_in_flight);
                }
                Some(_) = done_rx.recv() => {
                    uploads_counter += 1;
                }
                else => break,
            }
        }
        tracing::info!("Shared cache upload worker terminated");
    }

    /// Does a single upload to the shared cache backend.
    ///
    /// Handles metrics and error reporting.
    async fn single_uploader(
        done_tx: mpsc::Sender<()>,
        backend: Arc<SharedCacheBackend>,
        message: UploadMessage,
    ) {
        let UploadMessage {
            key,
            content,
            ttl,
            done_tx: complete_tx,
        } = message;

        sentry::configure_scope(|scope| {
            let mut map = BTreeMap::new();
            map.insert("backend".to_string(), backend.name().into());
            map.insert("key".to_string(), key.clone().into());
            scope.set_context("Shared Cache", Context::Other(map));
        });

        let bytes = content.len() as i64;
        match backend.set_with_expiry(&key, content, ttl).await {
            Ok(()) => {
                metric!(counter("services.shared_cache.store") += 1, "status" => "ok");
                metric!(counter("services.shared_cache.store.bytes") += bytes);
            }
            Err(err) => {
                metric!(
                    counter("services.shared_cache.store") += 1,
                    "status" => "error",
                    "errdetails" => err.details(),
                );
                err.report("store", backend.name());
            }
        }

        // Tell the work coordinator we're done.
        done_tx.send(()).await.unwrap_or_else(|err| {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(
                stderr,
                "Shared cache single_uploader failed to send done message",
            );
        });

        // Tell the original work submitter we're done, if they dropped this we don't care.
        complete_tx.send(()).ok();
    }

    /// Returns the name of the backend configured.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Retrieves a dataset snapshot from the shared cache.
    ///
    /// Errors are transparently hidden, either a cache item is available or it is not.
    #[tracing::instrument(name = "fetch_shared_cache", skip_all, fields(key = %key))]
    pub async fn fetch(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.backend.get(&key.data_key()).await {
            Ok(Some(content)) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "hit" => "true",
                    "status" => "ok",
                );
                metric!(counter("services.shared_cache.fetch.bytes") += content.len() as i64);
                Some(content)
            }
            Ok(None) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "hit" => "false",
                    "status" => "ok",
                );
                None
            }
            Err(err) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "status" => "error",
                    "errdetails" => err.details(),
                );
                err.report("fetch", self.backend_name());
                None
            }
        }
    }

    /// Places a dataset snapshot on the shared cache, replacing any previous one.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which will receive a value once the snapshot has been
    /// stored. Due to backpressure it is possible that the snapshot is never stored, in which
    /// case the corresponding [`oneshot::Sender`] is dropped and awaiting the receiver will
    /// resolve into an [`Err`].
    ///
    /// The receiver can be safely ignored, it mostly exists to enable testing.
    pub fn store(&self, key: &CacheKey, content: Vec<u8>, ttl: Duration) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        metric!(
            gauge("services.shared_cache.uploads_queue_capacity") =
                self.upload_queue_tx.capacity() as u64
        );
        self.upload_queue_tx
            .try_send(UploadMessage {
                key: key.data_key(),
                content,
                ttl,
                done_tx,
            })
            .unwrap_or_else(|_| {
                metric!(counter("services.shared_cache.store.dropped") += 1);
                tracing::error!("Shared cache upload queue full");
            });
        done_rx
    }

    /// Atomically sets the loading marker for `key` to `owner`, unless one exists.
    ///
    /// On errors this reports the marker as set, so that a broken shared cache does not stall
    /// loads. The in-process marker still prevents concurrent loads within one process.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn try_set_marker(&self, key: &CacheKey, owner: &str, ttl: Duration) -> bool {
        let result = self
            .backend
            .set_if_absent(&key.loading_key(), owner.as_bytes().to_vec(), ttl)
            .await;
        self.marker_result("set", result).unwrap_or(true)
    }

    /// Whether a loading marker for `key` exists. Errors count as absent.
    pub async fn marker_exists(&self, key: &CacheKey) -> bool {
        let result = self.backend.exists(&key.loading_key()).await;
        self.marker_result("exists", result).unwrap_or(false)
    }

    /// Clears the loading marker for `key`, unless it is held by somebody other than `owner`.
    ///
    /// That happens when `owner` took longer than the marker timeout and another loader took
    /// over in the meantime.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn clear_marker(&self, key: &CacheKey, owner: &str) {
        let result = self
            .backend
            .delete_if_owned(&key.loading_key(), owner.as_bytes())
            .await;
        if self.marker_result("clear", result) == Some(false) {
            tracing::debug!("Loading marker of dataset {} is not ours anymore", key.id());
        }
    }

    fn marker_result<T>(&self, operation: &str, result: Result<T, CacheError>) -> Option<T> {
        match result {
            Ok(value) => {
                metric!(
                    counter("services.shared_cache.marker") += 1,
                    "op" => operation,
                    "status" => "ok",
                );
                Some(value)
            }
            Err(err) => {
                metric!(
                    counter("services.shared_cache.marker") += 1,
                    "op" => operation,
                    "status" => "error",
                    "errdetails" => err.details(),
                );
                err.report(operation, self.backend_name());
                None
            }
        }
    }
}
