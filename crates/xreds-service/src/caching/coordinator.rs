use std::error::Error;
use std::sync::Arc;

use sentry::{Hub, SentryFutureExt};
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::DatasetCacheConfig;
use crate::dataset::{Dataset, snapshot};
use crate::loader::{DatasetLoader, LoadError};
use crate::registry::{DatasetRegistry, DatasetSpec};
use crate::transforms::TransformRegistry;

use super::markers::owner_token;
use super::{CacheKey, EntryInfo, LocalCache, LoadingMarkers, SharedCacheRef, SharedCacheService};

/// An error returned by [`LoadCoordinator::get_dataset`].
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset {0:?} not found")]
    NotFound(String),
    #[error("failed to load dataset {id:?}")]
    Load {
        id: String,
        #[source]
        source: LoadError,
    },
}

/// The cache state of a single dataset in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// Timestamps of the in-memory entry, if there is one.
    pub entry: Option<EntryInfo>,
    /// Whether the dataset is currently being loaded, here or in another process.
    pub loading: bool,
}

struct Inner {
    config: DatasetCacheConfig,
    registry: Arc<DatasetRegistry>,
    loader: Arc<dyn DatasetLoader>,
    transforms: Arc<TransformRegistry>,
    /// `None` if the in-memory layer is disabled.
    memory: Option<LocalCache<Arc<Dataset>>>,
    markers: LoadingMarkers,
    shared_cache: SharedCacheRef,
}

/// Hands out loaded datasets, making sure each one is loaded as rarely as possible.
///
/// This is cheap to clone, all clones share the same caches.
#[derive(Clone)]
pub struct LoadCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LoadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("config", &self.inner.config)
            .field("datasets", &self.inner.registry.len())
            .field("transforms", &self.inner.transforms)
            .finish()
    }
}

impl LoadCoordinator {
    pub fn new(
        config: DatasetCacheConfig,
        registry: Arc<DatasetRegistry>,
        loader: Arc<dyn DatasetLoader>,
        transforms: Arc<TransformRegistry>,
        shared_cache: SharedCacheRef,
    ) -> Self {
        let memory = config.use_memory_cache.then(|| {
            LocalCache::new(
                config.dataset_cache_timeout,
                config.memory_cache_num_datasets,
            )
        });
        let inner = Inner {
            config,
            registry,
            loader,
            transforms,
            memory,
            markers: LoadingMarkers::new(config.loading_marker_timeout),
            shared_cache,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.inner.registry
    }

    /// Returns the loaded dataset `id`, loading it if necessary.
    ///
    /// Concurrent calls for the same dataset in this process result in a single load. Other
    /// processes sharing the same shared cache are deduplicated on a best effort basis.
    ///
    /// The load runs in a separate task: dropping the returned future stops waiting for it, but
    /// does not abort it.
    #[tracing::instrument(skip(self))]
    pub async fn get_dataset(&self, id: &str) -> Result<Arc<Dataset>, DatasetError> {
        let spec = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| DatasetError::NotFound(id.to_owned()))?;
        metric!(counter("datasets.access") += 1);

        let key = CacheKey::new(id);
        if let Some(dataset) = self.inner.lookup_memory(&key) {
            return Ok(dataset);
        }

        loop {
            self.inner.wait_for_loader(&key).await;
            if let Some(dataset) = self.inner.lookup(&key).await {
                return Ok(dataset);
            }

            let Some(guard) = MarkerGuard::acquire(&self.inner, &key).await else {
                // somebody else started loading in the meantime
                continue;
            };

            // a load may have finished between the lookup and setting the marker
            if let Some(dataset) = self.inner.lookup(&key).await {
                guard.release().await;
                return Ok(dataset);
            }

            let inner = Arc::clone(&self.inner);
            let task_id = id.to_owned();
            let task = async move {
                let result = inner.load(&task_id, &key, &spec).await;
                guard.release().await;
                result
            };

            let handle = tokio::spawn(
                task.bind_hub(Hub::new_from_top(Hub::current()))
                    .in_current_span(),
            );
            return handle.await.unwrap_or_else(|err| {
                Err(DatasetError::Load {
                    id: id.to_owned(),
                    source: LoadError::Internal(format!("dataset load panicked: {err}")),
                })
            });
        }
    }

    /// Describes the cache state of dataset `id`.
    pub async fn cache_info(&self, id: &str) -> Result<CacheInfo, DatasetError> {
        if !self.inner.registry.contains(id) {
            return Err(DatasetError::NotFound(id.to_owned()));
        }
        let key = CacheKey::new(id);
        let entry = self
            .inner
            .memory
            .as_ref()
            .and_then(|memory| memory.entry_info(&key));
        let loading = self.inner.is_loading(&key).await;
        Ok(CacheInfo { entry, loading })
    }
}

impl Inner {
    fn shared_cache(&self) -> Option<&SharedCacheService> {
        self.shared_cache.get()
    }

    async fn is_loading(&self, key: &CacheKey) -> bool {
        if self.markers.is_set(key) {
            return true;
        }
        match self.shared_cache() {
            Some(shared) => shared.marker_exists(key).await,
            None => false,
        }
    }

    /// Polls until no loading marker for `key` is left.
    async fn wait_for_loader(&self, key: &CacheKey) {
        if !self.is_loading(key).await {
            return;
        }

        tracing::debug!("Waiting for dataset {} to finish loading", key.id());
        let start = Instant::now();
        loop {
            tokio::time::sleep(self.config.loading_poll_interval).await;
            if !self.is_loading(key).await {
                break;
            }
        }
        metric!(timer("datasets.marker.wait") = start.elapsed());
    }

    fn lookup_memory(&self, key: &CacheKey) -> Option<Arc<Dataset>> {
        let memory = self.memory.as_ref()?;
        let dataset = memory.get(key)?;
        memory.touch(key);
        metric!(counter("datasets.memory.hit") += 1);
        Some(dataset)
    }

    /// Looks up the in-memory layer, then the shared layer.
    ///
    /// Shared hits are copied into the in-memory layer.
    async fn lookup(&self, key: &CacheKey) -> Option<Arc<Dataset>> {
        if let Some(dataset) = self.lookup_memory(key) {
            return Some(dataset);
        }

        let content = self.shared_cache()?.fetch(key).await?;
        let dataset = match tokio::task::spawn_blocking(move || snapshot::decode(&content)).await {
            Ok(Ok(dataset)) => Arc::new(dataset),
            Ok(Err(err)) => {
                tracing::debug!(
                    error = &err as &dyn Error,
                    %key,
                    "Discarding unreadable dataset snapshot"
                );
                return None;
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Decoding dataset snapshot panicked");
                return None;
            }
        };

        metric!(counter("datasets.shared_cache.hit") += 1);
        if let Some(memory) = &self.memory {
            memory.insert(key.clone(), Arc::clone(&dataset));
        }
        Some(dataset)
    }

    /// Loads and transforms a dataset, and stores it in all cache layers.
    ///
    /// With a shared cache this waits for the snapshot upload, bounded by the loading marker
    /// timeout, so that the marker is only cleared once other processes can find the snapshot.
    async fn load(
        &self,
        id: &str,
        key: &CacheKey,
        spec: &Arc<DatasetSpec>,
    ) -> Result<Arc<Dataset>, DatasetError> {
        tracing::info!("Loading dataset {}", id);
        let start = Instant::now();
        let result = self.load_and_transform(id, spec).await;
        metric!(timer("datasets.load.duration") = start.elapsed());

        let dataset = match result {
            Ok(dataset) => {
                metric!(counter("datasets.load") += 1, "status" => "ok");
                Arc::new(dataset)
            }
            Err(err) => {
                metric!(
                    counter("datasets.load") += 1,
                    "status" => "error",
                    "kind" => err.kind(),
                );
                tracing::error!(
                    error = &err as &dyn Error,
                    "Failed to load dataset {}",
                    id
                );
                return Err(DatasetError::Load {
                    id: id.to_owned(),
                    source: err,
                });
            }
        };

        if let Some(memory) = &self.memory {
            memory.insert(key.clone(), Arc::clone(&dataset));
        }
        if let Some(shared) = self.shared_cache() {
            let snapshot_of = Arc::clone(&dataset);
            match tokio::task::spawn_blocking(move || snapshot::encode(&snapshot_of)).await {
                Ok(Ok(content)) => {
                    let stored = shared.store(key, content, self.config.dataset_cache_timeout);
                    match tokio::time::timeout(self.config.loading_marker_timeout, stored).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            tracing::debug!("Snapshot of dataset {} was not uploaded", id);
                        }
                        Err(_) => {
                            tracing::warn!("Timed out uploading the snapshot of dataset {}", id);
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        error = &err as &dyn Error,
                        "Could not snapshot dataset {}",
                        id
                    );
                }
                Err(err) => {
                    tracing::error!(error = &err as &dyn Error, "Encoding dataset snapshot panicked");
                }
            }
        }

        Ok(dataset)
    }

    async fn load_and_transform(
        &self,
        id: &str,
        spec: &Arc<DatasetSpec>,
    ) -> Result<Dataset, LoadError> {
        let dataset = self.loader.load(spec).await?;
        if spec.extensions.is_empty() {
            return Ok(dataset);
        }

        let transforms = Arc::clone(&self.transforms);
        let spec = Arc::clone(spec);
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || transforms.apply_all(&id, dataset, &spec.extensions))
            .await
            .map_err(|err| LoadError::Internal(format!("dataset transform panicked: {err}")))?
    }
}

/// Holds the loading markers of a dataset.
///
/// Dropping the guard clears the in-process marker right away. The shared marker is cleared by
/// [`release`](Self::release), or in a background task when the guard is dropped otherwise.
struct MarkerGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    owner: String,
    shared: Option<SharedCacheService>,
}

impl MarkerGuard {
    /// Sets the in-process marker, then the shared marker.
    ///
    /// Returns `None` if either of them was set already.
    async fn acquire(inner: &Arc<Inner>, key: &CacheKey) -> Option<Self> {
        let owner = owner_token();
        if !inner.markers.try_set(key, &owner) {
            return None;
        }
        let mut guard = Self {
            inner: Arc::clone(inner),
            key: key.clone(),
            owner,
            shared: None,
        };

        if let Some(shared) = inner.shared_cache() {
            let ttl = inner.config.loading_marker_timeout;
            if !shared.try_set_marker(key, &guard.owner, ttl).await {
                tracing::debug!("Dataset {} is being loaded by another process", key.id());
                return None;
            }
            guard.shared = Some(shared.clone());
        }
        Some(guard)
    }

    async fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.clear_marker(&self.key, &self.owner).await;
        }
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        self.inner.markers.clear(&self.key, &self.owner);

        if let Some(shared) = self.shared.take() {
            // the shared marker expires on its own if there is no runtime anymore
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let key = self.key.clone();
                let owner = std::mem::take(&mut self.owner);
                handle.spawn(async move { shared.clear_marker(&key, &owner).await });
            }
        }
    }
}
