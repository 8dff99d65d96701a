//! # Dataset caching and load coordination
//!
//! Opening a dataset can take seconds to minutes and a lot of memory. This module makes sure a
//! dataset is opened as rarely as possible, and never by two concurrent requests of the same
//! process at once.
//!
//! ## Cache Layers
//!
//! - An in-memory layer ([`LocalCache`]) per process, holding ready [`Dataset`]s behind an `Arc`.
//!   It is bounded by an optional maximum number of datasets, evicting the ones that were
//!   requested least recently.
//! - An optional shared layer ([`SharedCacheService`]) living outside the process, holding
//!   serialized dataset snapshots. Redis is the production backend, a file-system backend
//!   exists for tests and single-host deployments.
//!
//! Both layers expire entries a fixed time after they were inserted, so periodically updated
//! source data is eventually picked up. Hits never extend that lifetime.
//!
//! A request goes through the following steps, see [`LoadCoordinator::get_dataset`]:
//! - Wait while somebody else is loading the dataset, as signaled by a loading marker.
//! - Look up the in-memory layer, then the shared layer.
//! - On miss, set the loading marker, load the dataset, apply its transforms and store the
//!   result in both layers. The marker is cleared on every exit path.
//!
//! Loading markers are held in process, and in the shared cache when one is configured. They
//! expire on their own after `loading_marker_timeout`, which protects against loaders that died
//! without clearing them. Each marker carries a token of its owner, and is only cleared by that
//! owner. With a shared cache, the marker is held until the snapshot upload is done.
//!
//! ### Metrics
//!
//! - `datasets.access`: All accesses.
//! - `datasets.memory.hit`: Accesses served by the in-memory layer.
//! - `datasets.shared_cache.hit`: Accesses served by the shared layer.
//! - `datasets.load`: Actual loads, tagged with their `status`.
//! - `datasets.load.duration`: Time spent loading and transforming.
//! - `datasets.marker.wait`: Time spent waiting for another loader.
//! - `datasets.memory.evicted`: Datasets evicted from the in-memory layer.
//! - `services.shared_cache.*`: Shared cache operations, tagged with their `status`.
//!
//! [`Dataset`]: crate::dataset::Dataset

mod cache_key;
mod coordinator;
mod markers;
mod memory;
pub mod shared_cache;

pub use cache_key::CacheKey;
pub use coordinator::{CacheInfo, DatasetError, LoadCoordinator};
pub use markers::LoadingMarkers;
pub use memory::{EntryInfo, LocalCache};
pub use shared_cache::{SharedCacheConfig, SharedCacheRef, SharedCacheService};

#[cfg(test)]
mod tests;
