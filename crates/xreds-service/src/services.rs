//! Creates the dataset service from a [`Config`].
//!
//! The service needs a tokio runtime for the shared cache, which connects and uploads in the
//! background. Pass a handle to the runtime that should run this I/O.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{LoadCoordinator, SharedCacheRef, SharedCacheService};
use crate::config::Config;
use crate::loader::FormatLoader;
use crate::registry::DatasetRegistry;
use crate::transforms::TransformRegistry;

/// Reads the dataset mapping configured in `config`, or an empty one if none is configured.
pub fn load_registry(config: &Config) -> Result<DatasetRegistry> {
    match &config.datasets_mapping_file {
        Some(path) => DatasetRegistry::from_path(path).with_context(|| {
            format!("failed to read dataset mapping from {}", path.display())
        }),
        None => {
            tracing::warn!("No datasets_mapping_file configured, no datasets are available");
            Ok(DatasetRegistry::default())
        }
    }
}

pub fn create_service(config: &Config, io_pool: tokio::runtime::Handle) -> Result<LoadCoordinator> {
    let registry = load_registry(config)?;
    let shared_cache = SharedCacheService::new(config.shared_cache.clone(), io_pool);
    Ok(build_service(config, registry, shared_cache))
}

/// Creates the service once the shared cache is ready to use.
///
/// Meant for one-off commands, which would otherwise be done before the shared cache is
/// connected. A shared cache that fails to initialise is left out.
pub async fn create_ready_service(config: &Config) -> Result<LoadCoordinator> {
    let registry = load_registry(config)?;
    let shared_cache = match config.shared_cache.clone() {
        Some(shared_config) => match SharedCacheService::create(shared_config).await {
            Some(service) => service.into_ref(),
            None => SharedCacheRef::default(),
        },
        None => SharedCacheRef::default(),
    };
    Ok(build_service(config, registry, shared_cache))
}

fn build_service(
    config: &Config,
    registry: DatasetRegistry,
    shared_cache: SharedCacheRef,
) -> LoadCoordinator {
    tracing::info!("Loaded {} dataset specifications", registry.len());

    let loader = Arc::new(FormatLoader::new());
    let transforms = TransformRegistry::builtin(loader.clone());

    LoadCoordinator::new(
        config.caches,
        Arc::new(registry),
        loader,
        Arc::new(transforms),
        shared_cache,
    )
}
