use std::fs;
use std::sync::Arc;

use xreds_service::caching::shared_cache::config::{
    FilesystemSharedCacheConfig, SharedCacheBackendConfig,
};
use xreds_service::caching::{
    CacheKey, LoadCoordinator, SharedCacheConfig, SharedCacheService,
};
use xreds_service::loader::FormatLoader;
use xreds_service::registry::DatasetRegistry;
use xreds_service::transforms::TransformRegistry;

use crate::{ocean_model, write_mapping};

fn coordinator(registry: &Arc<DatasetRegistry>, shared: &SharedCacheService) -> LoadCoordinator {
    let loader = Arc::new(FormatLoader::new());
    LoadCoordinator::new(
        Default::default(),
        Arc::clone(registry),
        loader.clone(),
        Arc::new(TransformRegistry::builtin(loader)),
        shared.clone().into_ref(),
    )
}

#[tokio::test]
async fn test_snapshot_survives_source_removal() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let cache_dir = xreds_test::tempdir();
    let store = dir.path().join("gom.zarr");
    ocean_model().write(&store);

    let mapping = write_mapping(
        dir.path(),
        "gom:\n  path: \"{root}/gom.zarr\"\n  extensions:\n    virtual_vectors: {}\n",
    );
    let registry = Arc::new(DatasetRegistry::from_path(&mapping).unwrap());
    let shared = SharedCacheService::create(SharedCacheConfig {
        max_concurrent_uploads: 2,
        max_upload_queue_size: 2,
        backend: SharedCacheBackendConfig::Filesystem(FilesystemSharedCacheConfig {
            path: cache_dir.path().to_path_buf(),
        }),
    })
    .await
    .unwrap();

    let first = coordinator(&registry, &shared);
    let loaded = first.get_dataset("gom").await.unwrap();

    // the load only returns once the snapshot is uploaded
    let key = CacheKey::new("gom");
    assert!(shared.fetch(&key).await.is_some());
    assert!(!shared.marker_exists(&key).await);

    // a second process can only be served from the shared cache now
    fs::remove_dir_all(&store).unwrap();
    let second = coordinator(&registry, &shared);
    let restored = second.get_dataset("gom").await.unwrap();

    assert_eq!(restored.dims, loaded.dims);
    assert_eq!(restored.attrs, loaded.attrs);
    assert_eq!(
        restored.data_vars.keys().collect::<Vec<_>>(),
        loaded.data_vars.keys().collect::<Vec<_>>()
    );
    assert_eq!(
        restored.data_vars["sea_water_velocity_speed"].values,
        loaded.data_vars["sea_water_velocity_speed"].values
    );
}
