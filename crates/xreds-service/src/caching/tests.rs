use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde_json::Value;

use crate::config::DatasetCacheConfig;
use crate::dataset::{Dataset, Variable, snapshot};
use crate::loader::{DatasetLoader, LoadError};
use crate::registry::{DatasetRegistry, DatasetSpec};
use crate::transforms::{Transform, TransformError, TransformRegistry};

use super::shared_cache::config::{FilesystemSharedCacheConfig, SharedCacheBackendConfig};
use super::*;

/// A loader producing a small dataset named after the spec path, counting its invocations.
#[derive(Clone, Default)]
struct CountingLoader {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: Arc<AtomicBool>,
}

impl CountingLoader {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DatasetLoader for CountingLoader {
    fn load<'a>(&'a self, spec: &'a DatasetSpec) -> BoxFuture<'a, Result<Dataset, LoadError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(LoadError::Malformed("broken source".into()));
            }

            let mut dataset = Dataset::new();
            dataset.attrs.insert("name".into(), spec.path.clone().into());
            dataset.attrs.insert("load".into(), call.into());
            dataset.insert_var(
                "zeta",
                Variable::new(["node"], vec![3], vec![0.5, 1., f64::NAN]),
            )?;
            Ok(dataset)
        })
    }
}

fn registry(ids: &[&str]) -> Arc<DatasetRegistry> {
    Arc::new(DatasetRegistry::from_specs(
        ids.iter()
            .map(|id| (id.to_string(), DatasetSpec::from_path(*id))),
    ))
}

fn coordinator(
    config: DatasetCacheConfig,
    registry: Arc<DatasetRegistry>,
    loader: &CountingLoader,
) -> LoadCoordinator {
    LoadCoordinator::new(
        config,
        registry,
        Arc::new(loader.clone()),
        Arc::new(TransformRegistry::new()),
        SharedCacheRef::default(),
    )
}

async fn filesystem_shared_cache(path: &std::path::Path) -> SharedCacheService {
    let config = SharedCacheConfig {
        max_concurrent_uploads: 2,
        max_upload_queue_size: 2,
        backend: SharedCacheBackendConfig::Filesystem(FilesystemSharedCacheConfig {
            path: path.to_path_buf(),
        }),
    };
    SharedCacheService::create(config).await.unwrap()
}

/// A coordinator of its own, as another worker process would have, on a shared cache.
fn process(loader: &CountingLoader, shared: &SharedCacheService) -> LoadCoordinator {
    let config = DatasetCacheConfig {
        loading_poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    LoadCoordinator::new(
        config,
        registry(&["a"]),
        Arc::new(loader.clone()),
        Arc::new(TransformRegistry::new()),
        shared.clone().into_ref(),
    )
}

fn suffix(suffix: &'static str) -> impl Transform {
    move |mut ds: Dataset, _: &Value| -> Result<Dataset, TransformError> {
        let name = format!("{}{suffix}", ds.display_name());
        ds.attrs.insert("name".into(), name.into());
        Ok(ds)
    }
}

#[tokio::test(start_paused = true)]
async fn test_not_found() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    let err = coordinator.get_dataset("nope").await.unwrap_err();
    assert!(matches!(err, DatasetError::NotFound(ref id) if id == "nope"));
    assert_eq!(err.to_string(), "dataset \"nope\" not found");
    assert_eq!(loader.calls(), 0);

    assert!(matches!(
        coordinator.cache_info("nope").await,
        Err(DatasetError::NotFound(_))
    ));
    let info = coordinator.cache_info("a").await.unwrap();
    assert_eq!(info.entry, None);
    assert!(!info.loading);
}

#[tokio::test(start_paused = true)]
async fn test_cached_within_ttl() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    let first = coordinator.get_dataset("a").await.unwrap();
    tokio::time::advance(Duration::from_secs(9 * 60)).await;
    let second = coordinator.get_dataset("a").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.calls(), 1);
    assert_eq!(first.display_name(), "a");
}

#[tokio::test(start_paused = true)]
async fn test_reload_after_ttl() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    let first = coordinator.get_dataset("a").await.unwrap();
    let first_info = coordinator.cache_info("a").await.unwrap().entry.unwrap();

    // hits do not extend the lifetime
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    coordinator.get_dataset("a").await.unwrap();
    assert_eq!(
        coordinator.cache_info("a").await.unwrap().entry.unwrap().expires_at,
        first_info.expires_at
    );

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    let second = coordinator.get_dataset("a").await.unwrap();
    let second_info = coordinator.cache_info("a").await.unwrap().entry.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(loader.calls(), 2);
    assert_eq!(second.attrs["load"], 2);
    assert_eq!(
        second_info.expires_at,
        first_info.expires_at + Duration::from_secs(10 * 60)
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_load_once() {
    xreds_test::setup();
    let loader = CountingLoader::with_delay(Duration::from_secs(3));
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    let results = join_all((0..8).map(|_| coordinator.get_dataset("a"))).await;
    let datasets: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    assert_eq!(loader.calls(), 1);
    assert!(datasets.iter().all(|ds| Arc::ptr_eq(ds, &datasets[0])));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_does_not_abort_load() {
    xreds_test::setup();
    let loader = CountingLoader::with_delay(Duration::from_secs(3));
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    let cancelled =
        tokio::time::timeout(Duration::from_secs(1), coordinator.get_dataset("a")).await;
    assert!(cancelled.is_err());
    assert!(coordinator.cache_info("a").await.unwrap().loading);

    coordinator.get_dataset("a").await.unwrap();
    assert_eq!(loader.calls(), 1);
    assert!(!coordinator.cache_info("a").await.unwrap().loading);
}

#[tokio::test(start_paused = true)]
async fn test_failure_clears_marker() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let coordinator = coordinator(Default::default(), registry(&["a"]), &loader);

    loader.set_failing(true);
    let err = coordinator.get_dataset("a").await.unwrap_err();
    assert!(matches!(
        err,
        DatasetError::Load {
            source: LoadError::Malformed(_),
            ..
        }
    ));

    let info = coordinator.cache_info("a").await.unwrap();
    assert!(!info.loading);
    assert_eq!(info.entry, None);

    // the retry loads right away instead of waiting for the marker to expire
    loader.set_failing(false);
    let start = tokio::time::Instant::now();
    coordinator.get_dataset("a").await.unwrap();
    assert!(start.elapsed() < DatasetCacheConfig::default().loading_poll_interval);
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transforms_in_declared_order() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let spec: DatasetSpec =
        serde_yaml::from_str("path: base\nextensions:\n  a: {}\n  unknown: {}\n  b: {}").unwrap();
    let registry = Arc::new(DatasetRegistry::from_specs([("base".to_owned(), spec)]));
    let transforms = TransformRegistry::new()
        .with_transform("b", suffix("-b"))
        .with_transform("a", suffix("-a"));

    let coordinator = LoadCoordinator::new(
        Default::default(),
        registry,
        Arc::new(loader.clone()),
        Arc::new(transforms),
        SharedCacheRef::default(),
    );

    let dataset = coordinator.get_dataset("base").await.unwrap();
    assert_eq!(dataset.display_name(), "base-a-b");
}

#[tokio::test(start_paused = true)]
async fn test_failing_transform_aborts_load() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let spec: DatasetSpec =
        serde_yaml::from_str("path: base\nextensions:\n  a: {}\n  broken: {}").unwrap();
    let registry = Arc::new(DatasetRegistry::from_specs([("base".to_owned(), spec)]));
    let transforms = TransformRegistry::new()
        .with_transform("a", suffix("-a"))
        .with_transform(
            "broken",
            |_: Dataset, _: &Value| -> Result<Dataset, TransformError> {
                Err(TransformError::Failed("no grid".into()))
            },
        );

    let coordinator = LoadCoordinator::new(
        Default::default(),
        registry,
        Arc::new(loader.clone()),
        Arc::new(transforms),
        SharedCacheRef::default(),
    );

    for _ in 0..2 {
        let err = coordinator.get_dataset("base").await.unwrap_err();

        let mut chain = vec![err.to_string()];
        let mut cause = std::error::Error::source(&err);
        while let Some(err) = cause {
            chain.push(err.to_string());
            cause = err.source();
        }
        insta::allow_duplicates! {
            insta::assert_snapshot!(chain.join("\n"), @r#"
            failed to load dataset "base"
            transform "broken" failed
            no grid
            "#);
        }

        let DatasetError::Load { id, source } = err else {
            panic!("expected a load error");
        };
        assert_eq!(id, "base");
        assert!(matches!(source, LoadError::Transform { ref name, .. } if name == "broken"));
    }

    // nothing was cached, so the second call loaded again
    assert_eq!(loader.calls(), 2);
    assert_eq!(coordinator.cache_info("base").await.unwrap().entry, None);
}

#[tokio::test(start_paused = true)]
async fn test_eviction() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let config = DatasetCacheConfig {
        memory_cache_num_datasets: 2,
        ..Default::default()
    };
    let coordinator = coordinator(config, registry(&["a", "b", "c"]), &loader);

    coordinator.get_dataset("a").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    coordinator.get_dataset("b").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    // requesting `a` protects it from eviction
    coordinator.get_dataset("a").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    coordinator.get_dataset("c").await.unwrap();

    let cached = |id| {
        let coordinator = coordinator.clone();
        async move { coordinator.cache_info(id).await.unwrap().entry.is_some() }
    };
    assert!(cached("a").await);
    assert!(!cached("b").await);
    assert!(cached("c").await);
    assert_eq!(loader.calls(), 3);

    coordinator.get_dataset("b").await.unwrap();
    assert_eq!(loader.calls(), 4);
    assert!(!cached("a").await);
}

#[tokio::test(start_paused = true)]
async fn test_memory_cache_disabled() {
    xreds_test::setup();
    let loader = CountingLoader::default();
    let config = DatasetCacheConfig {
        use_memory_cache: false,
        ..Default::default()
    };
    let coordinator = coordinator(config, registry(&["a"]), &loader);

    coordinator.get_dataset("a").await.unwrap();
    coordinator.get_dataset("a").await.unwrap();
    assert_eq!(loader.calls(), 2);
    assert_eq!(coordinator.cache_info("a").await.unwrap().entry, None);
}

#[tokio::test]
async fn test_shared_cache_between_processes() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let shared = filesystem_shared_cache(dir.path()).await;

    let registry = registry(&["a"]);
    let first_loader = CountingLoader::default();
    let first = LoadCoordinator::new(
        Default::default(),
        registry.clone(),
        Arc::new(first_loader.clone()),
        Arc::new(TransformRegistry::new()),
        shared.clone().into_ref(),
    );
    let loaded = first.get_dataset("a").await.unwrap();
    assert_eq!(first_loader.calls(), 1);

    // the marker is only cleared once the snapshot can be fetched
    let key = CacheKey::new("a");
    assert!(shared.fetch(&key).await.is_some());
    assert!(!shared.marker_exists(&key).await);

    let second_loader = CountingLoader::default();
    let second = LoadCoordinator::new(
        Default::default(),
        registry,
        Arc::new(second_loader.clone()),
        Arc::new(TransformRegistry::new()),
        shared.into_ref(),
    );
    let restored = second.get_dataset("a").await.unwrap();

    assert_eq!(second_loader.calls(), 0);
    assert_eq!(restored.attrs, loaded.attrs);
    assert_eq!(restored.dims, loaded.dims);
    let (restored, loaded) = (&restored.data_vars["zeta"], &loaded.data_vars["zeta"]);
    assert_eq!(restored.values[..2], loaded.values[..2]);
    assert!(restored.values[2].is_nan());

    // the shared hit is now served from memory
    assert!(second.cache_info("a").await.unwrap().entry.is_some());
}

#[tokio::test]
async fn test_other_process_is_served_from_shared_cache() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let shared = filesystem_shared_cache(dir.path()).await;

    let first_loader = CountingLoader::with_delay(Duration::from_millis(200));
    let first = process(&first_loader, &shared);
    let second_loader = CountingLoader::default();
    let second = process(&second_loader, &shared);

    let first_load = tokio::spawn(async move { first.get_dataset("a").await });

    let key = CacheKey::new("a");
    let mut attempts = 0;
    while !shared.marker_exists(&key).await {
        attempts += 1;
        assert!(attempts < 300, "first process never started loading");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // the second process waits for the first one instead of loading itself
    let restored = second.get_dataset("a").await.unwrap();
    let loaded = first_load.await.unwrap().unwrap();

    assert_eq!(first_loader.calls(), 1);
    assert_eq!(second_loader.calls(), 0);
    assert_eq!(restored.attrs, loaded.attrs);
}

#[tokio::test]
async fn test_waits_for_marker_of_other_process() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let shared = filesystem_shared_cache(dir.path()).await;
    let key = CacheKey::new("a");
    let ttl = Duration::from_secs(60);

    assert!(shared.try_set_marker(&key, "other-process", ttl).await);

    let loader = CountingLoader::default();
    let coordinator = process(&loader, &shared);
    let waiting = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.get_dataset("a").await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());
    assert!(coordinator.cache_info("a").await.unwrap().loading);

    // the other process finishes its load
    let mut dataset = Dataset::new();
    dataset.attrs.insert("name".into(), "from elsewhere".into());
    shared
        .store(&key, snapshot::encode(&dataset).unwrap(), ttl)
        .await
        .unwrap();
    shared.clear_marker(&key, "other-process").await;

    let dataset = waiting.await.unwrap().unwrap();
    assert_eq!(dataset.display_name(), "from elsewhere");
    assert_eq!(loader.calls(), 0);
    assert!(!coordinator.cache_info("a").await.unwrap().loading);
}

#[tokio::test]
async fn test_unreadable_snapshot_is_a_miss() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let shared = filesystem_shared_cache(dir.path()).await;
    let key = CacheKey::new("a");

    shared
        .store(&key, b"garbage".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    let loader = CountingLoader::default();
    let coordinator = process(&loader, &shared);
    let dataset = coordinator.get_dataset("a").await.unwrap();

    assert_eq!(dataset.display_name(), "a");
    assert_eq!(loader.calls(), 1);

    // the load replaced the unreadable snapshot
    let content = shared.fetch(&key).await.unwrap();
    assert_eq!(snapshot::decode(&content).unwrap().attrs, dataset.attrs);
}
