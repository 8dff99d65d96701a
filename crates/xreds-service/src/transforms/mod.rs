//! Named post-load transforms.
//!
//! A dataset spec lists its transforms under `extensions`, as an ordered map from transform name
//! to a free-form configuration object. After loading, the [`TransformRegistry`] applies them in
//! declared order, each one receiving the output of the previous one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::dataset::{Dataset, SchemaError};
use crate::loader::{FormatLoader, LoadError};

mod roms;
mod vdatum;
mod vectors;

pub use roms::RomsTransform;
pub use vdatum::VdatumTransform;
pub use vectors::VirtualVectorsTransform;

/// An error applying a single transform.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid transform configuration")]
    Config(#[from] serde_json::Error),
    #[error("inconsistent dataset")]
    Schema(#[from] SchemaError),
    #[error("failed to load auxiliary dataset")]
    Load(#[source] Box<LoadError>),
    #[error("{0}")]
    Failed(String),
}

/// A transformation of a freshly loaded dataset.
///
/// Transforms run on a blocking thread and may take their time.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, dataset: Dataset, config: &Value) -> Result<Dataset, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(Dataset, &Value) -> Result<Dataset, TransformError> + Send + Sync + 'static,
{
    fn apply(&self, dataset: Dataset, config: &Value) -> Result<Dataset, TransformError> {
        self(dataset, config)
    }
}

/// A static mapping from transform name to implementation.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .finish()
    }
}

impl TransformRegistry {
    /// Creates a registry without any transforms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `vdatum`, `virtual_vectors` and `roms` transforms.
    ///
    /// `vdatum` opens its datum grids through `loader`.
    pub fn builtin(loader: Arc<FormatLoader>) -> Self {
        Self::new()
            .with_transform("vdatum", VdatumTransform::new(loader))
            .with_transform("virtual_vectors", VirtualVectorsTransform)
            .with_transform("roms", RomsTransform)
    }

    pub fn with_transform(mut self, name: impl Into<String>, transform: impl Transform) -> Self {
        self.register(name, transform);
        self
    }

    /// Registers `transform` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Transform>> {
        self.transforms.get(name)
    }

    /// Applies all configured transforms in order.
    ///
    /// Unknown transforms are logged and skipped. The first failing transform aborts.
    pub fn apply_all(
        &self,
        id: &str,
        mut dataset: Dataset,
        extensions: &IndexMap<String, Value>,
    ) -> Result<Dataset, LoadError> {
        for (name, config) in extensions {
            let Some(transform) = self.get(name) else {
                tracing::error!("Could not find extension {}", name);
                continue;
            };

            tracing::info!("Applying extension {} to dataset {}", name, id);
            dataset = transform
                .apply(dataset, config)
                .map_err(|source| LoadError::Transform {
                    name: name.clone(),
                    source,
                })?;
        }
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use crate::dataset::Variable;

    use super::*;

    fn suffix(suffix: &'static str) -> impl Transform {
        move |mut ds: Dataset, _: &Value| -> Result<Dataset, TransformError> {
            let name = format!("{}{suffix}", ds.display_name());
            ds.attrs.insert("name".into(), name.into());
            Ok(ds)
        }
    }

    fn named(name: &str) -> Dataset {
        let mut ds = Dataset::new();
        ds.attrs.insert("name".into(), name.into());
        ds
    }

    fn extensions(names: &[&str]) -> IndexMap<String, Value> {
        names
            .iter()
            .map(|name| (name.to_string(), Value::Null))
            .collect()
    }

    #[test]
    fn test_declared_order() {
        let registry = TransformRegistry::new()
            .with_transform("b", suffix("-b"))
            .with_transform("a", suffix("-a"));

        let ds = registry
            .apply_all("base", named("base"), &extensions(&["a", "b"]))
            .unwrap();
        assert_eq!(ds.display_name(), "base-a-b");

        let ds = registry
            .apply_all("base", named("base"), &extensions(&["b", "a"]))
            .unwrap();
        assert_eq!(ds.display_name(), "base-b-a");
    }

    #[test]
    fn test_unknown_transforms_are_skipped() {
        let registry = TransformRegistry::new().with_transform("a", suffix("-a"));
        let ds = registry
            .apply_all("base", named("base"), &extensions(&["nope", "a"]))
            .unwrap();
        assert_eq!(ds.display_name(), "base-a");
    }

    #[test]
    fn test_failing_transform_aborts() {
        let registry = TransformRegistry::new()
            .with_transform(
                "fail",
                |_: Dataset, _: &Value| -> Result<Dataset, TransformError> {
                    Err(TransformError::Failed("boom".into()))
                },
            )
            .with_transform("a", suffix("-a"));

        let err = registry
            .apply_all("base", named("base"), &extensions(&["fail", "a"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "transform \"fail\" failed");
        assert!(matches!(err, LoadError::Transform { name, .. } if name == "fail"));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = TransformRegistry::builtin(Arc::new(FormatLoader::new()));
        for name in ["vdatum", "virtual_vectors", "roms"] {
            assert!(registry.get(name).is_some(), "{name}");
        }

        let mut ds = named("empty");
        ds.insert_var("temp", Variable::new(["x"], vec![1], vec![1.]))
            .unwrap();
        let config: IndexMap<String, Value> =
            serde_json::from_str(r#"{"virtual_vectors": {}}"#).unwrap();
        let transformed = registry.apply_all("empty", ds.clone(), &config).unwrap();
        assert_eq!(transformed, ds);
    }
}
