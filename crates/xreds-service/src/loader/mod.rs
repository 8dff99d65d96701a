//! Turns a [`DatasetSpec`] into a [`Dataset`].
//!
//! The [`FormatLoader`] dispatches on the explicit or inferred [`DatasetKind`] to a registered
//! [`FormatOpener`], and then normalizes the opened dataset according to the spec. Zarr stores
//! and kerchunk reference files are supported out of the box. Other formats need an opener to
//! be registered with [`FormatLoader::with_opener`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::dataset::{Dataset, SchemaError};
use crate::registry::{DatasetKind, DatasetSpec};
use crate::transforms::TransformError;

mod normalize;
pub mod store;
pub mod zarr;

pub use normalize::normalize;

/// An error loading a dataset.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not infer the dataset type of {0:?}")]
    UnknownFormat(String),
    #[error("no opener available for {0} datasets")]
    UnsupportedFormat(DatasetKind),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("malformed dataset: {0}")]
    Malformed(String),
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("inconsistent dataset")]
    Schema(#[from] SchemaError),
    #[error("transform {name:?} failed")]
    Transform {
        name: String,
        #[source]
        source: TransformError,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl LoadError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| LoadError::Io { path, source }
    }

    /// A short name for the kind of error, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::UnknownFormat(_) => "unknown-format",
            LoadError::UnsupportedFormat(_) => "unsupported-format",
            LoadError::Unsupported(_) => "unsupported",
            LoadError::Malformed(_) | LoadError::Schema(_) => "malformed",
            LoadError::Io { .. } => "io",
            LoadError::Transform { .. } => "transform",
            LoadError::Internal(_) => "internal",
        }
    }
}

/// Loads datasets, with no caching whatsoever.
pub trait DatasetLoader: Send + Sync + 'static {
    fn load<'a>(&'a self, spec: &'a DatasetSpec) -> BoxFuture<'a, Result<Dataset, LoadError>>;
}

/// Opens datasets of one storage format.
///
/// Opening is blocking and may take a long time.
pub trait FormatOpener: Send + Sync + 'static {
    fn open(&self, spec: &DatasetSpec) -> Result<Dataset, LoadError>;
}

/// The default [`DatasetLoader`], dispatching to a [`FormatOpener`] per [`DatasetKind`].
#[derive(Clone)]
pub struct FormatLoader {
    openers: HashMap<DatasetKind, Arc<dyn FormatOpener>>,
}

impl fmt::Debug for FormatLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatLoader")
            .field("openers", &self.openers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for FormatLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatLoader {
    /// Creates a loader with the built-in openers.
    pub fn new() -> Self {
        Self::empty()
            .with_opener(DatasetKind::Zarr, zarr::ZarrOpener)
            .with_opener(DatasetKind::Kerchunk, zarr::KerchunkOpener)
    }

    /// Creates a loader that cannot open anything.
    pub fn empty() -> Self {
        Self {
            openers: HashMap::new(),
        }
    }

    /// Registers the opener for `kind`, replacing any previous one.
    pub fn with_opener(mut self, kind: DatasetKind, opener: impl FormatOpener) -> Self {
        self.openers.insert(kind, Arc::new(opener));
        self
    }

    fn opener(&self, spec: &DatasetSpec) -> Result<Arc<dyn FormatOpener>, LoadError> {
        let kind = match spec.kind {
            Some(kind) => kind,
            None => {
                let kind = DatasetKind::infer(&spec.path).ok_or_else(|| {
                    tracing::error!("Could not infer dataset type for {}", spec.path);
                    LoadError::UnknownFormat(spec.path.clone())
                })?;
                tracing::info!("Inferred dataset type {} for {}", kind, spec.path);
                kind
            }
        };

        self.openers
            .get(&kind)
            .cloned()
            .ok_or(LoadError::UnsupportedFormat(kind))
    }

    /// Opens and normalizes a dataset, blocking the current thread.
    pub fn open(&self, spec: &DatasetSpec) -> Result<Dataset, LoadError> {
        let opener = self.opener(spec)?;
        let dataset = opener.open(spec)?;
        Ok(normalize(dataset, spec))
    }
}

impl DatasetLoader for FormatLoader {
    fn load<'a>(&'a self, spec: &'a DatasetSpec) -> BoxFuture<'a, Result<Dataset, LoadError>> {
        Box::pin(async move {
            let opener = self.opener(spec)?;
            let spec = spec.clone();
            tokio::task::spawn_blocking(move || {
                let dataset = opener.open(&spec)?;
                Ok(normalize(dataset, &spec))
            })
            .await
            .map_err(|err| LoadError::Internal(format!("dataset opener panicked: {err}")))?
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::dataset::Variable;

    use super::*;

    struct StaticOpener;

    impl FormatOpener for StaticOpener {
        fn open(&self, spec: &DatasetSpec) -> Result<Dataset, LoadError> {
            let mut ds = Dataset::new();
            ds.attrs.insert("source".into(), spec.path.clone().into());
            ds.insert_var("zeta", Variable::new(["node"], vec![2], vec![1., 2.]))?;
            Ok(ds)
        }
    }

    #[tokio::test]
    async fn test_unknown_format() {
        let loader = FormatLoader::new();
        let spec = DatasetSpec::from_path("/data/notes.txt");
        assert!(matches!(
            loader.load(&spec).await,
            Err(LoadError::UnknownFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let loader = FormatLoader::new();
        for path in ["/data/model.nc", "/data/gfs.grib2"] {
            let spec = DatasetSpec::from_path(path);
            let err = loader.load(&spec).await.unwrap_err();
            assert!(matches!(err, LoadError::UnsupportedFormat(_)), "{err}");
        }

        let spec = DatasetSpec {
            kind: Some(DatasetKind::VirtualIcechunk),
            ..DatasetSpec::from_path("s3://bucket/repo")
        };
        assert_eq!(
            loader.load(&spec).await.unwrap_err().to_string(),
            "no opener available for virtual-icechunk datasets"
        );
    }

    #[tokio::test]
    async fn test_registered_opener_and_normalization() {
        let loader = FormatLoader::new().with_opener(DatasetKind::Netcdf, StaticOpener);
        let mut spec = DatasetSpec::from_path("/data/model.nc");
        spec.additional_attrs
            .insert("title".into(), "Model output".into());

        let ds = loader.load(&spec).await.unwrap();
        assert_eq!(ds.attrs["source"], "/data/model.nc");
        assert_eq!(ds.attrs["title"], "Model output");
        assert_eq!(ds.data_vars["zeta"].values, vec![1., 2.]);
    }
}
