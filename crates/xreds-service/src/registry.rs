//! The static mapping from dataset identifier to load specification.
//!
//! The mapping file is read once at startup. It is YAML, which means plain JSON mapping files are
//! accepted as well:
//!
//! ```yaml
//! gfs:
//!   path: /data/gfs/latest.json
//!   type: kerchunk
//!   drop_variables: [time_bnds]
//!   extensions:
//!     virtual_vectors: {}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::dataset::Attributes;

/// An error reading the dataset mapping file.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read dataset mapping file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("dataset mapping file is empty")]
    Empty,
    #[error("failed to parse dataset mapping")]
    Parse(#[from] serde_yaml::Error),
}

/// The storage format of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    Netcdf,
    Grib2,
    Kerchunk,
    Zarr,
    VirtualIcechunk,
}

impl DatasetKind {
    /// Infers the format from the suffix of a dataset path.
    pub fn infer(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path.ends_with(".nc") {
            Some(Self::Netcdf)
        } else if path.ends_with(".grib2") {
            Some(Self::Grib2)
        } else if path.ends_with(".nc.zarr") || path.ends_with("json") {
            Some(Self::Kerchunk)
        } else if path.ends_with(".zarr") {
            Some(Self::Zarr)
        } else {
            None
        }
    }
}

impl AsRef<str> for DatasetKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Netcdf => "netcdf",
            Self::Grib2 => "grib2",
            Self::Kerchunk => "kerchunk",
            Self::Zarr => "zarr",
            Self::VirtualIcechunk => "virtual-icechunk",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Chunking hints for a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Chunks {
    /// A named strategy such as `auto`, which keeps the chunking of the source.
    Named(String),
    /// Chunk sizes per dimension. Non-positive sizes span the whole dimension.
    PerDimension(BTreeMap<String, i64>),
}

/// How to load a single dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Location of the dataset.
    pub path: String,

    /// The storage format, inferred from `path` if missing.
    #[serde(default, rename = "type")]
    pub kind: Option<DatasetKind>,

    /// The engine to use for formats that support more than one.
    #[serde(default)]
    pub engine: Option<String>,

    #[serde(default)]
    pub chunks: Option<Chunks>,

    /// Variables which are never read from the source.
    #[serde(default, deserialize_with = "one_or_many")]
    pub drop_variables: Vec<String>,

    /// Data variables which are promoted to coordinates after loading.
    #[serde(default, deserialize_with = "one_or_many")]
    pub additional_coords: Vec<String>,

    /// Attributes merged into the global attributes after loading.
    #[serde(default)]
    pub additional_attrs: Attributes,

    /// Maps a data variable to the 1-D mask variable that selects its valid positions.
    #[serde(default)]
    pub mask_variables: IndexMap<String, String>,

    /// Options passed through to the storage layer.
    #[serde(default)]
    pub storage_options: BTreeMap<String, serde_json::Value>,

    /// Named transforms with their configuration, in the order they are applied.
    #[serde(default)]
    pub extensions: IndexMap<String, serde_json::Value>,
}

impl DatasetSpec {
    /// Creates a spec for `path` with all other settings at their default.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// The explicit or inferred format of this dataset.
    pub fn kind(&self) -> Option<DatasetKind> {
        self.kind.or_else(|| DatasetKind::infer(&self.path))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(one)) => vec![one],
        Some(OneOrMany::Many(many)) => many,
    })
}

/// All known datasets, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: IndexMap<String, Arc<DatasetSpec>>,
}

impl DatasetRegistry {
    /// Reads the mapping file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let contents = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Parses a YAML or JSON mapping.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, RegistryError> {
        if contents.trim().is_empty() {
            return Err(RegistryError::Empty);
        }
        let datasets: IndexMap<String, DatasetSpec> = serde_yaml::from_str(contents)?;
        Ok(Self::from_specs(datasets))
    }

    pub fn from_specs<I>(specs: I) -> Self
    where
        I: IntoIterator<Item = (String, DatasetSpec)>,
    {
        let datasets = specs
            .into_iter()
            .map(|(id, spec)| (id, Arc::new(spec)))
            .collect();
        Self { datasets }
    }

    pub fn get(&self, id: &str) -> Option<Arc<DatasetSpec>> {
        self.datasets.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.datasets.contains_key(id)
    }

    /// All dataset identifiers, in the order of the mapping file.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}
