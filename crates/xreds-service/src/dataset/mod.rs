//! The in-memory representation of a loaded dataset.
//!
//! A [`Dataset`] is a collection of named, labeled n-dimensional arrays sharing a set of
//! dimensions, modeled after the netCDF / CF data model: dimensions with fixed sizes, coordinate
//! variables, data variables, and free-form attributes.
//!
//! Array values are stored fully materialized in row-major (C) order as `f64`, regardless of the
//! on-disk [`DataType`], which is kept around for reporting. Missing values are `NaN`.
//!
//! Once a dataset is handed to the cache it is shared behind an `Arc` and never mutated again.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod snapshot;

/// Free-form attributes of a dataset or variable.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// An inconsistency between a variable and the dataset it is inserted into.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("dimension {dim:?} has size {expected}, but variable {variable:?} uses size {found}")]
    DimensionMismatch {
        variable: String,
        dim: String,
        expected: usize,
        found: usize,
    },
    #[error("variable {variable:?} has shape {shape:?} which does not match {len} values")]
    ShapeMismatch {
        variable: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("variable {0:?} does not exist")]
    UnknownVariable(String),
    #[error("dimension {0:?} does not exist")]
    UnknownDimension(String),
}

/// The storage type of a variable in its source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// The size of a single element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl AsRef<str> for DataType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

/// A labeled n-dimensional array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Names of the dimensions, outermost first.
    pub dims: Vec<String>,
    /// Size of each dimension, in the same order as `dims`.
    pub shape: Vec<usize>,
    pub dtype: DataType,
    #[serde(default)]
    pub attrs: Attributes,
    /// Preferred chunk shape for consumers that process the array piecewise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<usize>>,
    /// The values in row-major order.
    ///
    /// These are not part of the serialized header, see [`snapshot`].
    #[serde(skip)]
    pub values: Vec<f64>,
}

impl Variable {
    /// Creates a `float64` variable.
    ///
    /// # Panics
    ///
    /// Panics if `dims` and `shape` differ in length, or `values` does not match the shape.
    pub fn new<D: Into<String>>(
        dims: impl IntoIterator<Item = D>,
        shape: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        let dims: Vec<String> = dims.into_iter().map(Into::into).collect();
        assert_eq!(dims.len(), shape.len(), "one size per dimension");
        assert_eq!(
            shape.iter().product::<usize>(),
            values.len(),
            "values must match shape"
        );
        Self {
            dims,
            shape,
            dtype: DataType::Float64,
            attrs: Attributes::new(),
            chunks: None,
            values,
        }
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the position of `dim` in this variable's dimensions.
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Returns a string attribute.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    /// The CF `standard_name` of this variable, if any.
    pub fn standard_name(&self) -> Option<&str> {
        self.attr_str("standard_name")
    }

    /// Gathers the given positions along `axis`, in the given order.
    pub fn take(&self, axis: usize, indices: &[usize]) -> Variable {
        let n = self.shape[axis];
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();

        let mut values = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let start = (o * n + i) * inner;
                values.extend_from_slice(&self.values[start..start + inner]);
            }
        }

        let mut shape = self.shape.clone();
        shape[axis] = indices.len();
        let chunks = self.chunks.clone().map(|mut chunks| {
            chunks[axis] = chunks[axis].min(indices.len()).max(1);
            chunks
        });

        Variable {
            dims: self.dims.clone(),
            shape,
            dtype: self.dtype,
            attrs: self.attrs.clone(),
            chunks,
            values,
        }
    }

    /// Selects a single position along `dim`, dropping that dimension.
    pub fn isel(&self, dim: &str, index: usize) -> Result<Variable, SchemaError> {
        let axis = self
            .axis(dim)
            .ok_or_else(|| SchemaError::UnknownDimension(dim.to_owned()))?;
        let mut selected = self.take(axis, &[index]);
        selected.dims.remove(axis);
        selected.shape.remove(axis);
        if let Some(chunks) = selected.chunks.as_mut() {
            chunks.remove(axis);
        }
        Ok(selected)
    }

    /// Creates a new variable with the same dimensions and attributes, but different values.
    pub fn map_values(&self, values: Vec<f64>) -> Variable {
        debug_assert_eq!(values.len(), self.values.len());
        Variable {
            dims: self.dims.clone(),
            shape: self.shape.clone(),
            dtype: DataType::Float64,
            attrs: self.attrs.clone(),
            chunks: self.chunks.clone(),
            values,
        }
    }
}

/// A collection of variables sharing named dimensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// All dimensions and their sizes, in order of first appearance.
    pub dims: IndexMap<String, usize>,
    /// Coordinate variables, which label positions along dimensions.
    pub coords: IndexMap<String, Variable>,
    /// Data variables.
    pub data_vars: IndexMap<String, Variable>,
    /// Global attributes.
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// A human readable name for log messages, taken from the `name` attribute.
    pub fn display_name(&self) -> &str {
        self.attrs
            .get("name")
            .and_then(|name| name.as_str())
            .unwrap_or("unknown")
    }

    /// Looks up a coordinate or data variable.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name).or_else(|| self.data_vars.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variable(name).is_some()
    }

    pub fn is_coord(&self, name: &str) -> bool {
        self.coords.contains_key(name)
    }

    /// Iterates over coordinates first, then data variables.
    pub fn variables(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.coords.iter().chain(self.data_vars.iter())
    }

    /// Inserts or replaces a data variable.
    pub fn insert_var(&mut self, name: impl Into<String>, var: Variable) -> Result<(), SchemaError> {
        let name = name.into();
        self.register_dims(&name, &var)?;
        self.coords.shift_remove(&name);
        self.data_vars.insert(name, var);
        Ok(())
    }

    /// Inserts or replaces a coordinate variable.
    pub fn insert_coord(
        &mut self,
        name: impl Into<String>,
        var: Variable,
    ) -> Result<(), SchemaError> {
        let name = name.into();
        self.register_dims(&name, &var)?;
        self.data_vars.shift_remove(&name);
        self.coords.insert(name, var);
        Ok(())
    }

    /// Removes a variable, returning it.
    ///
    /// Dimensions that are no longer used by any variable are dropped as well.
    pub fn remove(&mut self, name: &str) -> Option<Variable> {
        let removed = self
            .coords
            .shift_remove(name)
            .or_else(|| self.data_vars.shift_remove(name))?;

        let in_use: Vec<String> = self
            .variables()
            .flat_map(|(_, var)| var.dims.iter().cloned())
            .collect();
        self.dims.retain(|dim, _| in_use.contains(dim));

        Some(removed)
    }

    /// Promotes data variables to coordinates.
    pub fn set_coords<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), SchemaError> {
        for name in names {
            let name = name.as_ref();
            if self.coords.contains_key(name) {
                continue;
            }
            let var = self
                .data_vars
                .shift_remove(name)
                .ok_or_else(|| SchemaError::UnknownVariable(name.to_owned()))?;
            self.coords.insert(name.to_owned(), var);
        }
        Ok(())
    }

    /// Gathers the given positions along `dim` in every variable using that dimension.
    pub fn take(&mut self, dim: &str, indices: &[usize]) -> Result<(), SchemaError> {
        let size = self
            .dims
            .get_mut(dim)
            .ok_or_else(|| SchemaError::UnknownDimension(dim.to_owned()))?;
        *size = indices.len();

        for var in self.coords.values_mut().chain(self.data_vars.values_mut()) {
            if let Some(axis) = var.axis(dim) {
                *var = var.take(axis, indices);
            }
        }
        Ok(())
    }

    fn register_dims(&mut self, name: &str, var: &Variable) -> Result<(), SchemaError> {
        if var.shape.iter().product::<usize>() != var.values.len() {
            return Err(SchemaError::ShapeMismatch {
                variable: name.to_owned(),
                shape: var.shape.clone(),
                len: var.values.len(),
            });
        }
        for (dim, &found) in var.dims.iter().zip(&var.shape) {
            if let Some(&expected) = self.dims.get(dim) {
                if expected != found {
                    return Err(SchemaError::DimensionMismatch {
                        variable: name.to_owned(),
                        dim: dim.clone(),
                        expected,
                        found,
                    });
                }
            }
        }
        for (dim, &size) in var.dims.iter().zip(&var.shape) {
            self.dims.entry(dim.clone()).or_insert(size);
        }
        Ok(())
    }
}
