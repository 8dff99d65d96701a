//! A reader for zarr v2 stores, as written by xarray.
//!
//! Arrays are read completely into memory. Supported are the `zlib`, `gzip` and `zstd`
//! compressors, integer, unsigned and floating point data types of either endianness, and `C`
//! order. Dimension names come from the `_ARRAY_DIMENSIONS` attribute. Values equal to the fill
//! value become `NaN`, and CF `scale_factor` / `add_offset` packing is undone.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::PathBuf;

use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Deserialize;
use serde_json::Value;

use crate::dataset::{Attributes, DataType, Dataset, Variable};
use crate::registry::DatasetSpec;

use super::store::{DirectoryStore, ReferenceStore, Store};
use super::{FormatOpener, LoadError};

/// Opens zarr stores in local directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZarrOpener;

impl FormatOpener for ZarrOpener {
    fn open(&self, spec: &DatasetSpec) -> Result<Dataset, LoadError> {
        let store = DirectoryStore::new(local_path(&spec.path)?)?;
        read_dataset(&store, &spec.drop_variables)
    }
}

/// Opens kerchunk reference files, or zarr directories converted from netCDF.
#[derive(Debug, Clone, Copy, Default)]
pub struct KerchunkOpener;

impl FormatOpener for KerchunkOpener {
    fn open(&self, spec: &DatasetSpec) -> Result<Dataset, LoadError> {
        let path = local_path(&spec.path)?;
        if path.is_dir() {
            let store = DirectoryStore::new(path)?;
            return read_dataset(&store, &spec.drop_variables);
        }
        let store = ReferenceStore::open(&path)?;
        read_dataset(&store, &spec.drop_variables)
    }
}

fn local_path(path: &str) -> Result<PathBuf, LoadError> {
    match path.strip_prefix("file://") {
        Some(path) => Ok(PathBuf::from(path)),
        None if path.contains("://") => {
            Err(LoadError::Unsupported(format!("remote dataset {path:?}")))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[derive(Debug, Deserialize)]
struct ArrayMetadata {
    zarr_format: u8,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    #[serde(default)]
    compressor: Option<Value>,
    #[serde(default)]
    fill_value: Value,
    #[serde(default = "default_order")]
    order: String,
    #[serde(default)]
    filters: Option<Vec<Value>>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

fn default_order() -> String {
    "C".into()
}

fn malformed(what: impl std::fmt::Display) -> LoadError {
    LoadError::Malformed(what.to_string())
}

/// Collects all `.zarray`, `.zattrs` and `.zgroup` documents, preferring consolidated metadata.
fn load_metadata(store: &dyn Store) -> Result<BTreeMap<String, Value>, LoadError> {
    if let Some(bytes) = store.get(".zmetadata")? {
        #[derive(Deserialize)]
        struct Consolidated {
            metadata: BTreeMap<String, Value>,
        }
        let consolidated: Consolidated = serde_json::from_slice(&bytes)
            .map_err(|err| malformed(format_args!("invalid .zmetadata: {err}")))?;
        return Ok(consolidated.metadata);
    }

    let mut metadata = BTreeMap::new();
    for key in store.keys()? {
        let is_metadata = [".zarray", ".zattrs", ".zgroup"]
            .iter()
            .any(|suffix| key.rsplit('/').next() == Some(*suffix));
        if !is_metadata {
            continue;
        }
        let Some(bytes) = store.get(&key)? else {
            continue;
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| malformed(format_args!("invalid {key}: {err}")))?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Reads all arrays at the root of a zarr store into a [`Dataset`].
pub fn read_dataset(store: &dyn Store, drop_variables: &[String]) -> Result<Dataset, LoadError> {
    let metadata = load_metadata(store)?;
    if !metadata.contains_key(".zgroup") && !metadata.keys().any(|k| k.ends_with("/.zarray")) {
        return Err(malformed("store contains no zarr group"));
    }

    let mut dataset = Dataset::new();
    if let Some(Value::Object(attrs)) = metadata.get(".zattrs") {
        dataset.attrs = attrs.clone().into_iter().collect();
    }

    let mut coord_names = BTreeSet::new();
    let mut variables = Vec::new();
    for (key, meta) in &metadata {
        let Some(name) = key.strip_suffix("/.zarray") else {
            continue;
        };
        // nested groups are not part of the dataset
        if name.contains('/') || drop_variables.iter().any(|d| d == name) {
            continue;
        }

        let attrs = match metadata.get(&format!("{name}/.zattrs")) {
            Some(Value::Object(attrs)) => attrs.clone().into_iter().collect(),
            _ => Attributes::new(),
        };
        let mut var = read_array(store, name, meta, attrs)?;
        if let Some(Value::String(coords)) = var.attrs.remove("coordinates") {
            coord_names.extend(coords.split_whitespace().map(str::to_owned));
        }
        variables.push((name.to_owned(), var));
    }

    for (name, var) in variables {
        let is_dimension_coord = var.dims.len() == 1 && var.dims[0] == name;
        if is_dimension_coord || coord_names.contains(&name) {
            dataset.insert_coord(name, var)?;
        } else {
            dataset.insert_var(name, var)?;
        }
    }
    Ok(dataset)
}

fn read_array(
    store: &dyn Store,
    name: &str,
    meta: &Value,
    mut attrs: Attributes,
) -> Result<Variable, LoadError> {
    let meta = ArrayMetadata::deserialize(meta)
        .map_err(|err| malformed(format_args!("invalid {name}/.zarray: {err}")))?;
    if meta.zarr_format != 2 {
        return Err(LoadError::Unsupported(format!(
            "zarr format {}",
            meta.zarr_format
        )));
    }
    if meta.order != "C" {
        return Err(LoadError::Unsupported(format!("{} order", meta.order)));
    }
    if meta.filters.as_ref().is_some_and(|filters| !filters.is_empty()) {
        return Err(LoadError::Unsupported(format!("filters on {name}")));
    }
    if meta.shape.len() != meta.chunks.len() || meta.chunks.contains(&0) {
        return Err(malformed(format_args!("invalid chunks for {name}")));
    }
    let (dtype, little_endian) = parse_dtype(&meta.dtype)?;

    let dims = match attrs.remove("_ARRAY_DIMENSIONS") {
        Some(dims) => Vec::<String>::deserialize(dims)
            .map_err(|_| malformed(format_args!("invalid dimensions for {name}")))?,
        None => (0..meta.shape.len()).map(|i| format!("dim_{i}")).collect(),
    };
    if dims.len() != meta.shape.len() {
        return Err(malformed(format_args!("invalid dimensions for {name}")));
    }

    let len: usize = meta.shape.iter().product();
    let mut values = vec![f64::NAN; len];
    let chunk_len: usize = meta.chunks.iter().product();
    let separator = meta.dimension_separator.as_deref().unwrap_or(".");
    let grid: Vec<usize> = meta
        .shape
        .iter()
        .zip(&meta.chunks)
        .map(|(s, c)| s.div_ceil(*c))
        .collect();

    if len > 0 {
        let mut chunk_idx = vec![0; grid.len()];
        loop {
            let key = if chunk_idx.is_empty() {
                format!("{name}/0")
            } else {
                let parts: Vec<String> = chunk_idx.iter().map(usize::to_string).collect();
                format!("{name}/{}", parts.join(separator))
            };
            // missing chunks are entirely made up of the fill value
            if let Some(raw) = store.get(&key)? {
                let bytes = decompress(meta.compressor.as_ref(), raw)
                    .map_err(|err| malformed(format_args!("failed to decompress {key}: {err}")))?;
                let chunk = decode(&bytes, dtype, little_endian, chunk_len)
                    .ok_or_else(|| malformed(format_args!("chunk {key} has the wrong size")))?;
                place_chunk(&mut values, &meta.shape, &meta.chunks, &chunk_idx, &chunk);
            }
            if !next_index(&mut chunk_idx, &grid) {
                break;
            }
        }
    }

    let mut missing: Vec<f64> = [fill_value(&meta.fill_value)]
        .into_iter()
        .chain(["_FillValue", "missing_value"].map(|k| attrs.remove(k).as_ref().and_then(fill_value)))
        .flatten()
        .collect();
    missing.dedup();
    if !missing.is_empty() {
        for value in &mut values {
            if missing.contains(value) {
                *value = f64::NAN;
            }
        }
    }

    let mut dtype = dtype;
    let scale = attrs.remove("scale_factor").and_then(|v| v.as_f64());
    let offset = attrs.remove("add_offset").and_then(|v| v.as_f64());
    if scale.is_some() || offset.is_some() {
        let (scale, offset) = (scale.unwrap_or(1.), offset.unwrap_or(0.));
        for value in &mut values {
            *value = *value * scale + offset;
        }
        dtype = DataType::Float64;
    }

    Ok(Variable {
        dims,
        shape: meta.shape,
        dtype,
        attrs,
        chunks: Some(meta.chunks),
        values,
    })
}

/// Advances a row-major multi-dimensional index, returning `false` once it wrapped around.
fn next_index(idx: &mut [usize], bounds: &[usize]) -> bool {
    for d in (0..idx.len()).rev() {
        idx[d] += 1;
        if idx[d] < bounds[d] {
            return true;
        }
        idx[d] = 0;
    }
    false
}

/// Copies a decoded chunk into its place in the full array. Edge chunks are clipped.
fn place_chunk(
    out: &mut [f64],
    shape: &[usize],
    chunk_shape: &[usize],
    chunk_idx: &[usize],
    chunk: &[f64],
) {
    let nd = shape.len();
    if nd == 0 {
        out[0] = chunk[0];
        return;
    }

    let origin: Vec<usize> = chunk_idx
        .iter()
        .zip(chunk_shape)
        .map(|(i, c)| i * c)
        .collect();
    let extent: Vec<usize> = (0..nd)
        .map(|d| chunk_shape[d].min(shape[d] - origin[d]))
        .collect();
    let out_strides = strides(shape);
    let chunk_strides = strides(chunk_shape);

    // copy contiguous runs along the innermost dimension
    let run = extent[nd - 1];
    let mut local = vec![0; nd - 1];
    loop {
        let mut src = 0;
        let mut dst = origin[nd - 1];
        for d in 0..nd - 1 {
            src += local[d] * chunk_strides[d];
            dst += (origin[d] + local[d]) * out_strides[d];
        }
        out[dst..dst + run].copy_from_slice(&chunk[src..src + run]);

        if !next_index(&mut local, &extent[..nd - 1]) {
            break;
        }
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

fn parse_dtype(dtype: &str) -> Result<(DataType, bool), LoadError> {
    let unsupported = || LoadError::Unsupported(format!("data type {dtype:?}"));
    let mut chars = dtype.chars();
    let little_endian = match chars.next() {
        Some('<' | '|') => true,
        Some('>') => false,
        _ => return Err(unsupported()),
    };
    let dtype = match chars.as_str() {
        "i1" => DataType::Int8,
        "i2" => DataType::Int16,
        "i4" => DataType::Int32,
        "i8" => DataType::Int64,
        "u1" | "b1" => DataType::UInt8,
        "u2" => DataType::UInt16,
        "u4" => DataType::UInt32,
        "u8" => DataType::UInt64,
        "f4" => DataType::Float32,
        "f8" => DataType::Float64,
        _ => return Err(unsupported()),
    };
    Ok((dtype, little_endian))
}

fn fill_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // NaN is the missing value already
        Value::String(s) if s == "Infinity" => Some(f64::INFINITY),
        Value::String(s) if s == "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn decompress(compressor: Option<&Value>, raw: Vec<u8>) -> std::io::Result<Vec<u8>> {
    let id = match compressor {
        None | Some(Value::Null) => return Ok(raw),
        Some(compressor) => compressor.get("id").and_then(Value::as_str).unwrap_or(""),
    };
    let mut out = Vec::new();
    match id {
        "zlib" => {
            ZlibDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        }
        "gzip" => {
            GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        }
        "zstd" => out = zstd::stream::decode_all(raw.as_slice())?,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unsupported compressor {other:?}"),
            ));
        }
    }
    Ok(out)
}

fn convert<const N: usize>(bytes: &[u8], f: impl Fn([u8; N]) -> f64) -> Vec<f64> {
    bytes
        .chunks_exact(N)
        .map(|b| {
            let mut arr = [0; N];
            arr.copy_from_slice(b);
            f(arr)
        })
        .collect()
}

/// Decodes `len` elements, or returns `None` if `bytes` has the wrong size.
fn decode(bytes: &[u8], dtype: DataType, little_endian: bool, len: usize) -> Option<Vec<f64>> {
    if bytes.len() != len * dtype.size() {
        return None;
    }

    macro_rules! num {
        ($t:ty, $n:literal) => {
            convert::<$n>(bytes, |b| {
                (if little_endian {
                    <$t>::from_le_bytes(b)
                } else {
                    <$t>::from_be_bytes(b)
                }) as f64
            })
        };
    }

    Some(match dtype {
        DataType::Int8 => num!(i8, 1),
        DataType::Int16 => num!(i16, 2),
        DataType::Int32 => num!(i32, 4),
        DataType::Int64 => num!(i64, 8),
        DataType::UInt8 => num!(u8, 1),
        DataType::UInt16 => num!(u16, 2),
        DataType::UInt32 => num!(u32, 4),
        DataType::UInt64 => num!(u64, 8),
        DataType::Float32 => num!(f32, 4),
        DataType::Float64 => num!(f64, 8),
    })
}
