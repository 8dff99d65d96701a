//! Helpers for testing the dataset service and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Once dropped, the directory and every fixture written into it
//!    are deleted.
//!
//!  - Datasets are written on the fly with [`ZarrFixture`], either as a zarr directory store or
//!    as a kerchunk reference file pointing into a single binary file.

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::Compression as Level;
use flate2::write::{GzEncoder, ZlibEncoder};
use serde_json::{Map, Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the xreds crates and mutes all other
///    logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("xreds=trace,xreds_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// How chunks of a [`ZarrFixture`] are compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Zlib,
    Gzip,
    Zstd,
}

impl Compression {
    fn metadata(self) -> Value {
        match self {
            Compression::None => Value::Null,
            Compression::Zlib => json!({"id": "zlib", "level": 1}),
            Compression::Gzip => json!({"id": "gzip", "level": 1}),
            Compression::Zstd => json!({"id": "zstd", "level": 1}),
        }
    }

    fn compress(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Compression::None => data,
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Level::fast());
                encoder.write_all(&data).unwrap();
                encoder.finish().unwrap()
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Level::fast());
                encoder.write_all(&data).unwrap();
                encoder.finish().unwrap()
            }
            Compression::Zstd => zstd::bulk::compress(&data, 1).unwrap(),
        }
    }
}

/// A single array of a [`ZarrFixture`].
///
/// Values are given as `f64` in row-major order, and converted to the array's `dtype` when
/// written.
#[derive(Debug, Clone)]
pub struct ZarrArray {
    name: String,
    dims: Vec<String>,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    fill_value: Value,
    attrs: Map<String, Value>,
    values: Vec<f64>,
}

impl ZarrArray {
    /// Creates a `<f8` array stored in a single chunk.
    ///
    /// # Panics
    ///
    /// Panics if the values do not match the shape.
    pub fn new(name: &str, dims: &[&str], shape: &[usize], values: Vec<f64>) -> Self {
        assert_eq!(dims.len(), shape.len());
        assert_eq!(shape.iter().product::<usize>(), values.len());
        Self {
            name: name.to_owned(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape: shape.to_vec(),
            chunks: shape.iter().map(|s| (*s).max(1)).collect(),
            dtype: "<f8".into(),
            fill_value: "NaN".into(),
            attrs: Map::new(),
            values,
        }
    }

    pub fn chunks(mut self, chunks: &[usize]) -> Self {
        assert_eq!(chunks.len(), self.shape.len());
        self.chunks = chunks.to_vec();
        self
    }

    /// Sets the numpy style data type, e.g. `">i2"`.
    pub fn dtype(mut self, dtype: &str) -> Self {
        self.dtype = dtype.to_owned();
        if !dtype.contains('f') && self.fill_value == "NaN" {
            self.fill_value = Value::Null;
        }
        self
    }

    pub fn fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = fill_value.into();
        self
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_owned(), value.into());
        self
    }

    fn zarray(&self, compression: Compression) -> Value {
        json!({
            "zarr_format": 2,
            "shape": self.shape,
            "chunks": self.chunks,
            "dtype": self.dtype,
            "compressor": compression.metadata(),
            "fill_value": self.fill_value,
            "order": "C",
            "filters": null,
        })
    }

    fn zattrs(&self) -> Value {
        let mut attrs = self.attrs.clone();
        attrs.insert("_ARRAY_DIMENSIONS".into(), json!(self.dims));
        Value::Object(attrs)
    }

    fn encode(&self, value: f64, out: &mut Vec<u8>) {
        match self.dtype.as_str() {
            "<f8" => out.extend_from_slice(&value.to_le_bytes()),
            ">f8" => out.extend_from_slice(&value.to_be_bytes()),
            "<f4" => out.extend_from_slice(&(value as f32).to_le_bytes()),
            ">f4" => out.extend_from_slice(&(value as f32).to_be_bytes()),
            "|i1" => out.extend_from_slice(&(value as i8).to_le_bytes()),
            "|u1" | "|b1" => out.push(value as u8),
            "<i2" => out.extend_from_slice(&(value as i16).to_le_bytes()),
            ">i2" => out.extend_from_slice(&(value as i16).to_be_bytes()),
            "<i4" => out.extend_from_slice(&(value as i32).to_le_bytes()),
            ">i4" => out.extend_from_slice(&(value as i32).to_be_bytes()),
            "<u2" => out.extend_from_slice(&(value as u16).to_le_bytes()),
            "<i8" => out.extend_from_slice(&(value as i64).to_le_bytes()),
            other => panic!("unsupported fixture dtype {other}"),
        }
    }

    /// Returns all chunks as `(key, compressed bytes)`, in row-major chunk order.
    fn encoded_chunks(&self, compression: Compression) -> Vec<(String, Vec<u8>)> {
        if self.shape.is_empty() {
            let mut data = Vec::new();
            self.encode(self.values[0], &mut data);
            return vec![(format!("{}/0", self.name), compression.compress(data))];
        }
        if self.values.is_empty() {
            return Vec::new();
        }

        let fill = self.fill_value.as_f64().unwrap_or(f64::NAN);
        let grid: Vec<usize> = self
            .shape
            .iter()
            .zip(&self.chunks)
            .map(|(s, c)| s.div_ceil(*c))
            .collect();

        let mut chunks = Vec::new();
        let mut chunk_idx = vec![0; grid.len()];
        loop {
            let mut data = Vec::new();
            let mut local = vec![0; self.chunks.len()];
            loop {
                let mut flat = 0;
                let mut inside = true;
                for d in 0..self.shape.len() {
                    let global = chunk_idx[d] * self.chunks[d] + local[d];
                    inside &= global < self.shape[d];
                    flat = flat * self.shape[d] + global;
                }
                let value = if inside { self.values[flat] } else { fill };
                self.encode(value, &mut data);
                if !increment(&mut local, &self.chunks) {
                    break;
                }
            }

            let parts: Vec<String> = chunk_idx.iter().map(usize::to_string).collect();
            let key = format!("{}/{}", self.name, parts.join("."));
            chunks.push((key, compression.compress(data)));
            if !increment(&mut chunk_idx, &grid) {
                break;
            }
        }
        chunks
    }
}

fn increment(idx: &mut [usize], bounds: &[usize]) -> bool {
    for d in (0..idx.len()).rev() {
        idx[d] += 1;
        if idx[d] < bounds[d] {
            return true;
        }
        idx[d] = 0;
    }
    false
}

/// Builds a zarr v2 dataset as xarray would write it.
#[derive(Debug, Clone, Default)]
pub struct ZarrFixture {
    attrs: Map<String, Value>,
    arrays: Vec<ZarrArray>,
    consolidated: bool,
    compression: Compression,
}

impl ZarrFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a global attribute.
    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_owned(), value.into());
        self
    }

    pub fn array(mut self, array: ZarrArray) -> Self {
        self.arrays.push(array);
        self
    }

    /// Whether to write consolidated metadata into `.zmetadata`.
    pub fn consolidated(mut self, consolidated: bool) -> Self {
        self.consolidated = consolidated;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn metadata(&self) -> Vec<(String, Value)> {
        let mut metadata = vec![
            (".zgroup".to_owned(), json!({"zarr_format": 2})),
            (".zattrs".to_owned(), Value::Object(self.attrs.clone())),
        ];
        for array in &self.arrays {
            metadata.push((
                format!("{}/.zarray", array.name),
                array.zarray(self.compression),
            ));
            metadata.push((format!("{}/.zattrs", array.name), array.zattrs()));
        }
        metadata
    }

    /// Writes a zarr directory store to `path`.
    pub fn write(&self, path: &Path) {
        let metadata = self.metadata();
        let chunks = self
            .arrays
            .iter()
            .flat_map(|array| array.encoded_chunks(self.compression));

        let mut entries: Vec<(String, Vec<u8>)> = metadata
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::to_vec_pretty(value).unwrap()))
            .chain(chunks)
            .collect();
        if self.consolidated {
            let consolidated = json!({
                "metadata": metadata.into_iter().collect::<Map<_, _>>(),
                "zarr_consolidated_format": 1,
            });
            entries.push((".zmetadata".into(), serde_json::to_vec(&consolidated).unwrap()));
        }

        for (key, bytes) in entries {
            let file = path.join(key);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, bytes).unwrap();
        }
    }

    /// Writes a version 1 kerchunk reference file to `refs_path`.
    ///
    /// All chunks are concatenated into `data_file`, next to the reference file. Metadata is
    /// inlined into the references.
    pub fn write_kerchunk(&self, refs_path: &Path, data_file: &str) {
        let mut refs = Map::new();
        for (key, value) in self.metadata() {
            refs.insert(key, value.to_string().into());
        }

        let mut data = Vec::new();
        for array in &self.arrays {
            for (key, bytes) in array.encoded_chunks(self.compression) {
                refs.insert(key, json!(["{{data}}", data.len(), bytes.len()]));
                data.extend_from_slice(&bytes);
            }
        }

        let references = json!({
            "version": 1,
            "templates": {"data": data_file},
            "refs": refs,
        });
        let dir = refs_path.parent().unwrap();
        fs::write(dir.join(data_file), data).unwrap();
        fs::write(refs_path, serde_json::to_vec(&references).unwrap()).unwrap();
    }
}
