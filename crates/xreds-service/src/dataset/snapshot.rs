//! Binary snapshots of a [`Dataset`], as stored in the shared cache.
//!
//! The layout is:
//!
//! ```text
//! "XRDS" | version: u8 | zstd( header_len: u32 LE | JSON header | values: f64 LE ... )
//! ```
//!
//! The JSON header is the serialized [`Dataset`] without any array values. The values of all
//! coordinates followed by all data variables are appended in header order.

use std::io;

use thiserror::Error;

use super::Dataset;

const MAGIC: &[u8; 4] = b"XRDS";
const VERSION: u8 = 1;
const COMPRESSION_LEVEL: i32 = 3;

/// Errors decoding a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("not a dataset snapshot")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot is truncated")]
    Truncated,
    #[error("snapshot has {0} trailing bytes")]
    TrailingData(usize),
    #[error("failed to (de)compress snapshot")]
    Io(#[from] io::Error),
    #[error("invalid snapshot header")]
    Header(#[from] serde_json::Error),
}

/// Serializes a dataset into a snapshot.
pub fn encode(dataset: &Dataset) -> Result<Vec<u8>, SnapshotError> {
    let header = serde_json::to_vec(dataset)?;
    let value_count: usize = dataset.variables().map(|(_, var)| var.len()).sum();

    let mut payload = Vec::with_capacity(4 + header.len() + value_count * 8);
    let header_len = u32::try_from(header.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "snapshot header too large")
    })?;
    payload.extend_from_slice(&header_len.to_le_bytes());
    payload.extend_from_slice(&header);
    for (_, var) in dataset.variables() {
        for value in &var.values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    let compressed = zstd::bulk::compress(&payload, COMPRESSION_LEVEL)?;

    let mut out = Vec::with_capacity(MAGIC.len() + 1 + compressed.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Restores a dataset from a snapshot.
pub fn decode(bytes: &[u8]) -> Result<Dataset, SnapshotError> {
    let rest = bytes.strip_prefix(MAGIC).ok_or(SnapshotError::BadMagic)?;
    let (&version, compressed) = rest.split_first().ok_or(SnapshotError::Truncated)?;
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let payload = zstd::stream::decode_all(compressed)?;
    let (header_len, payload) = payload.split_at_checked(4).ok_or(SnapshotError::Truncated)?;
    let header_len = u32::from_le_bytes([header_len[0], header_len[1], header_len[2], header_len[3]]);
    let (header, mut values) = payload
        .split_at_checked(header_len as usize)
        .ok_or(SnapshotError::Truncated)?;

    let mut dataset: Dataset = serde_json::from_slice(header)?;
    for var in dataset
        .coords
        .values_mut()
        .chain(dataset.data_vars.values_mut())
    {
        let len: usize = var.shape.iter().product();
        let (chunk, rest) = values
            .split_at_checked(len * 8)
            .ok_or(SnapshotError::Truncated)?;
        var.values = chunk
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        values = rest;
    }

    if !values.is_empty() {
        return Err(SnapshotError::TrailingData(values.len()));
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use crate::dataset::{DataType, Variable};

    use super::*;

    fn sample() -> Dataset {
        let mut ds = Dataset::new();
        ds.attrs.insert("name".into(), "sample".into());
        ds.insert_coord(
            "time",
            Variable::new(["time"], vec![2], vec![0., 3600.]).with_attr("units", "seconds"),
        )
        .unwrap();
        ds.insert_var(
            "zeta",
            Variable::new(["time", "node"], vec![2, 2], vec![0.5, f64::NAN, -1.25, 2.0])
                .with_dtype(DataType::Float32),
        )
        .unwrap();
        ds
    }

    #[test]
    fn test_snapshot_restores_dataset() {
        let original = sample();
        let restored = decode(&encode(&original).unwrap()).unwrap();

        assert_eq!(restored.dims, original.dims);
        assert_eq!(restored.attrs, original.attrs);
        assert_eq!(restored.coords, original.coords);
        assert_eq!(restored.data_vars["zeta"].dtype, DataType::Float32);

        // NaN never compares equal, so compare the bit patterns
        let bits = |ds: &Dataset| -> Vec<u64> {
            ds.data_vars["zeta"].values.iter().map(|v| v.to_bits()).collect()
        };
        assert_eq!(bits(&restored), bits(&original));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(decode(b"NOPE\x01"), Err(SnapshotError::BadMagic)));
    }

    #[test]
    fn test_other_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[4] = 42;
        assert!(matches!(
            decode(&bytes),
            Err(SnapshotError::UnsupportedVersion(42))
        ));
    }

    #[test]
    fn test_corrupt_payload() {
        let mut bytes = encode(&sample()).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(decode(&bytes).is_err());
    }
}
