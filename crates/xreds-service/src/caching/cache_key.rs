use std::fmt;
use std::sync::Arc;

/// Identifies a dataset in every cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    id: Arc<str>,
}

impl CacheKey {
    pub fn new(id: &str) -> Self {
        Self { id: id.into() }
    }

    /// The dataset identifier this key was derived from.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The key under which the loaded dataset is stored.
    pub fn data_key(&self) -> String {
        format!("dataset-{}", self.id)
    }

    /// The key under which the loading marker is stored.
    pub fn loading_key(&self) -> String {
        format!("loading-{}", self.id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dataset-{}", self.id)
    }
}

/// Turns a cache key into something that can be used as a single file name.
pub(crate) fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let key = CacheKey::new("gfs");
        assert_eq!(key.data_key(), "dataset-gfs");
        assert_eq!(key.loading_key(), "loading-gfs");
        assert_eq!(key.to_string(), "dataset-gfs");
        assert_eq!(key.id(), "gfs");
    }

    #[test]
    fn test_safe_path_segment() {
        assert_eq!(
            safe_path_segment("dataset-../etc/passwd"),
            "dataset-___etc_passwd"
        );
        assert_eq!(safe_path_segment("dataset-a:b"), "dataset-a_b");
    }
}
