use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::CacheKey;

/// Creates a token identifying one holder of a loading marker.
///
/// Tokens are unique within a process, and the pid and process start time make them unique
/// across processes sharing a cache.
pub fn owner_token() -> String {
    static STARTED: OnceLock<u128> = OnceLock::new();
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let started = STARTED.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    });
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{}-{started:x}-{seq}", std::process::id())
}

#[derive(Debug)]
struct Marker {
    expires_at: Instant,
    owner: String,
}

/// Process-local "dataset is loading" flags with an absolute expiration.
#[derive(Debug)]
pub struct LoadingMarkers {
    timeout: Duration,
    markers: Mutex<HashMap<CacheKey, Marker>>,
}

impl LoadingMarkers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            markers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a live marker exists for `key`. Stale markers are removed.
    pub fn is_set(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut markers = self.markers.lock().unwrap();
        match markers.get(key) {
            Some(marker) if now < marker.expires_at => true,
            Some(_) => {
                tracing::warn!(%key, "Loading marker expired before it was cleared");
                markers.remove(key);
                false
            }
            None => false,
        }
    }

    /// Sets the marker for `owner` unless a live one exists, returning whether it was set.
    pub fn try_set(&self, key: &CacheKey, owner: &str) -> bool {
        let now = Instant::now();
        let mut markers = self.markers.lock().unwrap();
        if matches!(markers.get(key), Some(marker) if now < marker.expires_at) {
            return false;
        }
        let marker = Marker {
            expires_at: now + self.timeout,
            owner: owner.to_owned(),
        };
        markers.insert(key.clone(), marker);
        true
    }

    /// Clears the marker, unless it was taken over by somebody other than `owner`.
    pub fn clear(&self, key: &CacheKey, owner: &str) {
        let mut markers = self.markers.lock().unwrap();
        if markers.get(key).is_some_and(|marker| marker.owner == owner) {
            markers.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_markers() {
        let markers = LoadingMarkers::new(Duration::from_secs(10));
        let key = CacheKey::new("a");

        assert!(!markers.is_set(&key));
        assert!(markers.try_set(&key, "one"));
        assert!(!markers.try_set(&key, "two"));
        assert!(markers.is_set(&key));

        markers.clear(&key, "one");
        assert!(!markers.is_set(&key));
        assert!(markers.try_set(&key, "two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_marker_permits_retry() {
        let markers = LoadingMarkers::new(Duration::from_secs(10));
        let key = CacheKey::new("a");

        assert!(markers.try_set(&key, "one"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!markers.is_set(&key));
        assert!(markers.try_set(&key, "two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_owner_keeps_successor_marker() {
        let markers = LoadingMarkers::new(Duration::from_secs(10));
        let key = CacheKey::new("a");

        assert!(markers.try_set(&key, "slow"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(markers.try_set(&key, "next"));

        // the first loader finishes after its marker expired
        markers.clear(&key, "slow");
        assert!(markers.is_set(&key));

        markers.clear(&key, "next");
        assert!(!markers.is_set(&key));
    }

    #[test]
    fn test_owner_tokens_are_unique() {
        let first = owner_token();
        let second = owner_token();
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("{}-", std::process::id())));
    }
}
