//! Checksummed cache entries.
//!
//! Values are stored as JSON together with a SHA-256 checksum and verified
//! on every read; a mismatch is treated as a miss so the caller refetches
//! from the provider.

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::time::Duration;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cached JSON payload with its checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = sha256_hex(&data);
        Self { data, checksum }
    }

    pub fn is_valid(&self) -> bool {
        sha256_hex(&self.data) == self.checksum
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the payload if the envelope parses and the checksum matches.
    pub fn deserialize_and_validate(serialized: &str) -> Option<String> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;
        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}

/// Typed wrapper over a moka cache that stores validated entries.
///
/// Keys are hashed, so callers may pass raw user text.
#[derive(Clone)]
pub struct ValidatedCache<T> {
    inner: Cache<String, String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValidatedCache<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(max_capacity)
                .build(),
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let raw = self.inner.get(&sha256_hex(key)).await?;
        let data = ValidatedCacheEntry::deserialize_and_validate(&raw)?;
        serde_json::from_str(&data).ok()
    }

    pub async fn insert(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                let entry = ValidatedCacheEntry::new(json);
                self.inner.insert(sha256_hex(key), entry.serialize()).await;
            }
            Err(e) => tracing::warn!("Failed to serialize cache entry: {}", e),
        }
    }

    /// Overwrites the stored envelope for `key` verbatim.
    #[cfg(test)]
    async fn insert_raw(&self, key: &str, raw: String) {
        self.inner.insert(sha256_hex(key), raw).await;
    }
}
