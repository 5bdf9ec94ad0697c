use sha2::{Digest, Sha256};

/// Checksum envelope for entries written to the durable cache layer.
///
/// The durable layer lives outside the process (files on disk), so anything
/// read back is verified before it is trusted:
/// 1. A SHA-256 checksum is computed when the entry is mirrored
/// 2. The checksum is recomputed when the entry is rehydrated
/// 3. A mismatch or unreadable envelope is treated as a cache miss
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    /// Serialized `CacheEntry` JSON.
    pub data: String,
    /// SHA-256 checksum of `data` (hex encoded).
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Serializes the envelope for the durable store.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the wrapped data if the envelope parses and its checksum matches.
    pub fn deserialize_and_validate(serialized: &str) -> Option<String> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;

        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Durable cache entry rejected: checksum mismatch (expected {}, {} bytes)",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}

/// Stable file-system friendly name for a cache key.
pub fn key_digest(key: &str) -> String {
    ValidatedCacheEntry::compute_checksum(key)
}
