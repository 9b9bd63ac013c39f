// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The tier cannot be read or written at all.
    #[error("Storage tier unavailable: {0}")]
    Unavailable(String),
    /// The tier is reachable but full.
    #[error("Storage quota exceeded: {used} + {requested} bytes over limit of {limit}")]
    QuotaExceeded {
        used: usize,
        requested: usize,
        limit: usize,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::QuotaExceeded { .. } => "quota",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Storage backends ranked by durability.
///
/// `Ord` follows durability: `None < Memory < Session < Persistent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum StorageTier {
    None = 0,
    Memory = 1,
    Session = 2,
    Persistent = 3,
}

impl StorageTier {
    /// Tiers that hold data, most durable first.
    pub const BY_DURABILITY: [StorageTier; 3] =
        [StorageTier::Persistent, StorageTier::Session, StorageTier::Memory];

    /// Whether data in this tier survives closing the application.
    #[must_use]
    pub fn survives_restart(&self) -> bool {
        matches!(self, Self::Persistent)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::Session => "session",
            Self::Persistent => "persistent",
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synchronous keyed string store (the shape of a browser's
/// `localStorage`/`sessionStorage`).
///
/// Values are opaque strings; the tiered store puts JSON-serialized
/// [`StorageItem`](super::StorageItem)s in them. Calls never suspend.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Remove every key. Default implementation deletes one by one.
    fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// Approximate bytes in use, if the backend tracks it.
    fn used_bytes(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_follows_durability() {
        assert!(StorageTier::None < StorageTier::Memory);
        assert!(StorageTier::Memory < StorageTier::Session);
        assert!(StorageTier::Session < StorageTier::Persistent);
        assert_eq!(StorageTier::BY_DURABILITY[0], StorageTier::Persistent);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(StorageTier::Persistent.to_string(), "persistent");
        assert_eq!(StorageTier::None.to_string(), "none");
        assert!(StorageTier::Persistent.survives_restart());
        assert!(!StorageTier::Session.survives_restart());
    }

    #[test]
    fn test_error_kinds() {
        let quota = StorageError::QuotaExceeded { used: 10, requested: 5, limit: 12 };
        assert!(quota.is_quota());
        assert_eq!(quota.kind(), "quota");
        assert!(quota.to_string().contains("limit of 12"));
        assert!(!StorageError::Unavailable("x".into()).is_quota());
    }
}
