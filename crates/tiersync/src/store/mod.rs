//! Remote object store.
//!
//! Submodules:
//! - `s3`: S3 backend built on `aws-sdk-s3`
//! - `memory`: in-process backend that records every mutation

mod memory;
mod s3;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{MemoryStore, StoreOp};
pub use s3::{S3Config, S3Store, StaticCredentials};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{operation} {key} failed: {message}")]
    Remote {
        operation: &'static str,
        key: String,
        message: String,
    },
    #[error("Object {0} not found")]
    NotFound(String),
}

/// Storage class an object is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageTier {
    Standard,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::StandardIa => "STANDARD_IA",
            Self::OnezoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size-based storage class selection.
///
/// Infrequent-access classes bill small objects as if they were 128 KiB, so
/// only objects close to that size go there; tiny objects stay standard and
/// large ones go to automatic tiering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicy {
    /// Objects smaller than this stay in the standard class.
    pub standard_below: u64,
    /// Objects smaller than this (and not standard) use `infrequent_tier`.
    pub infrequent_below: u64,
    pub infrequent_tier: StorageTier,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            standard_below: 90 * 1024,
            infrequent_below: 128 * 1024,
            infrequent_tier: StorageTier::OnezoneIa,
        }
    }
}

impl TierPolicy {
    pub fn select(&self, size: u64) -> StorageTier {
        if size < self.standard_below {
            StorageTier::Standard
        } else if size < self.infrequent_below {
            self.infrequent_tier
        } else {
            StorageTier::IntelligentTiering
        }
    }
}

/// An object found by `ObjectStore::list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    /// Storage class as reported by the store; `None` means standard.
    pub storage_class: Option<String>,
}

impl RemoteObject {
    pub fn is_stored_as(&self, tier: StorageTier) -> bool {
        self.storage_class
            .as_deref()
            .unwrap_or(StorageTier::Standard.as_str())
            == tier.as_str()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError>;

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        tier: StorageTier,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Server-side copy, keeping metadata, writing `tier`.
    async fn copy(&self, source_key: &str, dest_key: &str, tier: StorageTier)
    -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_policy_boundaries() {
        let policy = TierPolicy::default();
        assert_eq!(policy.select(0), StorageTier::Standard);
        assert_eq!(policy.select(90 * 1024 - 1), StorageTier::Standard);
        assert_eq!(policy.select(90 * 1024), StorageTier::OnezoneIa);
        assert_eq!(policy.select(128 * 1024 - 1), StorageTier::OnezoneIa);
        assert_eq!(policy.select(128 * 1024), StorageTier::IntelligentTiering);
        assert_eq!(policy.select(u64::MAX), StorageTier::IntelligentTiering);
    }

    #[test]
    fn tier_policy_infrequent_tier_is_configurable() {
        let policy: TierPolicy =
            serde_json::from_str(r#"{"infrequent_tier": "STANDARD_IA", "standard_below": 10}"#)
                .unwrap();
        assert_eq!(policy.infrequent_below, 128 * 1024);
        assert_eq!(policy.select(9), StorageTier::Standard);
        assert_eq!(policy.select(10), StorageTier::StandardIa);
    }

    #[test]
    fn missing_storage_class_means_standard() {
        let object = RemoteObject {
            key: "k".into(),
            size: 1,
            storage_class: None,
        };
        assert!(object.is_stored_as(StorageTier::Standard));
        assert!(!object.is_stored_as(StorageTier::OnezoneIa));

        let object = RemoteObject {
            storage_class: Some("INTELLIGENT_TIERING".into()),
            ..object
        };
        assert!(object.is_stored_as(StorageTier::IntelligentTiering));
    }

    #[test]
    fn storage_tier_serializes_as_s3_names() {
        insta::assert_json_snapshot!(
            [
                StorageTier::Standard,
                StorageTier::StandardIa,
                StorageTier::OnezoneIa,
                StorageTier::IntelligentTiering,
            ],
            @r#"
        [
          "STANDARD",
          "STANDARD_IA",
          "ONEZONE_IA",
          "INTELLIGENT_TIERING"
        ]
        "#
        );
    }
}
