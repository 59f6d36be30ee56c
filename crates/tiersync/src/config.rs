//! Sync configuration, read from a JSON file.
//!
//! Only `archive_dir` and `s3.bucket` are required; everything else has a
//! default. Static AWS keys can come from a separate auth file of the form
//! `{"credentials": {"accessKeyId": "…", "secretAccessKey": "…"}, "region": "…"}`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::remap::RemapRules;
use crate::store::{S3Config, StaticCredentials, TierPolicy};
use crate::transcode::TranscodeParams;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cached-avifsizes.txt")
}

fn default_compression_slots() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64 * 2)
        .unwrap_or(2)
}

fn default_upload_budget() -> u64 {
    5_000_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Directory holding the source zip archives.
    pub archive_dir: PathBuf,
    pub s3: S3Config,
    /// Key prefix managed by the sync. Objects outside it are never touched.
    #[serde(default)]
    pub prefix: String,
    /// AWS auth file with static keys and a region.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    /// Concurrent transcodes.
    #[serde(default = "default_compression_slots")]
    pub compression_slots: u64,
    /// Bytes of encoded output uploading at once.
    #[serde(default = "default_upload_budget")]
    pub upload_budget_bytes: u64,
    #[serde(default)]
    pub transcode: TranscodeParams,
    #[serde(default)]
    pub tiers: TierPolicy,
    #[serde(default)]
    pub remap: RemapRules,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub delete_orphans: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthCredentials {
    access_key_id: String,
    secret_access_key: String,
}

#[derive(Deserialize)]
struct AuthFile {
    credentials: AuthCredentials,
    #[serde(default)]
    region: Option<String>,
}

async fn read(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl SyncConfig {
    /// Read and validate `path`, then merge in the auth file if one is named.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::parse(path, &read(path).await?)?;
        if let Some(auth_path) = config.credentials_file.clone() {
            config.apply_auth_file(&auth_path).await?;
        }
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigError::Invalid("s3.bucket must not be empty".into()));
        }
        if self.compression_slots == 0 {
            return Err(ConfigError::Invalid("compression_slots must be positive".into()));
        }
        if self.upload_budget_bytes == 0 {
            return Err(ConfigError::Invalid(
                "upload_budget_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    async fn apply_auth_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let auth: AuthFile =
            serde_json::from_str(&read(path).await?).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        self.s3.credentials = Some(StaticCredentials {
            access_key_id: auth.credentials.access_key_id,
            secret_access_key: auth.credentials.secret_access_key,
        });
        // An explicit region in the main config wins.
        if self.s3.region.is_none() {
            self.s3.region = auth.region;
        }
        tracing::debug!(path = %path.display(), "Loaded static AWS credentials");
        Ok(())
    }

    /// Key prefix including the trailing separator, or empty.
    pub fn key_prefix(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        }
    }
}
