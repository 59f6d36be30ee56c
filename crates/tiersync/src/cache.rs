//! Persistent `archive:entry` → transcoded size cache.
//!
//! The file is an append-only log of JSON records, one per line:
//! `["pack.zip:Tokens/a.png",48213]` sets a size, `["…",null]` removes it.
//! The last record for a key wins. `compact` rewrites the file with one
//! record per live key, sorted by key, through a temp file and a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Size cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode size cache record: {0}")]
    Encode(#[from] serde_json::Error),
}

struct CacheState {
    sizes: HashMap<String, u64>,
    log: Option<File>,
}

pub struct SizeCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl SizeCache {
    /// Load the cache at `path`; a missing file is an empty cache.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let sizes = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&path, &contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        tracing::debug!(path = %path.display(), entries = sizes.len(), "Loaded size cache");
        Ok(Self {
            path,
            state: Mutex::new(CacheState { sizes, log: None }),
        })
    }

    fn parse(path: &Path, contents: &str) -> HashMap<String, u64> {
        let mut sizes = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<(String, Option<u64>)>(line) {
                Ok((key, Some(size))) => {
                    sizes.insert(key, size);
                }
                Ok((key, None)) => {
                    sizes.remove(&key);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping malformed size cache record"
                    );
                }
            }
        }
        sizes
    }

    pub fn key(archive: &str, entry: &str) -> String {
        format!("{archive}:{entry}")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<u64> {
        self.state.lock().await.sizes.get(key).copied()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sizes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn set(&self, key: &str, size: u64) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        self.append(&mut state, key, Some(size)).await?;
        state.sizes.insert(key.to_string(), size);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if state.sizes.remove(key).is_some() {
            self.append(&mut state, key, None).await?;
        }
        Ok(())
    }

    async fn append(
        &self,
        state: &mut CacheState,
        key: &str,
        size: Option<u64>,
    ) -> Result<(), CacheError> {
        let mut line = serde_json::to_string(&(key, size))?;
        line.push('\n');

        let log = match &mut state.log {
            Some(log) => log,
            slot => slot.insert(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .map_err(|source| self.io_err(source))?,
            ),
        };
        log.write_all(line.as_bytes())
            .await
            .map_err(|source| self.io_err(source))?;
        log.flush().await.map_err(|source| self.io_err(source))
    }

    /// Rewrite the file with one sorted record per live key.
    pub async fn compact(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;

        let mut keys: Vec<&String> = state.sizes.keys().collect();
        keys.sort();
        let mut contents = String::new();
        for key in keys {
            contents.push_str(&serde_json::to_string(&(key, Some(state.sizes[key])))?);
            contents.push('\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // Close the append handle before the file is replaced.
        state.log = None;
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| CacheError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_err(source))?;

        tracing::info!(path = %self.path.display(), entries = state.sizes.len(), "Compacted size cache");
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SizeCache::open(dir.path().join("sizes.txt")).await.unwrap();
        assert!(cache.is_empty().await);
        assert_eq!(cache.get("a.zip:b.png").await, None);
    }

    #[tokio::test]
    async fn sizes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes.txt");

        let cache = SizeCache::open(&path).await.unwrap();
        cache.set("a.zip:x.png", 100).await.unwrap();
        cache.set("a.zip:y.png", 200).await.unwrap();
        cache.set("a.zip:x.png", 150).await.unwrap();
        cache.remove("a.zip:y.png").await.unwrap();
        drop(cache);

        let cache = SizeCache::open(&path).await.unwrap();
        assert_eq!(cache.get("a.zip:x.png").await, Some(150));
        assert_eq!(cache.get("a.zip:y.png").await, None);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn compact_sorts_and_drops_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes.txt");

        let cache = SizeCache::open(&path).await.unwrap();
        cache.set("b.zip:z.png", 3).await.unwrap();
        cache.set("a.zip:y.png", 2).await.unwrap();
        cache.set("a.zip:x.png", 1).await.unwrap();
        cache.set("a.zip:x.png", 10).await.unwrap();
        cache.remove("a.zip:y.png").await.unwrap();
        cache.compact().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "[\"a.zip:x.png\",10]\n[\"b.zip:z.png\",3]\n");
        assert!(!dir.path().join("sizes.txt.tmp").exists());

        // Appending after compaction goes to the new file.
        cache.set("c.zip:w.png", 4).await.unwrap();
        drop(cache);
        let cache = SizeCache::open(&path).await.unwrap();
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.get("c.zip:w.png").await, Some(4));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes.txt");
        std::fs::write(
            &path,
            "[\"a.zip:x.png\",5]\nnot json\n\n[\"a.zip:y.png\",\"big\"]\n[\"a.zip:z.png\",7]\n",
        )
        .unwrap();

        let cache = SizeCache::open(&path).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a.zip:x.png").await, Some(5));
        assert_eq!(cache.get("a.zip:z.png").await, Some(7));
    }

    #[test]
    fn key_joins_archive_and_entry() {
        assert_eq!(SizeCache::key("pack.zip", "Tokens/a.png"), "pack.zip:Tokens/a.png");
    }
}
