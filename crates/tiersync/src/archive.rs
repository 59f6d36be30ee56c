//! Archive access.
//!
//! An `ArchiveSource` enumerates archives; each opened `ArchiveReader` lists
//! its entries and reads entry bytes on demand.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid zip archive {archive}: {source}")]
    Zip {
        archive: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("Entry {entry} not found in {archive}")]
    EntryNotFound { archive: String, entry: String },
    #[error("Archive {0} not found")]
    NotFound(String),
    #[error("Archive reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub is_file: bool,
}

#[async_trait]
pub trait ArchiveReader: Send + Sync {
    fn name(&self) -> &str;

    async fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>, ArchiveError>;
}

#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Archive names in processing order.
    async fn list(&self) -> Result<Vec<String>, ArchiveError>;

    async fn open(&self, name: &str) -> Result<Arc<dyn ArchiveReader>, ArchiveError>;
}

/// Every regular, non-hidden file in a directory, opened as a zip archive.
pub struct ZipDirectory {
    root: PathBuf,
}

impl ZipDirectory {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ArchiveSource for ZipDirectory {
    async fn list(&self) -> Result<Vec<String>, ArchiveError> {
        let io_err = |source| ArchiveError::Io {
            path: self.root.clone(),
            source,
        };

        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // macOS resource forks and other hidden files
            if name.starts_with('.') {
                continue;
            }
            let metadata = tokio::fs::metadata(entry.path()).await.map_err(io_err)?;
            if metadata.is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn open(&self, name: &str) -> Result<Arc<dyn ArchiveReader>, ArchiveError> {
        let path = self.root.join(name);
        let archive_name = name.to_string();
        let reader = tokio::task::spawn_blocking(move || ZipReader::open(archive_name, path))
            .await??;
        Ok(Arc::new(reader))
    }
}

/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// The declared size comes from the archive header and is not trusted.
fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_PREALLOC, |n| n.min(MAX_PREALLOC))
}

/// Zip archive backed by a local file. Reads run on the blocking pool.
pub struct ZipReader {
    name: String,
    archive: Arc<Mutex<zip::ZipArchive<File>>>,
}

impl ZipReader {
    pub fn open(name: String, path: PathBuf) -> Result<Self, ArchiveError> {
        let file = File::open(&path).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;
        let archive = zip::ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
            archive: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            archive: Arc::new(Mutex::new(archive)),
        })
    }

    fn zip_err(archive: &str) -> impl Fn(zip::result::ZipError) -> ArchiveError + '_ {
        move |source| ArchiveError::Zip {
            archive: archive.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ArchiveReader for ZipReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let archive = Arc::clone(&self.archive);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ArchiveEntry>, ArchiveError> {
            let mut zip = archive.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries = Vec::with_capacity(zip.len());
            for index in 0..zip.len() {
                let file = zip.by_index_raw(index).map_err(Self::zip_err(&name))?;
                entries.push(ArchiveEntry {
                    name: file.name().to_string(),
                    is_file: !file.is_dir(),
                });
            }
            Ok(entries)
        })
        .await?
    }

    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        let archive = Arc::clone(&self.archive);
        let name = self.name.clone();
        let entry = entry.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ArchiveError> {
            let mut zip = archive.lock().unwrap_or_else(|e| e.into_inner());
            let mut file = match zip.by_name(&entry) {
                Ok(file) => file,
                Err(zip::result::ZipError::FileNotFound) => {
                    return Err(ArchiveError::EntryNotFound {
                        archive: name,
                        entry,
                    });
                }
                Err(source) => return Err(Self::zip_err(&name)(source)),
            };
            let mut buf = Vec::with_capacity(initial_capacity(file.size()));
            file.read_to_end(&mut buf).map_err(|source| ArchiveError::Io {
                path: PathBuf::from(format!("{name}:{entry}")),
                source,
            })?;
            Ok(buf)
        })
        .await?
    }
}

/// In-memory archives, keyed by archive name.
#[derive(Default, Clone)]
pub struct MemoryArchives {
    archives: BTreeMap<String, Arc<MemoryArchive>>,
}

impl MemoryArchives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an archive; entry names ending in `/` are directories.
    pub fn with_archive<I, N>(mut self, name: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: Into<String>,
    {
        let entries = entries.into_iter().map(|(n, d)| (n.into(), d)).collect();
        self.archives.insert(
            name.to_string(),
            Arc::new(MemoryArchive {
                name: name.to_string(),
                entries,
            }),
        );
        self
    }
}

#[async_trait]
impl ArchiveSource for MemoryArchives {
    async fn list(&self) -> Result<Vec<String>, ArchiveError> {
        Ok(self.archives.keys().cloned().collect())
    }

    async fn open(&self, name: &str) -> Result<Arc<dyn ArchiveReader>, ArchiveError> {
        match self.archives.get(name) {
            Some(archive) => Ok(Arc::clone(archive) as Arc<dyn ArchiveReader>),
            None => Err(ArchiveError::NotFound(name.to_string())),
        }
    }
}

pub struct MemoryArchive {
    name: String,
    entries: Vec<(String, Vec<u8>)>,
}

#[async_trait]
impl ArchiveReader for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(self
            .entries
            .iter()
            .map(|(name, _)| ArchiveEntry {
                name: name.clone(),
                is_file: !name.ends_with('/'),
            })
            .collect())
    }

    async fn read_entry(&self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        self.entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| ArchiveError::EntryNotFound {
                archive: self.name.clone(),
                entry: entry.to_string(),
            })
    }
}
