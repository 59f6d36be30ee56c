//! Archive → object store synchronisation.
//!
//! One archive at a time, every admissible entry is submitted to the
//! compression queue (weight 1). A compression task settles the entry's
//! encoded size (cache or transcode), picks a storage tier and compares with
//! the remote listing. When bytes must be written it submits the upload to the
//! upload queue, weighted by the encoded size, and finishes once that upload
//! is admitted. Both queues are drained before the next archive is opened.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::archive::{ArchiveError, ArchiveSource};
use crate::cache::{CacheError, SizeCache};
use crate::config::{ConfigError, SyncConfig};
use crate::gate::{AdmissionError, TaskQueue};
use crate::remap::{FilenameRemapper, RemapError, RuleRemapper};
use crate::store::{ObjectStore, RemoteObject, StorageTier, StoreError, TierPolicy};
use crate::transcode::{EntryImage, TranscodeError, TranscodeParams, Transcoder};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Target {key} is already claimed by {claimed_by}; cannot place {entry}")]
    DuplicateTarget {
        key: String,
        claimed_by: String,
        entry: String,
    },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Key prefix, empty or ending in `/`.
    pub prefix: String,
    pub compression_slots: u64,
    pub upload_budget_bytes: u64,
    pub transcode: TranscodeParams,
    pub tiers: TierPolicy,
    /// Log remote mutations instead of performing them.
    pub dry_run: bool,
    pub delete_orphans: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            compression_slots: 2,
            upload_budget_bytes: 5_000_000,
            transcode: TranscodeParams::default(),
            tiers: TierPolicy::default(),
            dry_run: false,
            delete_orphans: true,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            prefix: config.key_prefix(),
            compression_slots: config.compression_slots,
            upload_budget_bytes: config.upload_budget_bytes,
            transcode: config.transcode,
            tiers: config.tiers,
            dry_run: config.dry_run,
            delete_orphans: config.delete_orphans,
        }
    }
}

/// Counters for one `SyncPipeline::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub archives: u64,
    pub archives_failed: u64,
    /// File entries seen, including skipped ones.
    pub entries: u64,
    /// Entries the remapper rejected.
    pub skipped: u64,
    pub cache_hits: u64,
    pub transcoded: u64,
    pub unchanged: u64,
    /// Every completed put, including replacements.
    pub uploaded: u64,
    /// Size mismatches: remote deleted and re-uploaded.
    pub replaced: u64,
    /// Copied onto themselves with a new storage class.
    pub retiered: u64,
    pub failed: u64,
    pub orphans_deleted: u64,
    pub dry_run: bool,
}

#[derive(Default)]
struct SyncStats {
    archives: AtomicU64,
    archives_failed: AtomicU64,
    entries: AtomicU64,
    skipped: AtomicU64,
    cache_hits: AtomicU64,
    transcoded: AtomicU64,
    unchanged: AtomicU64,
    uploaded: AtomicU64,
    replaced: AtomicU64,
    retiered: AtomicU64,
    failed: AtomicU64,
    orphans_deleted: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SyncStats {
    fn report(&self, dry_run: bool) -> SyncReport {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SyncReport {
            archives: get(&self.archives),
            archives_failed: get(&self.archives_failed),
            entries: get(&self.entries),
            skipped: get(&self.skipped),
            cache_hits: get(&self.cache_hits),
            transcoded: get(&self.transcoded),
            unchanged: get(&self.unchanged),
            uploaded: get(&self.uploaded),
            replaced: get(&self.replaced),
            retiered: get(&self.retiered),
            failed: get(&self.failed),
            orphans_deleted: get(&self.orphans_deleted),
            dry_run,
        }
    }
}

/// Split a name into stem and extension (dot included) within its last path segment.
fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => name.split_at(file_start + dot),
        _ => (name, ""),
    }
}

fn target_key(prefix: &str, name: &str, extension: &str) -> String {
    let (stem, _) = split_extension(name);
    format!("{prefix}{stem}.{extension}")
}

fn alt_key(key: &str) -> String {
    let (stem, ext) = split_extension(key);
    format!("{stem}_Alt{ext}")
}

struct EntryJob {
    archive: String,
    entry: String,
    key: String,
    image: EntryImage,
    remote: Option<RemoteObject>,
    /// Set when the archive's cache records changed.
    dirty: Arc<AtomicBool>,
    stats: Arc<SyncStats>,
}

struct Shared {
    archives: Arc<dyn ArchiveSource>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<SizeCache>,
    remapper: Arc<dyn FilenameRemapper>,
    options: SyncOptions,
    compression: TaskQueue,
    uploads: TaskQueue,
}

pub struct SyncPipeline {
    shared: Arc<Shared>,
}

impl SyncPipeline {
    pub fn new(
        archives: Arc<dyn ArchiveSource>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<SizeCache>,
        remapper: Arc<dyn FilenameRemapper>,
        options: SyncOptions,
    ) -> Self {
        let compression = TaskQueue::new("compression", options.compression_slots.max(1));
        let uploads = TaskQueue::new("upload", options.upload_budget_bytes.max(1));
        Self {
            shared: Arc::new(Shared {
                archives,
                transcoder,
                store,
                cache,
                remapper,
                options,
                compression,
                uploads,
            }),
        }
    }

    /// Build a pipeline with the configured size cache and remap rules.
    pub async fn from_config(
        config: &SyncConfig,
        archives: Arc<dyn ArchiveSource>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let cache = SizeCache::open(&config.cache_file).await?;
        let remapper = RuleRemapper::from_rules(&config.remap)?;
        Ok(Self::new(
            archives,
            transcoder,
            store,
            Arc::new(cache),
            Arc::new(remapper),
            SyncOptions::from(config),
        ))
    }

    pub fn options(&self) -> &SyncOptions {
        &self.shared.options
    }

    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let shared = &self.shared;
        let started = Instant::now();
        let stats = Arc::new(SyncStats::default());

        if !shared.cache.is_empty().await {
            shared.cache.compact().await?;
        }

        let remote: HashMap<String, RemoteObject> = shared
            .store
            .list(&shared.options.prefix)
            .await?
            .into_iter()
            .filter(|o| o.size > 0)
            .map(|o| (o.key.clone(), o))
            .collect();
        tracing::info!(prefix = %shared.options.prefix, objects = remote.len(), "Listed remote objects");

        // Target key → "archive:entry" that claimed it.
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut archive_failed = false;

        for name in shared.archives.list().await? {
            match self.sync_archive(&name, &remote, &mut claimed, &stats).await {
                Ok(()) => bump(&stats.archives),
                Err(e @ SyncError::DuplicateTarget { .. }) => return Err(e),
                Err(e) => {
                    tracing::error!(archive = %name, error = %e, "Archive failed");
                    bump(&stats.archives_failed);
                    archive_failed = true;
                }
            }
        }
        self.drain().await;

        if !shared.options.delete_orphans {
            tracing::info!("Orphan deletion disabled");
        } else if archive_failed {
            tracing::warn!("Skipping orphan deletion: not every archive was read");
        } else {
            self.delete_orphans(&remote, &claimed, &stats).await;
        }

        let report = stats.report(shared.options.dry_run);
        tracing::info!(elapsed = ?started.elapsed(), ?report, "Sync finished");
        Ok(report)
    }

    async fn sync_archive(
        &self,
        name: &str,
        remote: &HashMap<String, RemoteObject>,
        claimed: &mut HashMap<String, String>,
        stats: &Arc<SyncStats>,
    ) -> Result<(), SyncError> {
        let shared = &self.shared;
        tracing::info!(archive = name, "Processing archive");

        let reader = shared.archives.open(name).await?;
        let entries = reader.entries().await?;
        let dirty = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut outcome = Ok(());

        for entry in entries.into_iter().filter(|e| e.is_file) {
            bump(&stats.entries);
            let Some(mapped) = shared.remapper.remap(&entry.name) else {
                tracing::debug!(archive = name, entry = %entry.name, "Skipping entry");
                bump(&stats.skipped);
                continue;
            };
            let key = match shared.claim(&mapped, name, &entry.name, claimed) {
                Ok(key) => key,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            let job = EntryJob {
                archive: name.to_string(),
                entry: entry.name.clone(),
                remote: remote.get(&key).cloned(),
                key,
                image: EntryImage::new(
                    Arc::clone(&reader),
                    entry.name,
                    Arc::clone(&shared.transcoder),
                    shared.options.transcode,
                ),
                dirty: Arc::clone(&dirty),
                stats: Arc::clone(stats),
            };
            let task = Arc::clone(shared);
            let handle = shared
                .compression
                .submit(async move {
                    let archive = job.archive.clone();
                    let entry = job.entry.clone();
                    let stats = Arc::clone(&job.stats);
                    if let Err(e) = task.process(job).await {
                        tracing::error!(archive = %archive, entry = %entry, error = %e, "Entry failed");
                        bump(&stats.failed);
                    }
                })
                .await?;
            handles.push(handle);
        }

        self.drain().await;
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(archive = name, error = %e, "Entry task panicked");
                bump(&stats.failed);
            }
        }

        if dirty.load(Ordering::Relaxed) {
            shared.cache.compact().await?;
        }
        outcome
    }

    /// Wait until both queues are quiescent.
    async fn drain(&self) {
        // Compression first: its tasks are what submit uploads.
        for queue in [&self.shared.compression, &self.shared.uploads] {
            tracing::debug!(queue = queue.name(), "Waiting for queue to empty");
            queue.wait_for_empty().await;
        }
    }

    async fn delete_orphans(
        &self,
        remote: &HashMap<String, RemoteObject>,
        claimed: &HashMap<String, String>,
        stats: &SyncStats,
    ) {
        let shared = &self.shared;
        let mut orphans: Vec<&String> = remote.keys().filter(|k| !claimed.contains_key(*k)).collect();
        orphans.sort();

        for key in orphans {
            tracing::info!(key = %key, "Deleting orphaned object");
            match shared.delete(key).await {
                Ok(()) => bump(&stats.orphans_deleted),
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to delete orphaned object");
                    bump(&stats.failed);
                }
            }
        }
    }
}

impl Shared {
    /// Derive and record the target key for an entry, falling back to `_Alt`.
    fn claim(
        &self,
        mapped: &str,
        archive: &str,
        entry: &str,
        claimed: &mut HashMap<String, String>,
    ) -> Result<String, SyncError> {
        let owner = format!("{archive}:{entry}");
        let mut key = target_key(&self.options.prefix, mapped, self.transcoder.extension());

        if let Some(first) = claimed.get(&key) {
            let alt = alt_key(&key);
            if let Some(claimed_by) = claimed.get(&alt) {
                return Err(SyncError::DuplicateTarget {
                    key: alt,
                    claimed_by: claimed_by.clone(),
                    entry: owner,
                });
            }
            tracing::warn!(key = %key, first = %first, entry = %owner, alt = %alt, "Target collision, using alternate key");
            key = alt;
        }

        claimed.insert(key.clone(), owner);
        Ok(key)
    }

    async fn process(self: Arc<Self>, job: EntryJob) -> Result<(), SyncError> {
        let stats = Arc::clone(&job.stats);
        let cache_key = SizeCache::key(&job.archive, &job.entry);
        let mut size = self.encoded_size(&cache_key, &job.image, &job.dirty, &stats).await?;
        let mut tier = self.options.tiers.select(size);

        let remote = match job.remote {
            Some(existing) if existing.size != size => {
                tracing::info!(
                    key = %job.key,
                    local = size,
                    remote = existing.size,
                    "Remote object differs, replacing"
                );
                self.cache.remove(&cache_key).await?;
                size = self.encoded_size(&cache_key, &job.image, &job.dirty, &stats).await?;
                tier = self.options.tiers.select(size);
                self.delete(&job.key).await?;
                bump(&stats.replaced);
                None
            }
            other => other,
        };

        if let Some(existing) = remote {
            if existing.is_stored_as(tier) {
                bump(&stats.unchanged);
            } else {
                tracing::info!(
                    key = %job.key,
                    size,
                    from = existing.storage_class.as_deref().unwrap_or(StorageTier::Standard.as_str()),
                    to = %tier,
                    "Changing storage class"
                );
                self.copy(&job.key, tier).await?;
                bump(&stats.retiered);
            }
            return Ok(());
        }

        tracing::debug!(key = %job.key, size, %tier, "Queueing upload");
        let key = job.key;
        let image = job.image;
        let task = Arc::clone(&self);
        self.uploads
            .submit_weighted(size, async move {
                if let Err(e) = task.upload(&key, image, tier, &stats).await {
                    tracing::error!(key = %key, error = %e, "Upload failed");
                    bump(&stats.failed);
                }
            })
            .await?;
        Ok(())
    }

    async fn encoded_size(
        &self,
        cache_key: &str,
        image: &EntryImage,
        dirty: &AtomicBool,
        stats: &SyncStats,
    ) -> Result<u64, SyncError> {
        if let Some(size) = self.cache.get(cache_key).await.filter(|&s| s > 0) {
            bump(&stats.cache_hits);
            return Ok(size);
        }

        let fresh = !image.is_encoded();
        let size = image.encoded_size().await?;
        if fresh {
            bump(&stats.transcoded);
        }
        self.cache.set(cache_key, size).await?;
        dirty.store(true, Ordering::Relaxed);
        Ok(size)
    }

    async fn upload(
        &self,
        key: &str,
        image: EntryImage,
        tier: StorageTier,
        stats: &SyncStats,
    ) -> Result<(), SyncError> {
        if self.options.dry_run {
            tracing::info!(key, %tier, "Dry run: would upload");
            bump(&stats.uploaded);
            return Ok(());
        }

        let encoded = image.encoded().await?;
        drop(image);
        let size = encoded.size;
        self.store
            .put(
                key,
                Arc::unwrap_or_clone(encoded.data),
                tier,
                self.transcoder.content_type(),
            )
            .await?;
        tracing::info!(key, size, %tier, "Uploaded");
        bump(&stats.uploaded);
        Ok(())
    }

    async fn copy(&self, key: &str, tier: StorageTier) -> Result<(), StoreError> {
        if self.options.dry_run {
            tracing::info!(key, %tier, "Dry run: would change storage class");
            return Ok(());
        }
        self.store.copy(key, key, tier).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.options.dry_run {
            tracing::info!(key, "Dry run: would delete");
            return Ok(());
        }
        self.store.delete(key).await
    }
}
