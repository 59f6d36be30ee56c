//! tiersync: archive to object-store synchroniser with weighted admission control.

pub mod archive;
pub mod cache;
pub mod config;
pub mod gate;
pub mod pipeline;
pub mod remap;
pub mod store;
pub mod transcode;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveReader, ArchiveSource, MemoryArchives, ZipDirectory};
pub use cache::{CacheError, SizeCache};
pub use config::{ConfigError, SyncConfig};
pub use gate::{AdmissionError, AdmissionQueue, Lease, TaskQueue};
pub use pipeline::{SyncError, SyncOptions, SyncPipeline, SyncReport};
pub use remap::{FilenameRemapper, RemapError, RemapRules, RuleRemapper};
pub use store::{
    MemoryStore, ObjectStore, RemoteObject, S3Config, S3Store, StorageTier, StoreError, TierPolicy,
};
pub use transcode::{AvifTranscoder, EntryImage, TranscodeError, TranscodeParams, Transcoded, Transcoder};
