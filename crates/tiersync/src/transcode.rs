//! Image recompression.
//!
//! `EntryImage` fetches an entry's bytes at most once and transcodes them at
//! most once, so the size check and the later upload share one encode.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::avif::AvifEncoder;
use image::{ColorType, DynamicImage};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::archive::{ArchiveError, ArchiveReader};

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Failed to decode source image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("Transcoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeParams {
    /// 1-100, higher is better.
    pub quality: u8,
    /// 0-9, higher is slower and smaller.
    pub effort: u8,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            quality: 80,
            effort: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoded {
    pub data: Arc<Vec<u8>>,
    pub size: u64,
}

impl Transcoded {
    pub fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            data: Arc::new(data),
            size,
        }
    }
}

/// Deterministic recompression: identical input and params give identical output.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        source: Arc<Vec<u8>>,
        params: TranscodeParams,
    ) -> Result<Transcoded, TranscodeError>;

    /// File extension of the output, without the dot.
    fn extension(&self) -> &str;

    fn content_type(&self) -> &str;
}

/// AVIF encoding through the `image` crate, on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct AvifTranscoder;

impl AvifTranscoder {
    /// Map effort (0 fastest .. 9 slowest) onto encoder speed (10 fastest .. 1 slowest).
    fn speed(effort: u8) -> u8 {
        10u8.saturating_sub(effort).clamp(1, 10)
    }

    fn encode(source: &[u8], params: TranscodeParams) -> Result<Vec<u8>, TranscodeError> {
        let img = image::load_from_memory(source).map_err(TranscodeError::Decode)?;
        let img = match img.color() {
            ColorType::Rgb8 | ColorType::Rgba8 => img,
            _ => DynamicImage::ImageRgba8(img.to_rgba8()),
        };

        let mut out = Cursor::new(Vec::new());
        let encoder = AvifEncoder::new_with_speed_quality(
            &mut out,
            Self::speed(params.effort),
            params.quality.clamp(1, 100),
        );
        img.write_with_encoder(encoder)
            .map_err(TranscodeError::Encode)?;
        Ok(out.into_inner())
    }
}

#[async_trait]
impl Transcoder for AvifTranscoder {
    async fn transcode(
        &self,
        source: Arc<Vec<u8>>,
        params: TranscodeParams,
    ) -> Result<Transcoded, TranscodeError> {
        let data = tokio::task::spawn_blocking(move || Self::encode(&source, params)).await??;
        Ok(Transcoded::new(data))
    }

    fn extension(&self) -> &str {
        "avif"
    }

    fn content_type(&self) -> &str {
        "image/avif"
    }
}

/// One archive entry with lazily loaded source bytes and transcoded output.
pub struct EntryImage {
    archive: Arc<dyn ArchiveReader>,
    entry: String,
    transcoder: Arc<dyn Transcoder>,
    params: TranscodeParams,
    source: OnceCell<Arc<Vec<u8>>>,
    encoded: OnceCell<Transcoded>,
}

impl EntryImage {
    pub fn new(
        archive: Arc<dyn ArchiveReader>,
        entry: impl Into<String>,
        transcoder: Arc<dyn Transcoder>,
        params: TranscodeParams,
    ) -> Self {
        Self {
            archive,
            entry: entry.into(),
            transcoder,
            params,
            source: OnceCell::new(),
            encoded: OnceCell::new(),
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub async fn source(&self) -> Result<Arc<Vec<u8>>, TranscodeError> {
        let source = self
            .source
            .get_or_try_init(|| async {
                let data = self.archive.read_entry(&self.entry).await?;
                Ok::<_, TranscodeError>(Arc::new(data))
            })
            .await?;
        Ok(Arc::clone(source))
    }

    pub async fn source_size(&self) -> Result<u64, TranscodeError> {
        Ok(self.source().await?.len() as u64)
    }

    pub async fn encoded(&self) -> Result<Transcoded, TranscodeError> {
        let encoded = self
            .encoded
            .get_or_try_init(|| async {
                let source = self.source().await?;
                let started = std::time::Instant::now();
                let encoded = self.transcoder.transcode(source, self.params).await?;
                tracing::debug!(
                    entry = %self.entry,
                    size = encoded.size,
                    elapsed = ?started.elapsed(),
                    "Transcoded entry"
                );
                Ok::<_, TranscodeError>(encoded)
            })
            .await?;
        Ok(encoded.clone())
    }

    pub async fn encoded_size(&self) -> Result<u64, TranscodeError> {
        Ok(self.encoded().await?.size)
    }

    pub fn is_encoded(&self) -> bool {
        self.encoded.initialized()
    }
}
