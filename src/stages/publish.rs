use crate::error::AppError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{PublishedAudio, Publisher};

/// Concatenates MP3 segments into `<publish_dir>/<episode_id>.mp3` and
/// serves them under `public_base_url`.
pub struct FilePublisher {
    publish_dir: PathBuf,
    public_base_url: String,
    bitrate_kbps: u32,
}

impl FilePublisher {
    pub fn new(publish_dir: impl Into<PathBuf>, public_base_url: &str, bitrate_kbps: u32) -> Self {
        Self {
            publish_dir: publish_dir.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            bitrate_kbps,
        }
    }

    pub fn publish_dir(&self) -> &Path {
        &self.publish_dir
    }

    /// Constant-bitrate estimate.
    fn estimate_duration(&self, size_bytes: u64) -> f64 {
        if self.bitrate_kbps == 0 {
            return 0.0;
        }
        (size_bytes as f64 * 8.0) / (self.bitrate_kbps as f64 * 1000.0)
    }
}

/// Append every segment to `out`, returning the bytes written.
async fn concatenate(out: &Path, segment_paths: &[PathBuf]) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(out).await?;
    let mut size_bytes = 0u64;
    for path in segment_paths {
        let audio = tokio::fs::read(path).await.map_err(|e| {
            AppError::stage("publish", format!("cannot read segment {:?}: {}", path, e))
        })?;
        file.write_all(&audio).await?;
        size_bytes += audio.len() as u64;
    }
    file.flush().await?;
    Ok(size_bytes)
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(
        &self,
        episode_id: &str,
        segment_paths: &[PathBuf],
    ) -> Result<PublishedAudio, AppError> {
        if segment_paths.is_empty() {
            return Err(AppError::stage("publish", "no segments to publish"));
        }
        tokio::fs::create_dir_all(&self.publish_dir).await?;

        let file_name = format!("{}.mp3", episode_id);
        let target = self.publish_dir.join(&file_name);
        let partial = self.publish_dir.join(format!("{}.partial", file_name));

        let size_bytes = match concatenate(&partial, segment_paths).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove {:?}: {}", partial, remove_err);
                    }
                }
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &target).await?;

        let published = PublishedAudio {
            audio_ref: format!("{}/{}", self.public_base_url, file_name),
            duration_seconds: self.estimate_duration(size_bytes),
            size_bytes: size_bytes as i64,
        };
        log::info!(
            "Published {} ({} bytes, ~{:.0}s)",
            published.audio_ref,
            published.size_bytes,
            published.duration_seconds
        );
        Ok(published)
    }
}
