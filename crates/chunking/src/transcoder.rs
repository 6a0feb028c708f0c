//! Subprocess transcoder seam
//!
//! The chunking engine drives an external transcoder through this trait.
//! The production implementation shells out to `ffprobe`/`ffmpeg`; tests
//! substitute an in-memory fake.

use media_ingest_common::{ProcessingError, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

/// Probe result for a media file
#[derive(Debug, Clone)]
pub struct MediaProbe {
    /// Container duration in seconds
    pub duration_sec: f64,
    /// Overall bit rate in bits per second, when the container reports one
    pub bit_rate: Option<u64>,
    /// Container format name
    pub format: String,
}

/// External transcoder interface
#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    /// Probe duration, bit rate and format of a media file
    async fn probe(&self, input: &Path) -> Result<MediaProbe>;

    /// Extract the `[start_sec, start_sec + duration_sec)` window of the
    /// input into a standalone playable file at `output`
    async fn extract_segment(
        &self,
        input: &Path,
        output: &Path,
        start_sec: f64,
        duration_sec: f64,
    ) -> Result<()>;
}

/// FFmpeg CLI transcoder
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            ffmpeg_bin: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_bin: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl FfmpegTranscoder {
    fn spawn_error(bin: &str, err: &std::io::Error) -> ProcessingError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProcessingError::TranscoderError(format!(
                "{bin} binary not found; install it or set FFMPEG_PATH/FFPROBE_PATH"
            ))
        } else {
            ProcessingError::TranscoderError(format!("Failed to execute {bin}: {err}"))
        }
    }
}

#[async_trait::async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, input: &Path) -> Result<MediaProbe> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=format_name,duration,bit_rate")
            .arg("-of")
            .arg("json")
            .arg(input)
            .output()
            .await
            .map_err(|e| Self::spawn_error(&self.ffprobe_bin, &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessingError::TranscoderError(format!(
                "ffprobe failed for {}: {stderr}",
                input.display()
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            ProcessingError::TranscoderError(format!("Unparseable ffprobe output: {e}"))
        })?;

        let duration_sec = parsed
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| {
                ProcessingError::TranscoderError(format!(
                    "ffprobe reported no duration for {}",
                    input.display()
                ))
            })?;

        let bit_rate = parsed
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok());

        Ok(MediaProbe {
            duration_sec,
            bit_rate,
            format: parsed.format.format_name.unwrap_or_default(),
        })
    }

    async fn extract_segment(
        &self,
        input: &Path,
        output: &Path,
        start_sec: f64,
        duration_sec: f64,
    ) -> Result<()> {
        let result = Command::new(&self.ffmpeg_bin)
            .arg("-y")
            .arg("-ss")
            .arg(format!("{start_sec:.3}"))
            .arg("-i")
            .arg(input)
            .arg("-t")
            .arg(format!("{duration_sec:.3}"))
            .arg("-c")
            .arg("copy")
            .arg(output)
            .output()
            .await
            .map_err(|e| Self::spawn_error(&self.ffmpeg_bin, &e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ProcessingError::TranscoderError(format!(
                "ffmpeg segment extraction failed: {stderr}"
            )));
        }

        if !output.exists() {
            return Err(ProcessingError::TranscoderError(
                "ffmpeg reported success but produced no output file".to_string(),
            ));
        }

        Ok(())
    }
}
