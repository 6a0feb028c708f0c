//! Size-bounded media chunking
//!
//! Splits a large media file into an ordered sequence of time-stamped parts
//! whose byte size stays under a hard downstream ceiling. Extraction runs
//! through an external transcoder; every produced part is verified against
//! the ceiling and re-extracted once at a reduced duration before the
//! engine fails loudly.

pub mod transcoder;

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use media_ingest_common::{ProcessingError, Result};
pub use transcoder::{FfmpegTranscoder, MediaProbe, Transcoder};

/// Encoder rounding tolerance in seconds when comparing time spans
pub const ROUNDING_TOLERANCE_SEC: f64 = 0.05;

/// One bounded-size, time-ranged slice of a larger media file
#[derive(Debug, Clone)]
pub struct MediaPart {
    /// Zero-based position in playback order
    pub part_index: u32,
    /// Local path of the extracted part
    pub path: PathBuf,
    /// Verified size of the part on disk
    pub byte_size: u64,
    /// Start of the covered time span in seconds
    pub start_time_sec: f64,
    /// End of the covered time span in seconds
    pub end_time_sec: f64,
}

/// Chunking engine configuration
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Hard byte ceiling per produced part
    pub target_part_bytes: u64,

    /// Proactive threshold: sources above this size get chunked up front.
    /// Independent of the ceiling so the system can chunk conservatively
    /// and still re-chunk reactively against a stricter downstream limit.
    pub proactive_threshold_bytes: u64,

    /// Fixed wall-clock window per part, preferred when set. When absent
    /// the window is estimated from the encoded bit rate.
    pub fixed_window_sec: Option<f64>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            // 24 MiB ceiling, chunk proactively from 20 MiB
            target_part_bytes: 24 * 1024 * 1024,
            proactive_threshold_bytes: 20 * 1024 * 1024,
            fixed_window_sec: None,
        }
    }
}

/// Pure predicate: does a source of `size` bytes need chunking at all?
#[must_use]
pub fn should_chunk(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Size-bounded chunking engine over an external transcoder
pub struct ChunkingEngine<T: Transcoder> {
    transcoder: T,
    config: ChunkingConfig,
}

impl<T: Transcoder> ChunkingEngine<T> {
    #[must_use]
    pub fn new(transcoder: T, config: ChunkingConfig) -> Self {
        Self { transcoder, config }
    }

    #[must_use]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Pick the extraction window for one part.
    ///
    /// Prefers the configured fixed window; otherwise derives the window
    /// from the target byte size and the encoded bit rate (falling back to
    /// the effective bit rate computed from file size and duration).
    fn plan_window_sec(&self, probe: &MediaProbe, total_bytes: u64) -> Result<f64> {
        if let Some(fixed) = self.config.fixed_window_sec {
            return Ok(fixed);
        }

        let bit_rate = match probe.bit_rate {
            Some(rate) if rate > 0 => rate,
            _ => {
                if probe.duration_sec <= 0.0 {
                    return Err(ProcessingError::TranscoderError(
                        "Cannot estimate part window: no bit rate and zero duration".to_string(),
                    ));
                }
                ((total_bytes as f64 * 8.0) / probe.duration_sec) as u64
            }
        };

        if bit_rate == 0 {
            return Err(ProcessingError::TranscoderError(
                "Cannot estimate part window: zero bit rate".to_string(),
            ));
        }

        Ok((self.config.target_part_bytes as f64 * 8.0) / bit_rate as f64)
    }

    /// Split `input` into ordered, contiguous, size-bounded parts.
    ///
    /// Part time spans partition `[0, total_duration]` with no gaps or
    /// overlaps; the last part ends at total duration within
    /// [`ROUNDING_TOLERANCE_SEC`]. A part that exceeds the ceiling is
    /// re-extracted once at ~95% of its size-implied duration; a second
    /// violation means the bit rate assumption is broken and the whole
    /// chunk operation fails.
    pub async fn chunk_media(&self, input: &Path, out_dir: &Path) -> Result<Vec<MediaPart>> {
        let probe = self.transcoder.probe(input).await?;
        let total_bytes = tokio::fs::metadata(input).await?.len();
        let total_duration = probe.duration_sec;
        let window = self.plan_window_sec(&probe, total_bytes)?;
        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();

        info!(
            input = %input.display(),
            total_bytes,
            total_duration,
            window_sec = window,
            "Chunking media into bounded parts"
        );

        let mut parts = Vec::new();
        let mut cursor = 0.0_f64;
        let mut index: u32 = 0;

        while cursor < total_duration - ROUNDING_TOLERANCE_SEC {
            let planned = window.min(total_duration - cursor);
            let path = out_dir.join(format!("part_{index:04}.{extension}"));

            self.transcoder
                .extract_segment(input, &path, cursor, planned)
                .await?;

            let mut byte_size = tokio::fs::metadata(&path).await?.len();
            let mut used = planned;

            if byte_size > self.config.target_part_bytes {
                // Re-extract this part alone at 95% of the duration the
                // observed size implies would fit the ceiling.
                let implied =
                    planned * (self.config.target_part_bytes as f64 / byte_size as f64);
                let reduced = implied * 0.95;
                warn!(
                    part_index = index,
                    byte_size,
                    ceiling = self.config.target_part_bytes,
                    reduced_sec = reduced,
                    "Part exceeded size ceiling; re-extracting at reduced duration"
                );

                self.transcoder
                    .extract_segment(input, &path, cursor, reduced)
                    .await?;

                byte_size = tokio::fs::metadata(&path).await?.len();
                if byte_size > self.config.target_part_bytes {
                    return Err(ProcessingError::PartTooLarge {
                        index,
                        size: byte_size,
                        max: self.config.target_part_bytes,
                    });
                }
                used = reduced;
            }

            let end = (cursor + used).min(total_duration);
            debug!(part_index = index, start = cursor, end, byte_size, "Extracted part");

            parts.push(MediaPart {
                part_index: index,
                path,
                byte_size,
                start_time_sec: cursor,
                end_time_sec: end,
            });

            cursor = end;
            index += 1;
        }

        if let Some(last) = parts.last_mut() {
            // Absorb encoder rounding on the final boundary
            if (total_duration - last.end_time_sec).abs() <= ROUNDING_TOLERANCE_SEC {
                last.end_time_sec = total_duration;
            }
        }

        info!(parts = parts.len(), "Chunking complete");
        Ok(parts)
    }
}
