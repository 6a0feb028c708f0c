//! Transcript text chunking
//!
//! Groups transcript segments into embedding-sized chunks by character
//! budget. Chunk ids are derived from the member segment ids, so chunking
//! the same transcript twice yields the same ids and downstream vector
//! upserts stay idempotent.

use media_ingest_common::Transcript;
use sha2::{Digest, Sha256};

/// One chunk of transcript text ready for embedding
#[derive(Debug, Clone)]
pub struct TextChunk {
    /// Deterministic id derived from the member segment ids
    pub id: String,
    /// Concatenated segment text
    pub text: String,
    /// Ids of the segments that make up this chunk, in order
    pub segment_ids: Vec<String>,
    /// Start of the earliest member segment
    pub start_time_sec: f64,
    /// End of the latest member segment
    pub end_time_sec: f64,
}

fn chunk_id(segment_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in segment_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Group transcript segments into chunks of at most `char_budget`
/// characters of text.
///
/// A chunk closes when appending the next segment would exceed the budget;
/// the trailing partial chunk is always flushed. A single segment longer
/// than the budget becomes a chunk of its own rather than being split.
#[must_use]
pub fn chunk_transcript(transcript: &Transcript, char_budget: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut text = String::new();
    let mut segment_ids: Vec<String> = Vec::new();
    let mut span = (0.0_f64, 0.0_f64);

    for segment in &transcript.segments {
        let segment_text = segment.text.trim();
        if segment_text.is_empty() {
            continue;
        }

        let added = segment_text.chars().count() + usize::from(!text.is_empty());
        if !text.is_empty() && text.chars().count() + added > char_budget {
            chunks.push(TextChunk {
                id: chunk_id(&segment_ids),
                text: std::mem::take(&mut text),
                segment_ids: std::mem::take(&mut segment_ids),
                start_time_sec: span.0,
                end_time_sec: span.1,
            });
        }

        if text.is_empty() {
            span.0 = segment.start_time_sec;
        } else {
            text.push(' ');
        }
        text.push_str(segment_text);
        segment_ids.push(segment.id.clone());
        span.1 = segment.end_time_sec;
    }

    if !text.is_empty() {
        chunks.push(TextChunk {
            id: chunk_id(&segment_ids),
            text,
            segment_ids,
            start_time_sec: span.0,
            end_time_sec: span.1,
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_ingest_common::TranscriptSegment;

    fn segment(id: &str, text: &str, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            id: id.to_string(),
            speaker_id: None,
            text: text.to_string(),
            start_time_sec: start,
            end_time_sec: end,
        }
    }

    fn transcript(segments: Vec<TranscriptSegment>) -> Transcript {
        Transcript {
            segments,
            language: None,
            speakers: vec![],
        }
    }

    #[test]
    fn test_empty_transcript_yields_no_chunks() {
        assert!(chunk_transcript(&transcript(vec![]), 100).is_empty());
    }

    #[test]
    fn test_segments_grouped_under_budget() {
        let t = transcript(vec![
            segment("s0", "aaaa", 0.0, 1.0),
            segment("s1", "bbbb", 1.0, 2.0),
            segment("s2", "cccc", 2.0, 3.0),
        ]);

        // 4 + 1 + 4 = 9 fits; adding the third (14) does not
        let chunks = chunk_transcript(&t, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaa bbbb");
        assert_eq!(chunks[0].segment_ids, vec!["s0", "s1"]);
        assert_eq!(chunks[0].start_time_sec, 0.0);
        assert_eq!(chunks[0].end_time_sec, 2.0);
        assert_eq!(chunks[1].text, "cccc");
        assert_eq!(chunks[1].start_time_sec, 2.0);
    }

    #[test]
    fn test_oversized_segment_gets_own_chunk() {
        let t = transcript(vec![
            segment("s0", "short", 0.0, 1.0),
            segment("s1", "this segment alone exceeds the budget", 1.0, 5.0),
            segment("s2", "tail", 5.0, 6.0),
        ]);

        let chunks = chunk_transcript(&t, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].segment_ids, vec!["s1"]);
    }

    #[test]
    fn test_chunk_ids_deterministic() {
        let t = transcript(vec![
            segment("s0", "hello", 0.0, 1.0),
            segment("s1", "world", 1.0, 2.0),
        ]);

        let first = chunk_transcript(&t, 100);
        let second = chunk_transcript(&t, 100);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_different_membership_different_ids() {
        let t = transcript(vec![
            segment("s0", "hello", 0.0, 1.0),
            segment("s1", "world", 1.0, 2.0),
        ]);

        let joined = chunk_transcript(&t, 100);
        let split = chunk_transcript(&t, 5);
        assert_eq!(joined.len(), 1);
        assert_eq!(split.len(), 2);
        assert_ne!(joined[0].id, split[0].id);
    }

    #[test]
    fn test_blank_segments_skipped() {
        let t = transcript(vec![
            segment("s0", "  ", 0.0, 1.0),
            segment("s1", "kept", 1.0, 2.0),
        ]);

        let chunks = chunk_transcript(&t, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "kept");
        assert_eq!(chunks[0].segment_ids, vec!["s1"]);
        assert_eq!(chunks[0].start_time_sec, 1.0);
    }
}
