//! Sentence-level text segmentation for the playback pipeline.
//!
//! Pure functions, no I/O. Splitting runs left-to-right over code points:
//! sentence-ending punctuation (kept) or a newline (discarded) closes a
//! segment, and a segment is force-closed at `max_len` code points when no
//! boundary was seen. Whitespace is normalized per segment afterwards.

use regex::Regex;
use std::sync::LazyLock;

/// Characters that end a segment and are kept as part of it.
const BOUNDARY_CHARS: &[char] = &['。', '！', '？', '.', '!', '?'];

/// Default maximum segment length in code points.
pub const DEFAULT_MAX_SEGMENT_LEN: usize = 100;

/// Minimal utterance emitted when the input collapses to nothing.
const EMPTY_FALLBACK: &str = "。";

static RE_MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// One sentence-level chunk of the original text, annotated during the
/// pipeline with its synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub text: String,
    /// Cumulative length (code points) of the segment texts emitted before
    /// this one, not an offset into the original input.
    pub position: usize,
    /// Length of `text` in code points.
    pub length: usize,
    pub speaker_id: u32,
    pub audio_data: Option<Vec<u8>>,
    pub is_cached: bool,
}

impl TextSegment {
    /// Attach synthesized audio and mark the segment ready.
    ///
    /// `is_cached` implies non-empty `audio_data`; empty buffers are
    /// rejected by debug assertion.
    pub fn attach_audio(&mut self, audio: Vec<u8>) {
        debug_assert!(!audio.is_empty(), "segment audio must be non-empty");
        self.audio_data = Some(audio);
        self.is_cached = true;
    }
}

/// Split `text` into ordered segments for `speaker_id`.
///
/// Empty or whitespace-only input yields a single minimal utterance so
/// downstream stages always have work.
pub fn segment_text(text: &str, speaker_id: u32, max_len: usize) -> Vec<TextSegment> {
    fn flush(buf: &mut String, buf_chars: &mut usize, chunks: &mut Vec<String>) {
        if !buf.is_empty() {
            chunks.push(std::mem::take(buf));
        }
        *buf_chars = 0;
    }

    let max_len = max_len.max(1);
    let mut raw_chunks: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for ch in text.chars() {
        if ch == '\n' || ch == '\r' {
            flush(&mut buf, &mut buf_chars, &mut raw_chunks);
            continue;
        }
        buf.push(ch);
        buf_chars += 1;
        if BOUNDARY_CHARS.contains(&ch) || buf_chars >= max_len {
            flush(&mut buf, &mut buf_chars, &mut raw_chunks);
        }
    }
    flush(&mut buf, &mut buf_chars, &mut raw_chunks);

    let mut segments = Vec::new();
    let mut position = 0usize;
    for chunk in raw_chunks {
        let normalized = normalize_whitespace(&chunk);
        if normalized.is_empty() {
            continue;
        }
        let length = normalized.chars().count();
        segments.push(TextSegment {
            text: normalized,
            position,
            length,
            speaker_id,
            audio_data: None,
            is_cached: false,
        });
        position += length;
    }

    if segments.is_empty() {
        segments.push(TextSegment {
            text: EMPTY_FALLBACK.to_string(),
            position: 0,
            length: EMPTY_FALLBACK.chars().count(),
            speaker_id,
            audio_data: None,
            is_cached: false,
        });
    }

    segments
}

/// Trim and collapse interior whitespace runs to a single space.
fn normalize_whitespace(text: &str) -> String {
    RE_MULTI_SPACE.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(segments: &[TextSegment]) -> Vec<&str> {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn splits_on_japanese_sentence_boundaries() {
        let segs = segment_text("こんにちは。さようなら。", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["こんにちは。", "さようなら。"]);
    }

    #[test]
    fn splits_on_ascii_boundaries() {
        let segs = segment_text("Hello. How are you? Fine!", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["Hello.", "How are you?", "Fine!"]);
    }

    #[test]
    fn boundary_char_is_kept() {
        let segs = segment_text("質問ですか？はい！", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["質問ですか？", "はい！"]);
    }

    #[test]
    fn newline_terminates_and_is_discarded() {
        let segs = segment_text("一行目\n二行目\r\n三行目", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["一行目", "二行目", "三行目"]);
    }

    #[test]
    fn forced_split_at_max_length() {
        let text = "あ".repeat(25);
        let segs = segment_text(&text, 1, 10);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].length, 10);
        assert_eq!(segs[1].length, 10);
        assert_eq!(segs[2].length, 5);
    }

    #[test]
    fn interior_whitespace_collapses() {
        let segs = segment_text("  hello   world.  ", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["hello world."]);
    }

    #[test]
    fn empty_input_yields_minimal_utterance() {
        let segs = segment_text("", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["。"]);
        assert_eq!(segs[0].position, 0);
    }

    #[test]
    fn whitespace_only_input_yields_minimal_utterance() {
        let segs = segment_text("  \n\t  ", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&segs), vec!["。"]);
    }

    #[test]
    fn positions_are_cumulative_emitted_lengths() {
        let segs = segment_text("こんにちは。さようなら。", 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(segs[0].position, 0);
        assert_eq!(segs[1].position, segs[0].length);
        for pair in segs.windows(2) {
            assert!(pair[1].position > pair[0].position);
        }
    }

    #[test]
    fn segmentation_is_deterministic() {
        let a = segment_text("一つ目。二つ目。三つ目。", 3, 50);
        let b = segment_text("一つ目。二つ目。三つ目。", 3, 50);
        assert_eq!(a, b);
    }

    #[test]
    fn resegmenting_joined_output_is_stable() {
        let first = segment_text("こんにちは。元気ですか？はい、元気です。", 1, DEFAULT_MAX_SEGMENT_LEN);
        let joined: String = first.iter().map(|s| s.text.as_str()).collect();
        let second = segment_text(&joined, 1, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(texts(&first), texts(&second));
    }

    #[test]
    fn speaker_id_propagates() {
        let segs = segment_text("テスト。", 7, DEFAULT_MAX_SEGMENT_LEN);
        assert!(segs.iter().all(|s| s.speaker_id == 7));
    }

    #[test]
    fn attach_audio_marks_cached() {
        let mut seg = segment_text("テスト。", 1, DEFAULT_MAX_SEGMENT_LEN).remove(0);
        assert!(!seg.is_cached);
        seg.attach_audio(vec![1, 2, 3]);
        assert!(seg.is_cached);
        assert_eq!(seg.audio_data.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
