//! Voice request model and deterministic cache key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default playback speed scale.
pub const DEFAULT_SPEED: f64 = 1.0;
/// Default pitch offset.
pub const DEFAULT_PITCH: f64 = 0.0;
/// Default volume scale.
pub const DEFAULT_VOLUME: f64 = 1.0;

/// A single synthesis request: text plus voice parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceRequest {
    pub text: String,
    pub speaker_id: u32,
    pub speed: f64,
    pub pitch: f64,
    pub volume: f64,
}

impl VoiceRequest {
    /// A request with default prosody.
    pub fn new(text: impl Into<String>, speaker_id: u32) -> Self {
        Self {
            text: text.into(),
            speaker_id,
            speed: DEFAULT_SPEED,
            pitch: DEFAULT_PITCH,
            volume: DEFAULT_VOLUME,
        }
    }

    pub fn with_prosody(mut self, speed: f64, pitch: f64, volume: f64) -> Self {
        self.speed = speed;
        self.pitch = pitch;
        self.volume = volume;
        self
    }

    /// Deterministic cache key for this request.
    ///
    /// SHA-256 over the canonical string
    /// `"{text}|{speaker_id}|{speed:.2}|{pitch:.2}|{volume:.2}"`, lowercase
    /// hex. Prosody values are rounded to two decimals, so differences
    /// below the 0.01 boundary map to the same key.
    pub fn cache_key(&self) -> String {
        let canonical = format!(
            "{}|{}|{:.2}|{:.2}|{:.2}",
            self.text, self.speaker_id, self.speed, self.pitch, self.volume
        );
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_64_hex_chars() {
        let req = VoiceRequest::new("こんにちは。", 1);
        let k1 = req.cache_key();
        let k2 = req.cache_key();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_differs_for_different_text() {
        let a = VoiceRequest::new("hello", 1).cache_key();
        let b = VoiceRequest::new("world", 1).cache_key();
        assert_ne!(a, b);
    }

    #[test]
    fn key_differs_for_different_speaker() {
        let a = VoiceRequest::new("hello", 1).cache_key();
        let b = VoiceRequest::new("hello", 2).cache_key();
        assert_ne!(a, b);
    }

    #[test]
    fn prosody_below_rounding_boundary_shares_key() {
        let a = VoiceRequest::new("hello", 1)
            .with_prosody(1.0, 0.0, 1.0)
            .cache_key();
        let b = VoiceRequest::new("hello", 1)
            .with_prosody(1.002, 0.003, 0.998)
            .cache_key();
        assert_eq!(a, b);
    }

    #[test]
    fn prosody_beyond_rounding_boundary_changes_key() {
        let base = VoiceRequest::new("hello", 1).cache_key();
        let speed = VoiceRequest::new("hello", 1)
            .with_prosody(1.05, 0.0, 1.0)
            .cache_key();
        let pitch = VoiceRequest::new("hello", 1)
            .with_prosody(1.0, 0.05, 1.0)
            .cache_key();
        let volume = VoiceRequest::new("hello", 1)
            .with_prosody(1.0, 0.0, 0.95)
            .cache_key();
        assert_ne!(base, speed);
        assert_ne!(base, pitch);
        assert_ne!(base, volume);
    }
}
