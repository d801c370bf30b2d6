//! On-disk cache entry metadata.
//!
//! Persisted next to each audio file as `<key>.meta.json`. Field names are
//! PascalCase on disk; lower-case spellings from older writers are accepted
//! on read.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::request::VoiceRequest;

/// Metadata stored alongside a cached audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(rename = "CreatedAt", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "Text", alias = "text")]
    pub text: String,
    #[serde(rename = "SpeakerId", alias = "speaker_id")]
    pub speaker_id: u32,
    #[serde(rename = "Speed", alias = "speed")]
    pub speed: f64,
    #[serde(rename = "Pitch", alias = "pitch")]
    pub pitch: f64,
    #[serde(rename = "Volume", alias = "volume")]
    pub volume: f64,
}

impl CacheMetadata {
    /// Metadata for a freshly synthesized request.
    pub fn for_request(request: &VoiceRequest) -> Self {
        Self {
            created_at: Utc::now(),
            text: request.text.clone(),
            speaker_id: request.speaker_id,
            speed: request.speed,
            pitch: request.pitch,
            volume: request.volume,
        }
    }

    /// Validity predicate: non-empty text, positive speaker, and a real
    /// creation timestamp.
    pub fn is_valid(&self) -> bool {
        !self.text.is_empty() && self.speaker_id > 0 && self.created_at.timestamp() > 0
    }

    /// TTL check with an exclusive boundary: an entry exactly `ttl` old is
    /// not yet expired.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > ttl
    }
}
