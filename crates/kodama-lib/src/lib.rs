//! kodama: a caching front-end for a local VOICEVOX-style HTTP TTS engine.
//!
//! ```text
//! run_tts(text) → segment → cache get (memory LRU → disk store)
//!     → misses: SynthesisChannel (bounded, 3 workers) → engine under retry
//!     → SegmentPlayer: ordered playback, fillers mask synthesis latency
//! ```
//!
//! The engine is an external HTTP service; this crate only caches and
//! plays. Cached audio is MP3 on disk (`<key>.mp3` + `<key>.meta.json`)
//! and in memory, keyed by the SHA-256 of the canonical request string.

pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod devices;
pub mod engine;
pub mod filler;
pub mod player;
pub mod retry;
pub mod speak;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::AppConfig;
pub use speak::{run_tts, TtsOptions, TtsReport};
