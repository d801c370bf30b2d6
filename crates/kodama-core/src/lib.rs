//! Shared types for the kodama TTS cache ecosystem.
//!
//! These types are used across kodama-lib and kodama-cli. Keeping them in
//! kodama-core means consumers can depend on the request model, cache key,
//! and segmenter without pulling in tokio, reqwest, rodio, or other heavy
//! deps. No I/O happens in this crate.

pub mod error;
pub mod meta;
pub mod request;
pub mod segment;

pub use error::{AppError, ErrorCategory};
pub use meta::CacheMetadata;
pub use request::VoiceRequest;
pub use segment::{TextSegment, segment_text, DEFAULT_MAX_SEGMENT_LEN};
