//! Application configuration.
//!
//! Loaded from an optional `kodama.toml` layered under `KODAMA__`-prefixed
//! environment variables (`KODAMA__CACHE__MAX_SIZE_GB=2.0`), then
//! validated. Every key has a default so a missing file is fine.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use kodama_core::AppError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub voicevox: VoiceVoxConfig,
    pub cache: CacheConfig,
    pub audio: AudioConfig,
    pub filler: FillerConfig,
}

/// Engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceVoxConfig {
    pub base_url: String,
    pub connection_timeout_secs: u64,
    pub default_speaker: u32,
    pub keep_engine_running: bool,
}

impl Default for VoiceVoxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:50021".into(),
            connection_timeout_secs: 30,
            default_speaker: 1,
            keep_engine_running: false,
        }
    }
}

/// Cache directory and bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Resolve a relative `directory` against the executable's directory
    /// instead of the working directory.
    pub use_executable_base_directory: bool,
    pub expiration_days: u32,
    pub max_size_gb: f64,
    pub memory_cache_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./cache"),
            use_executable_base_directory: true,
            expiration_days: 30,
            max_size_gb: 1.0,
            memory_cache_size_mb: 128,
        }
    }
}

/// Playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub volume: f64,
    /// Output device index from the `devices` listing; -1 selects the
    /// system default.
    pub output_device: i32,
    pub desired_latency_ms: u64,
    pub number_of_buffers: u32,
    pub prepare_device: bool,
    pub preparation_duration_ms: u64,
    pub preparation_volume: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            output_device: -1,
            desired_latency_ms: 100,
            number_of_buffers: 3,
            prepare_device: true,
            preparation_duration_ms: 100,
            preparation_volume: 0.0,
        }
    }
}

/// Filler interjection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub texts: Vec<String>,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./filler"),
            texts: vec![
                "ええと".into(),
                "あの".into(),
                "えー".into(),
                "うんと".into(),
            ],
        }
    }
}

impl AppConfig {
    /// Load from `kodama.toml` (or an explicit path) plus environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let file = match path {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::with_name("kodama").required(false),
        };

        let loaded = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("KODAMA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::InvalidSettings {
                message: e.to_string(),
            })?;

        let app: AppConfig = loaded
            .try_deserialize()
            .map_err(|e| AppError::InvalidSettings {
                message: e.to_string(),
            })?;

        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        fn invalid(message: impl Into<String>) -> AppError {
            AppError::InvalidSettings {
                message: message.into(),
            }
        }

        if !self.voicevox.base_url.starts_with("http://")
            && !self.voicevox.base_url.starts_with("https://")
        {
            return Err(invalid(format!(
                "voicevox.base_url must be an http(s) URL, got {:?}",
                self.voicevox.base_url
            )));
        }
        if self.voicevox.connection_timeout_secs == 0 {
            return Err(invalid("voicevox.connection_timeout_secs must be positive"));
        }
        if self.voicevox.default_speaker == 0 {
            return Err(invalid("voicevox.default_speaker must be positive"));
        }
        if self.cache.expiration_days == 0 {
            return Err(invalid("cache.expiration_days must be positive"));
        }
        if self.cache.max_size_gb <= 0.0 {
            return Err(invalid("cache.max_size_gb must be positive"));
        }
        if self.cache.memory_cache_size_mb == 0 {
            return Err(invalid("cache.memory_cache_size_mb must be positive"));
        }
        if !(0.0..=2.0).contains(&self.audio.volume) {
            return Err(invalid("audio.volume must be between 0.0 and 2.0"));
        }
        if self.filler.enabled && self.filler.texts.is_empty() {
            return Err(invalid("filler.texts must not be empty when filler is enabled"));
        }
        Ok(())
    }
}

/// Resolve a configured directory.
///
/// Relative paths are resolved against the executable's directory when
/// `use_executable_base` is set, otherwise left relative to the working
/// directory.
pub fn resolve_base_dir(dir: &Path, use_executable_base: bool) -> PathBuf {
    if dir.is_absolute() || !use_executable_base {
        return dir.to_path_buf();
    }
    match std::env::current_exe() {
        Ok(exe) => match exe.parent() {
            Some(parent) => parent.join(dir),
            None => dir.to_path_buf(),
        },
        Err(_) => dir.to_path_buf(),
    }
}
