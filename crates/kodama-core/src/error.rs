//! Unified error type for the whole tool.
//!
//! One sum type with a category discriminant instead of per-layer error
//! hierarchies. The category decides the process exit code, every variant
//! carries a stable machine-readable code string, and each kind maps to a
//! localized user message plus a one-line suggested fix.

use thiserror::Error;

/// Error category. Determines the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Engine,
    Cache,
    Audio,
    Api,
    General,
}

impl ErrorCategory {
    /// Process exit code for errors of this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::General => 1,
            ErrorCategory::Configuration => 2,
            ErrorCategory::Engine => 3,
            ErrorCategory::Cache => 4,
            ErrorCategory::Audio => 5,
            ErrorCategory::Api => 6,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    // ── Configuration ───────────────────────────────────────────────
    #[error("invalid settings: {message}")]
    InvalidSettings { message: String },

    // ── Engine ──────────────────────────────────────────────────────
    #[error("engine not available: {message}")]
    EngineNotAvailable { message: String },

    #[error("engine process error: {message}")]
    EngineProcessError { message: String },

    /// Fast-fail issued while the circuit breaker is open.
    #[error("circuit breaker is open, engine calls are suspended")]
    CircuitOpen,

    // ── Cache ───────────────────────────────────────────────────────
    #[error("cache permission denied: {path}")]
    CachePermissionDenied { path: String },

    #[error("cache read error: {message}")]
    CacheReadError { message: String },

    #[error("cache write error: {message}")]
    CacheWriteError { message: String },

    #[error("cache storage full: {message}")]
    CacheFull { message: String },

    // ── Audio ───────────────────────────────────────────────────────
    #[error("audio generation failed: {message}")]
    AudioGenerationFailed { message: String },

    /// Codec initialization failure. Historically a Windows Media
    /// Foundation singleton; here it covers per-call encoder setup.
    #[error("audio codec initialization failed: {message}")]
    MediaFoundationInitFailed { message: String },

    #[error("audio playback timed out after {seconds}s")]
    AudioPlaybackTimeout { seconds: u64 },

    // ── API ─────────────────────────────────────────────────────────
    #[error("api request failed{}: {message}", fmt_status(.status))]
    ApiRequestFailed { status: Option<u16>, message: String },

    #[error("api authentication failed")]
    ApiAuthenticationError,

    #[error("api rate limit exceeded")]
    ApiRateLimitExceeded,

    #[error("api call timed out: {message}")]
    ApiTimeout { message: String },

    #[error("api response invalid: {message}")]
    ApiResponseInvalid { message: String },

    // ── General ─────────────────────────────────────────────────────
    #[error("operation cancelled")]
    OperationCancelled,

    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("operation timed out: {message}")]
    TimeoutError { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("resource not found: {message}")]
    ResourceNotFound { message: String },

    #[error("unknown error: {message}")]
    UnknownError { message: String },
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

impl AppError {
    /// The category discriminant for this error.
    pub fn category(&self) -> ErrorCategory {
        use AppError::*;
        match self {
            InvalidSettings { .. } => ErrorCategory::Configuration,
            EngineNotAvailable { .. } | EngineProcessError { .. } | CircuitOpen => {
                ErrorCategory::Engine
            }
            CachePermissionDenied { .. }
            | CacheReadError { .. }
            | CacheWriteError { .. }
            | CacheFull { .. } => ErrorCategory::Cache,
            AudioGenerationFailed { .. }
            | MediaFoundationInitFailed { .. }
            | AudioPlaybackTimeout { .. } => ErrorCategory::Audio,
            ApiRequestFailed { .. }
            | ApiAuthenticationError
            | ApiRateLimitExceeded
            | ApiTimeout { .. }
            | ApiResponseInvalid { .. } => ErrorCategory::Api,
            OperationCancelled
            | InvalidArguments { .. }
            | TimeoutError { .. }
            | PermissionDenied { .. }
            | ResourceNotFound { .. }
            | UnknownError { .. } => ErrorCategory::General,
        }
    }

    /// Stable machine-readable code, prefixed with the category.
    pub fn code(&self) -> &'static str {
        use AppError::*;
        match self {
            InvalidSettings { .. } => "Configuration.InvalidSettings",
            EngineNotAvailable { .. } => "Engine.EngineNotAvailable",
            EngineProcessError { .. } => "Engine.EngineProcessError",
            CircuitOpen => "Engine.CircuitOpen",
            CachePermissionDenied { .. } => "Cache.CachePermissionDenied",
            CacheReadError { .. } => "Cache.CacheReadError",
            CacheWriteError { .. } => "Cache.CacheWriteError",
            CacheFull { .. } => "Cache.CacheFull",
            AudioGenerationFailed { .. } => "Audio.AudioGenerationFailed",
            MediaFoundationInitFailed { .. } => "Audio.MediaFoundationInitFailed",
            AudioPlaybackTimeout { .. } => "Audio.AudioPlaybackTimeout",
            ApiRequestFailed { .. } => "Api.ApiRequestFailed",
            ApiAuthenticationError => "Api.ApiAuthenticationError",
            ApiRateLimitExceeded => "Api.ApiRateLimitExceeded",
            ApiTimeout { .. } => "Api.ApiTimeout",
            ApiResponseInvalid { .. } => "Api.ApiResponseInvalid",
            OperationCancelled => "General.OperationCancelled",
            InvalidArguments { .. } => "General.InvalidArguments",
            TimeoutError { .. } => "General.TimeoutError",
            PermissionDenied { .. } => "General.PermissionDenied",
            ResourceNotFound { .. } => "General.ResourceNotFound",
            UnknownError { .. } => "General.UnknownError",
        }
    }

    /// Process exit code (delegates to the category).
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    /// Localized one-line message shown to the user.
    pub fn user_message(&self) -> &'static str {
        use AppError::*;
        match self {
            InvalidSettings { .. } => "設定が正しくありません",
            EngineNotAvailable { .. } => "音声合成エンジンに接続できません",
            EngineProcessError { .. } => "音声合成エンジンでエラーが発生しました",
            CircuitOpen => "エンジンへの接続が一時的に停止されています",
            CachePermissionDenied { .. } => "キャッシュディレクトリにアクセスできません",
            CacheReadError { .. } => "キャッシュの読み込みに失敗しました",
            CacheWriteError { .. } => "キャッシュの書き込みに失敗しました",
            CacheFull { .. } => "キャッシュ用のディスク容量が不足しています",
            AudioGenerationFailed { .. } => "音声の生成に失敗しました",
            MediaFoundationInitFailed { .. } => "音声コーデックの初期化に失敗しました",
            AudioPlaybackTimeout { .. } => "音声の再生がタイムアウトしました",
            ApiRequestFailed { .. } => "APIリクエストが失敗しました",
            ApiAuthenticationError => "API認証に失敗しました",
            ApiRateLimitExceeded => "APIのレート制限を超過しました",
            ApiTimeout { .. } => "APIリクエストがタイムアウトしました",
            ApiResponseInvalid { .. } => "APIレスポンスが不正です",
            OperationCancelled => "操作がキャンセルされました",
            InvalidArguments { .. } => "引数が正しくありません",
            TimeoutError { .. } => "操作がタイムアウトしました",
            PermissionDenied { .. } => "アクセスが拒否されました",
            ResourceNotFound { .. } => "リソースが見つかりません",
            UnknownError { .. } => "不明なエラーが発生しました",
        }
    }

    /// One-line suggested fix for the user.
    pub fn suggestion(&self) -> &'static str {
        use AppError::*;
        match self {
            InvalidSettings { .. } => "kodama.toml の設定値を確認してください",
            EngineNotAvailable { .. } | CircuitOpen => {
                "VOICEVOXエンジンが起動しているか確認してください"
            }
            EngineProcessError { .. } => "VOICEVOXエンジンを再起動してください",
            CachePermissionDenied { .. } | PermissionDenied { .. } => {
                "キャッシュディレクトリの権限を確認してください"
            }
            CacheReadError { .. } | CacheWriteError { .. } => {
                "--clear でキャッシュを再作成してください"
            }
            CacheFull { .. } => "ディスクの空き容量を増やすか max_size_gb を下げてください",
            AudioGenerationFailed { .. } | MediaFoundationInitFailed { .. } => {
                "テキストを短くして再試行してください"
            }
            AudioPlaybackTimeout { .. } => {
                "devices コマンドで出力デバイスを確認してください"
            }
            ApiRequestFailed { .. } | ApiResponseInvalid { .. } => {
                "エンジンのバージョンが対応しているか確認してください"
            }
            ApiAuthenticationError => "エンジンの認証設定を確認してください",
            ApiRateLimitExceeded | ApiTimeout { .. } | TimeoutError { .. } => {
                "しばらく待ってから再試行してください"
            }
            OperationCancelled => "再度実行してください",
            InvalidArguments { .. } => "--help で使用方法を確認してください",
            ResourceNotFound { .. } => "指定したリソースが存在するか確認してください",
            UnknownError { .. } => "--verbose で詳細ログを確認してください",
        }
    }

    /// Whether a failed engine call with this error may be retried.
    ///
    /// Matches transient HTTP statuses (500/502/503/504/429), timeouts,
    /// and connection-flavored I/O failures.
    pub fn is_retryable(&self) -> bool {
        use AppError::*;
        match self {
            EngineProcessError { .. }
            | EngineNotAvailable { .. }
            | ApiRateLimitExceeded
            | ApiTimeout { .. }
            | TimeoutError { .. } => true,
            ApiRequestFailed { status, message } => match status {
                Some(502) | Some(504) => true,
                _ => {
                    let lower = message.to_lowercase();
                    lower.contains("connection") || lower.contains("timeout")
                }
            },
            UnknownError { message } => {
                let lower = message.to_lowercase();
                lower.contains("connection") || lower.contains("timeout")
            }
            _ => false,
        }
    }

    /// Whether this error is a rate-limit response (forces a longer backoff).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::ApiRateLimitExceeded)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => AppError::PermissionDenied {
                message: err.to_string(),
            },
            std::io::ErrorKind::NotFound => AppError::ResourceNotFound {
                message: err.to_string(),
            },
            std::io::ErrorKind::TimedOut => AppError::TimeoutError {
                message: err.to_string(),
            },
            _ => AppError::UnknownError {
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(ErrorCategory::General.exit_code(), 1);
        assert_eq!(ErrorCategory::Configuration.exit_code(), 2);
        assert_eq!(ErrorCategory::Engine.exit_code(), 3);
        assert_eq!(ErrorCategory::Cache.exit_code(), 4);
        assert_eq!(ErrorCategory::Audio.exit_code(), 5);
        assert_eq!(ErrorCategory::Api.exit_code(), 6);
    }

    #[test]
    fn codes_are_category_prefixed() {
        let err = AppError::CacheWriteError {
            message: "disk".into(),
        };
        assert_eq!(err.code(), "Cache.CacheWriteError");
        assert_eq!(err.exit_code(), 4);

        let err = AppError::EngineNotAvailable {
            message: "refused".into(),
        };
        assert_eq!(err.code(), "Engine.EngineNotAvailable");
        assert_eq!(err.exit_code(), 3);

        let err = AppError::MediaFoundationInitFailed {
            message: "encoder setup".into(),
        };
        assert_eq!(err.code(), "Audio.MediaFoundationInitFailed");
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn cancel_message_is_localized() {
        assert_eq!(
            AppError::OperationCancelled.user_message(),
            "操作がキャンセルされました"
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(AppError::EngineProcessError { message: "500".into() }.is_retryable());
        assert!(AppError::EngineNotAvailable { message: "503".into() }.is_retryable());
        assert!(AppError::ApiRateLimitExceeded.is_retryable());
        assert!(AppError::ApiTimeout { message: "t".into() }.is_retryable());
        assert!(
            AppError::ApiRequestFailed {
                status: Some(502),
                message: "bad gateway".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::ApiRequestFailed {
                status: Some(400),
                message: "bad request".into()
            }
            .is_retryable()
        );
        assert!(!AppError::ApiAuthenticationError.is_retryable());
        assert!(!AppError::OperationCancelled.is_retryable());
    }

    #[test]
    fn connection_flavored_messages_are_retryable() {
        let err = AppError::ApiRequestFailed {
            status: None,
            message: "Connection reset by peer".into(),
        };
        assert!(err.is_retryable());

        let err = AppError::UnknownError {
            message: "socket Timeout while reading".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn io_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: AppError = io.into();
        assert_eq!(err.code(), "General.PermissionDenied");
    }
}
