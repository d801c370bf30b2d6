//! Typed client for the VOICEVOX-style engine HTTP API.
//!
//! The engine is a black box: `audio_query` returns an opaque JSON
//! document that is passed back verbatim to `synthesis`. All calls here
//! are single-shot; retries and the circuit breaker live in
//! [`crate::retry`].

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use kodama_core::{AppError, VoiceRequest};
use kodama_core::request::{DEFAULT_PITCH, DEFAULT_SPEED, DEFAULT_VOLUME};

/// Prosody deviations below this threshold are treated as defaults and
/// omitted from the query string.
const PROSODY_EPSILON: f64 = 1e-4;

/// How long [`EngineClient::ensure_ready`] waits for the engine to come up.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(3);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A speaker as reported by `GET /speakers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub styles: Vec<SpeakerStyle>,
}

/// One selectable style of a speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerStyle {
    pub id: u32,
    pub name: String,
}

/// HTTP client for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
}

impl EngineClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::UnknownError {
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `GET /version`: liveness probe, returns the engine version string.
    pub async fn version(&self) -> Result<String, AppError> {
        let resp = self
            .http
            .get(format!("{}/version", self.base_url))
            .send()
            .await
            .map_err(from_transport)?;
        let resp = check_status(resp).await?;
        resp.text().await.map_err(from_transport)
    }

    /// Poll `GET /version` until the engine answers or `timeout` passes.
    pub async fn ensure_ready(&self, timeout: Duration) -> Result<(), AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = String::new();
        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(AppError::EngineNotAvailable { message: last });
            }
            match self.version().await {
                Ok(version) => {
                    debug!(%version, "engine ready");
                    return Ok(());
                }
                Err(e) => {
                    last = e.to_string();
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// `GET /speakers`: the engine's speaker and style catalogue.
    pub async fn list_speakers(&self) -> Result<Vec<Speaker>, AppError> {
        let resp = self
            .http
            .get(format!("{}/speakers", self.base_url))
            .send()
            .await
            .map_err(from_transport)?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| AppError::ApiResponseInvalid {
            message: format!("speaker list: {e}"),
        })
    }

    /// `POST /initialize_speaker?speaker=<id>`: idempotent warm-up.
    pub async fn initialize_speaker(&self, speaker_id: u32) -> Result<(), AppError> {
        let resp = self
            .http
            .post(format!("{}/initialize_speaker", self.base_url))
            .query(&[("speaker", speaker_id)])
            .send()
            .await
            .map_err(from_transport)?;
        check_status(resp).await?;
        Ok(())
    }

    /// `POST /audio_query`: returns the engine's opaque query document.
    pub async fn audio_query(&self, request: &VoiceRequest) -> Result<String, AppError> {
        let mut query: Vec<(&str, String)> = vec![
            ("text", request.text.clone()),
            ("speaker", request.speaker_id.to_string()),
        ];
        query.extend(prosody_params(request));

        let resp = self
            .http
            .post(format!("{}/audio_query", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(from_transport)?;
        let resp = check_status(resp).await?;
        resp.text().await.map_err(|e| AppError::ApiResponseInvalid {
            message: format!("audio query body: {e}"),
        })
    }

    /// `POST /synthesis`: WAV bytes for a query document.
    pub async fn synthesize(&self, query_json: &str, speaker_id: u32) -> Result<Vec<u8>, AppError> {
        let resp = self
            .http
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker_id)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(query_json.to_string())
            .send()
            .await
            .map_err(from_transport)?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await.map_err(from_transport)?;
        if bytes.is_empty() {
            return Err(AppError::ApiResponseInvalid {
                message: "synthesis returned an empty body".into(),
            });
        }
        Ok(bytes.to_vec())
    }
}

/// Prosody query parameters, omitting values at their defaults.
///
/// Numbers are formatted with Rust's locale-independent float formatting.
fn prosody_params(request: &VoiceRequest) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if (request.speed - DEFAULT_SPEED).abs() > PROSODY_EPSILON {
        params.push(("speed_scale", format!("{:.2}", request.speed)));
    }
    if (request.pitch - DEFAULT_PITCH).abs() > PROSODY_EPSILON {
        params.push(("pitch_scale", format!("{:.2}", request.pitch)));
    }
    if (request.volume - DEFAULT_VOLUME).abs() > PROSODY_EPSILON {
        params.push(("volume_scale", format!("{:.2}", request.volume)));
    }
    params
}

/// Pass a successful response through, or map the status to an error.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(map_status(status, body))
}

/// HTTP status to error kind mapping.
fn map_status(status: StatusCode, body: String) -> AppError {
    match status.as_u16() {
        401 => AppError::ApiAuthenticationError,
        403 => AppError::PermissionDenied { message: body },
        404 => AppError::ResourceNotFound { message: body },
        408 | 504 => AppError::ApiTimeout {
            message: format!("HTTP {}: {body}", status.as_u16()),
        },
        429 => AppError::ApiRateLimitExceeded,
        500 => AppError::EngineProcessError { message: body },
        503 => AppError::EngineNotAvailable { message: body },
        other => AppError::ApiRequestFailed {
            status: Some(other),
            message: body,
        },
    }
}

/// Classify a transport-level failure from the HTTP client.
fn from_transport(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::ApiTimeout {
            message: err.to_string(),
        }
    } else if err.is_connect() {
        AppError::EngineNotAvailable {
            message: err.to_string(),
        }
    } else {
        AppError::ApiRequestFailed {
            status: None,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_status(StatusCode::BAD_REQUEST, String::new()).code(),
            "Api.ApiRequestFailed"
        );
        assert_eq!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).code(),
            "Api.ApiRequestFailed"
        );
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, String::new()).code(),
            "Api.ApiAuthenticationError"
        );
        assert_eq!(
            map_status(StatusCode::FORBIDDEN, String::new()).code(),
            "General.PermissionDenied"
        );
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, String::new()).code(),
            "General.ResourceNotFound"
        );
        assert_eq!(
            map_status(StatusCode::REQUEST_TIMEOUT, String::new()).code(),
            "Api.ApiTimeout"
        );
        assert_eq!(
            map_status(StatusCode::GATEWAY_TIMEOUT, String::new()).code(),
            "Api.ApiTimeout"
        );
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()).code(),
            "Api.ApiRateLimitExceeded"
        );
        assert_eq!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).code(),
            "Engine.EngineProcessError"
        );
        assert_eq!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).code(),
            "Engine.EngineNotAvailable"
        );
        assert_eq!(
            map_status(StatusCode::BAD_GATEWAY, String::new()).code(),
            "Api.ApiRequestFailed"
        );
    }

    #[test]
    fn default_prosody_omitted_from_query() {
        let req = VoiceRequest::new("こんにちは", 1);
        assert!(prosody_params(&req).is_empty());
    }

    #[test]
    fn near_default_prosody_omitted() {
        let req = VoiceRequest::new("x", 1).with_prosody(1.00005, 0.00005, 0.99995);
        assert!(prosody_params(&req).is_empty());
    }

    #[test]
    fn non_default_prosody_included() {
        let req = VoiceRequest::new("x", 1).with_prosody(1.25, -0.5, 0.8);
        let params = prosody_params(&req);
        assert_eq!(
            params,
            vec![
                ("speed_scale", "1.25".to_string()),
                ("pitch_scale", "-0.50".to_string()),
                ("volume_scale", "0.80".to_string()),
            ]
        );
    }

    #[test]
    fn only_deviating_params_included() {
        let req = VoiceRequest::new("x", 1).with_prosody(1.5, 0.0, 1.0);
        let params = prosody_params(&req);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "speed_scale");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = EngineClient::new("http://127.0.0.1:50021/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:50021");
    }

    #[test]
    fn speaker_json_shape() {
        let json = r#"[{"name":"ずんだもん","version":"0.14.0","styles":[{"id":3,"name":"ノーマル"}]}]"#;
        let speakers: Vec<Speaker> = serde_json::from_str(json).unwrap();
        assert_eq!(speakers[0].name, "ずんだもん");
        assert_eq!(speakers[0].styles[0].id, 3);
    }
}
