//! HTTP utilities for GCP REST API calls

use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Error returned by a single REST call
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered with a non-success status
    #[error("API request failed: {status} {message}")]
    Status { status: u16, message: String },
    /// Transport, auth or decoding failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Other(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// 429 and 5xx are worth retrying by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self.status(), Some(429 | 500 | 502 | 503 | 504))
    }

    /// Build from an error response, reading the `{"error": {"message": ..}}` envelope
    fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Inner {
            message: Option<String>,
        }
        #[derive(Deserialize)]
        struct Envelope {
            error: Option<Inner>,
        }

        let message = serde_json::from_str::<Envelope>(body)
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or_default();

        Self::Status { status, message }
    }
}

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// HTTP client wrapper for GCP API calls
#[derive(Clone)]
pub struct GcpHttpClient {
    client: Client,
}

impl GcpHttpClient {
    /// Create a new HTTP client
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gcpfind/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Make a GET request to a GCP API
    pub async fn get(&self, url: &str, token: &str) -> Result<Value, ApiError> {
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            // 404 is an expected answer for point lookups and probes
            if status.as_u16() == 404 {
                tracing::debug!("API not found: {}", url);
            } else {
                tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
            }
            return Err(ApiError::from_response(status.as_u16(), &body));
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&body).context("Failed to parse response JSON")?)
    }

    /// Make a POST request to a GCP API.
    /// Only used for read-style RPCs that the API exposes as POST.
    pub async fn post(&self, url: &str, token: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        tracing::debug!("POST {}", url);

        let mut request = self.client.post(url).bearer_auth(token);
        request = match body {
            Some(body) => request.json(body),
            None => request.header(reqwest::header::CONTENT_LENGTH, 0),
        };

        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            if status.as_u16() == 404 {
                tracing::debug!("API not found: {}", url);
            } else {
                tracing::error!("API error: {} - {}", status, sanitize_for_log(&response_body));
            }
            return Err(ApiError::from_response(status.as_u16(), &response_body));
        }

        if response_body.is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&response_body).context("Failed to parse response JSON")?)
    }
}

/// Format a GCP API error for display
/// Maps well-known statuses to actionable messages without exposing raw API payloads
pub fn format_gcp_error(error: &ApiError) -> String {
    match error.status() {
        Some(403) => "Permission denied. Check your GCP IAM permissions.".to_string(),
        Some(401) => {
            "Authentication failed. Run 'gcloud auth application-default login'.".to_string()
        }
        Some(404) => "Resource not found.".to_string(),
        Some(429) => "Rate limit exceeded. Please try again later.".to_string(),
        Some(400) => "Invalid request. Check your parameters.".to_string(),
        Some(500 | 502 | 503 | 504) => {
            "GCP service temporarily unavailable. Please try again.".to_string()
        }
        Some(status) => format!("Request failed with HTTP {}.", status),
        None => {
            let error_str = format!("{:#}", error);
            let sanitized = error_str
                .chars()
                .filter(|c| c.is_ascii_graphic() || *c == ' ')
                .take(80)
                .collect::<String>();

            if sanitized.len() < error_str.len() {
                format!("{}...", sanitized)
            } else {
                sanitized
            }
        }
    }
}
