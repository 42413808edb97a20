//! HTTP plumbing shared by the provider adapters.

use std::time::Duration;

use reqwest::{Client as ReqwestClient, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, ProviderFailure, Result};

/// Which external provider an HTTP call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Provider {
    Retrieval,
    Completion,
}

impl Provider {
    pub(crate) fn error(
        self,
        kind: ProviderFailure,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Error {
        match self {
            Provider::Retrieval => Error::retrieval(kind, message, source),
            Provider::Completion => Error::completion(kind, message, source),
        }
    }
}

/// Parses an API root so that relative endpoints join beneath it.
///
/// `Url::join` replaces the last path segment of a base without a trailing
/// slash, which would turn `https://api.openai.com/v1` + `chat/completions`
/// into `https://api.openai.com/chat/completions`.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Builds the reqwest client used by an adapter.
pub(crate) fn build_client(timeout: Duration) -> Result<ReqwestClient> {
    ReqwestClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| {
            Error::configuration(format!("Failed to build HTTP client: {}", e), None)
        })
}

/// Maps a transport-level reqwest failure to a provider error.
pub(crate) fn send_error(provider: Provider, err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        provider.error(
            ProviderFailure::Timeout,
            format!(
                "Request timed out after {:.1} seconds: {}",
                timeout.as_secs_f64(),
                err
            ),
            Some(Box::new(err)),
        )
    } else if err.is_connect() {
        provider.error(
            ProviderFailure::Connection,
            format!("Connection error: {}", err),
            Some(Box::new(err)),
        )
    } else {
        provider.error(
            ProviderFailure::Other,
            format!("Request failed: {}", err),
            Some(Box::new(err)),
        )
    }
}

/// Turns a non-success response into a provider error.
///
/// Both OpenAI (`{"error": {"message": ...}}`) and Pinecone
/// (`{"error": {"code": ..., "message": ...}}` or `{"message": ...}`) error
/// bodies are understood; anything else is reported verbatim.
pub(crate) async fn error_response(provider: Provider, response: Response) -> Error {
    let status_code = response.status().as_u16();

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.trim().parse::<u64>().ok());

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            return provider.error(
                ProviderFailure::from_status(status_code),
                format!("Failed to read error response: {}", e),
                Some(Box::new(e)),
            );
        }
    };

    let message = error_message(&body).unwrap_or(body);
    provider
        .error(
            ProviderFailure::from_status(status_code),
            format!("HTTP {status_code}: {message}"),
            None,
        )
        .with_retry_after(retry_after)
}

/// Reads a successful response body as JSON.
pub(crate) async fn json_body<T: DeserializeOwned>(
    provider: Provider,
    response: Response,
) -> Result<T> {
    response.json::<T>().await.map_err(|e| {
        provider.error(
            ProviderFailure::MalformedResponse,
            format!("Failed to parse response: {}", e),
            Some(Box::new(e)),
        )
    })
}

fn error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: Option<ErrorDetail>,
        message: Option<String>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Object {
            message: Option<String>,
            #[serde(rename = "type")]
            error_type: Option<serde_json::Value>,
            code: Option<serde_json::Value>,
        },
        Text(String),
    }

    let parsed: ErrorResponse = serde_json::from_str(body).ok()?;
    match parsed.error {
        Some(ErrorDetail::Object {
            message: Some(message),
            error_type,
            code,
        }) => match error_type.or(code) {
            Some(serde_json::Value::String(label)) => Some(format!("{label}: {message}")),
            Some(serde_json::Value::Null) | None => Some(message),
            Some(label) => Some(format!("{label}: {message}")),
        },
        Some(ErrorDetail::Text(message)) => Some(message),
        _ => parsed.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_gain_a_trailing_slash() {
        let url = base_url("https://api.openai.com/v1").unwrap();
        assert_eq!(url.as_str(), "https://api.openai.com/v1/");
        assert_eq!(
            url.join("chat/completions").unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            base_url("https://api.openai.com/v1/").unwrap().as_str(),
            "https://api.openai.com/v1/"
        );
        assert_eq!(
            base_url("https://api.pinecone.io").unwrap().as_str(),
            "https://api.pinecone.io/"
        );
        assert!(base_url("not a url").is_err());
    }

    #[test]
    fn openai_error_body() {
        let body = r#"{"error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "param": null, "code": "invalid_api_key"}}"#;
        assert_eq!(
            error_message(body).as_deref(),
            Some("invalid_request_error: Incorrect API key provided")
        );
    }

    #[test]
    fn pinecone_error_body() {
        let body = r#"{"error": {"code": "NOT_FOUND", "message": "Resource docs not found"}, "status": 404}"#;
        assert_eq!(
            error_message(body).as_deref(),
            Some("NOT_FOUND: Resource docs not found")
        );

        let body = r#"{"code": 3, "message": "Vector dimension 3 does not match", "details": []}"#;
        assert_eq!(
            error_message(body).as_deref(),
            Some("Vector dimension 3 does not match")
        );
    }

    #[test]
    fn unparseable_body_is_none() {
        assert!(error_message("<html>bad gateway</html>").is_none());
    }

    fn response(status: u16, retry_after: Option<&str>, body: &'static str) -> Response {
        let mut builder = ::http::Response::builder().status(status);
        if let Some(retry_after) = retry_after {
            builder = builder.header("retry-after", retry_after);
        }
        Response::from(builder.body(body).unwrap())
    }

    #[tokio::test]
    async fn rate_limited_response_carries_retry_after() {
        let body = r#"{"error": {"message": "slow down", "type": "rate_limit_error"}}"#;
        let err = error_response(Provider::Completion, response(429, Some("7"), body)).await;
        assert!(err.is_completion());
        assert_eq!(err.provider_failure(), Some(ProviderFailure::RateLimit));
        assert_eq!(err.retry_after(), Some(7));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 429: rate_limit_error: slow down"));
    }

    #[tokio::test]
    async fn server_error_without_json_is_reported_verbatim() {
        let err = error_response(
            Provider::Retrieval,
            response(503, Some("soon"), "<html>upstream busy</html>"),
        )
        .await;
        assert!(err.is_retrieval());
        assert_eq!(err.provider_failure(), Some(ProviderFailure::Server));
        assert_eq!(err.retry_after(), None);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 503: <html>upstream busy</html>"));
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retryable() {
        let body = r#"{"error": {"code": "UNAUTHENTICATED", "message": "Invalid API Key"}}"#;
        let err = error_response(Provider::Retrieval, response(401, None, body)).await;
        assert_eq!(err.provider_failure(), Some(ProviderFailure::Authentication));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("UNAUTHENTICATED: Invalid API Key"));
    }

    #[test]
    fn provider_picks_the_variant() {
        assert!(Provider::Retrieval
            .error(ProviderFailure::Server, "x", None)
            .is_retrieval());
        assert!(Provider::Completion
            .error(ProviderFailure::Server, "x", None)
            .is_completion());
    }
}
