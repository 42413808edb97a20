//! Error types for ragchat.
//!
//! Every failure a turn can hit is an [`Error`]. Provider failures carry a
//! [`ProviderFailure`] that says what went wrong on the wire, which is what
//! the retry policy keys off.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Classification of a failed call to an external provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFailure {
    /// The call did not finish within its deadline.
    Timeout,
    /// The provider could not be reached.
    Connection,
    /// The credential was rejected.
    Authentication,
    /// The credential lacks permission for the resource.
    Permission,
    /// The provider is throttling or the quota is exhausted.
    RateLimit,
    /// The request was rejected as invalid.
    BadRequest,
    /// The index, model, or endpoint does not exist.
    NotFound,
    /// The provider failed internally (5xx).
    Server,
    /// The provider answered, but not with something we could use.
    MalformedResponse,
    /// Anything else.
    Other,
}

impl ProviderFailure {
    /// Maps an HTTP status code to a failure class.
    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            400 | 422 => ProviderFailure::BadRequest,
            401 => ProviderFailure::Authentication,
            403 => ProviderFailure::Permission,
            404 => ProviderFailure::NotFound,
            408 => ProviderFailure::Timeout,
            429 => ProviderFailure::RateLimit,
            500..=599 => ProviderFailure::Server,
            _ => ProviderFailure::Other,
        }
    }

    /// Returns true if a later attempt of the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderFailure::Timeout
                | ProviderFailure::Connection
                | ProviderFailure::RateLimit
                | ProviderFailure::Server
        )
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderFailure::Timeout => "timeout",
            ProviderFailure::Connection => "connection",
            ProviderFailure::Authentication => "authentication",
            ProviderFailure::Permission => "permission",
            ProviderFailure::RateLimit => "rate limit",
            ProviderFailure::BadRequest => "bad request",
            ProviderFailure::NotFound => "not found",
            ProviderFailure::Server => "server",
            ProviderFailure::MalformedResponse => "malformed response",
            ProviderFailure::Other => "other",
        };
        f.write_str(s)
    }
}

/// The main error type for ragchat.
#[derive(Clone, Debug)]
pub enum Error {
    /// Missing or invalid configuration.  Fatal at startup.
    Configuration {
        /// Human-readable error message.
        message: String,
        /// The configuration field at fault.
        param: Option<String>,
    },

    /// The vector-search provider failed.
    Retrieval {
        /// What kind of failure.
        kind: ProviderFailure,
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The chat-completion provider failed.
    Completion {
        /// What kind of failure.
        kind: ProviderFailure,
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The session store refused the operation.
    Session {
        /// Human-readable error message.
        message: String,
        /// The session involved.
        session_id: Option<String>,
    },

    /// Input failed validation.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },
}

impl Error {
    /// Creates a new configuration error.
    pub fn configuration(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Configuration {
            message: message.into(),
            param,
        }
    }

    /// Creates a new retrieval error.
    pub fn retrieval(
        kind: ProviderFailure,
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Retrieval {
            kind,
            message: message.into(),
            retry_after: None,
            source: source.map(Arc::from),
        }
    }

    /// Creates a new completion error.
    pub fn completion(
        kind: ProviderFailure,
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Completion {
            kind,
            message: message.into(),
            retry_after: None,
            source: source.map(Arc::from),
        }
    }

    /// Creates a new session error.
    pub fn session(message: impl Into<String>, session_id: Option<String>) -> Self {
        Error::Session {
            message: message.into(),
            session_id,
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Attaches a provider `retry-after` hint to a retrieval or completion error.
    pub fn with_retry_after(mut self, seconds: Option<u64>) -> Self {
        match &mut self {
            Error::Retrieval { retry_after, .. } | Error::Completion { retry_after, .. } => {
                *retry_after = seconds;
            }
            _ => {}
        }
        self
    }

    /// Returns true if this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// Returns true if this error came from the retrieval stage.
    pub fn is_retrieval(&self) -> bool {
        matches!(self, Error::Retrieval { .. })
    }

    /// Returns true if this error came from the completion stage.
    pub fn is_completion(&self) -> bool {
        matches!(self, Error::Completion { .. })
    }

    /// Returns true if this error is a session error.
    pub fn is_session(&self) -> bool {
        matches!(self, Error::Session { .. })
    }

    /// Returns true if this error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Returns true if this error is a provider timeout.
    pub fn is_timeout(&self) -> bool {
        self.provider_failure() == Some(ProviderFailure::Timeout)
    }

    /// Returns the provider failure class, if this is a provider error.
    pub fn provider_failure(&self) -> Option<ProviderFailure> {
        match self {
            Error::Retrieval { kind, .. } | Error::Completion { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the provider's `retry-after` hint in seconds, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::Retrieval { retry_after, .. } | Error::Completion { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.provider_failure()
            .map(|kind| kind.is_transient())
            .unwrap_or(false)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration { message, param } => {
                if let Some(param) = param {
                    write!(f, "Configuration error: {message} (field: {param})")
                } else {
                    write!(f, "Configuration error: {message}")
                }
            }
            Error::Retrieval {
                kind,
                message,
                retry_after,
                ..
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Retrieval error ({kind}): {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Retrieval error ({kind}): {message}")
                }
            }
            Error::Completion {
                kind,
                message,
                retry_after,
                ..
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Completion error ({kind}): {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Completion error ({kind}): {message}")
                }
            }
            Error::Session {
                message,
                session_id,
            } => {
                if let Some(session_id) = session_id {
                    write!(f, "Session error: {message} (session: {session_id})")
                } else {
                    write!(f, "Session error: {message}")
                }
            }
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Retrieval { source, .. }
            | Error::Completion { source, .. }
            | Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

/// A specialized Result type for ragchat operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert_eq!(ProviderFailure::from_status(401), ProviderFailure::Authentication);
        assert_eq!(ProviderFailure::from_status(429), ProviderFailure::RateLimit);
        assert_eq!(ProviderFailure::from_status(503), ProviderFailure::Server);
        assert_eq!(ProviderFailure::from_status(404), ProviderFailure::NotFound);
        assert_eq!(ProviderFailure::from_status(418), ProviderFailure::Other);
    }

    #[test]
    fn only_transient_provider_errors_retry() {
        assert!(Error::completion(ProviderFailure::Timeout, "slow", None).is_retryable());
        assert!(Error::retrieval(ProviderFailure::Server, "boom", None).is_retryable());
        assert!(!Error::completion(ProviderFailure::Authentication, "nope", None).is_retryable());
        assert!(!Error::validation("empty", None).is_retryable());
        assert!(!Error::configuration("missing", None).is_retryable());
    }

    #[test]
    fn retry_after_only_sticks_to_provider_errors() {
        let err = Error::completion(ProviderFailure::RateLimit, "slow down", None)
            .with_retry_after(Some(7));
        assert_eq!(err.retry_after(), Some(7));
        assert_eq!(
            err.to_string(),
            "Completion error (rate limit): slow down (retry after 7 seconds)"
        );

        let err = Error::session("full", None).with_retry_after(Some(7));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn display_names_the_field() {
        let err = Error::configuration("not set", Some("pinecone_api_key".to_string()));
        assert_eq!(
            err.to_string(),
            "Configuration error: not set (field: pinecone_api_key)"
        );
    }
}
