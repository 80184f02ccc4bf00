use std::sync::Arc;

use reqwest::StatusCode;

/// Represents a result type for operations in the GrowthBook SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// SDK-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the GrowthBook SDK.
///
/// Evaluation itself never fails: malformed rules and unknown operators resolve to "no match".
/// Errors are only produced when loading configuration, either from the host (see
/// [`GrowthBook::set_features`](crate::GrowthBook::set_features)) or from the network (see
/// [`FeaturesRepository`](crate::FeaturesRepository)).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid `api_host` configuration.
    #[error("invalid api_host configuration")]
    InvalidApiHost(#[source] url::ParseError),

    /// Client key is empty or cannot be used as a path segment.
    #[error("invalid client_key configuration")]
    InvalidClientKey,

    /// The server returned a document that is not a usable features payload.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An encrypted payload could not be decrypted with the configured key.
    #[error("failed to decrypt payload: {0}")]
    Decryption(String),

    /// The server answered with a non-success status code.
    #[error("unexpected response status: {0}")]
    HttpStatus(StatusCode),

    /// Network error: timeout, connection refused, interrupted body, etc.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The streaming connection could not be (re)established and retries are exhausted or
    /// disabled.
    #[error("streaming connection failed after {attempts} attempt(s)")]
    StreamConnection {
        /// Number of connection attempts made.
        attempts: u32,
        /// The last error observed.
        #[source]
        source: Arc<Error>,
    },

    /// Malformed JSON supplied by the host or received from the server.
    #[error("failed to parse JSON: {0}")]
    Parse(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// The repository was shut down and can no longer be used.
    #[error("repository is shut down")]
    RepositoryClosed,

    /// Indicates that the refresh thread panicked. This should normally never happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,
}

/// Coarse classification of an [`Error`], useful for deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorCode {
    /// Invalid api host/client key or malformed top-level configuration. Not retried.
    ConfigurationError,
    /// The server could not be reached or did not answer successfully. Retried in the
    /// background.
    NoResponseError,
    /// The streaming connection dropped and could not be re-established.
    StreamConnectionError,
    /// Malformed JSON.
    ParseError,
    /// Anything else.
    Unknown,
}

impl Error {
    /// Classify the error.
    ///
    /// ```
    /// # use growthbook::{Error, FetchErrorCode};
    /// assert_eq!(Error::InvalidClientKey.code(), FetchErrorCode::ConfigurationError);
    /// ```
    pub fn code(&self) -> FetchErrorCode {
        match self {
            Error::InvalidApiHost(_)
            | Error::InvalidClientKey
            | Error::Configuration(_)
            | Error::Decryption(_) => FetchErrorCode::ConfigurationError,
            Error::HttpStatus(status) if status.is_client_error() => {
                FetchErrorCode::ConfigurationError
            }
            Error::HttpStatus(_) | Error::Network(_) => FetchErrorCode::NoResponseError,
            Error::StreamConnection { .. } => FetchErrorCode::StreamConnectionError,
            Error::Parse(_) => FetchErrorCode::ParseError,
            Error::Io(_) | Error::RepositoryClosed | Error::RefreshThreadPanicked => {
                FetchErrorCode::Unknown
            }
        }
    }

    /// Returns `true` if retrying the same request cannot succeed.
    pub(crate) fn is_fatal(&self) -> bool {
        self.code() == FetchErrorCode::ConfigurationError
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}
