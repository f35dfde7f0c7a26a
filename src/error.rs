//! Error messages returned by this library

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The fetched URI doesn't exist locally and couldn't be resolved
    #[error("Object was not found")]
    NotFound,
    /// A URI failed to parse, used a disallowed scheme, or pointed at a
    /// loopback/link-local host
    #[error("URI failed validation: {0}")]
    InvalidUri(String),
    /// The remote server returned a terminal error (4xx other than 429, malformed
    /// body, non-object JSON, too many redirects)
    #[error("Fetch of {uri} failed: {message}")]
    FailedFetch {
        /// The URI that was being fetched
        uri: String,
        /// Human readable explanation
        message: String,
    },
    /// The remote server returned a retriable error (429, 5xx, connection/timeout
    /// issues)
    #[error("Fetch of {uri} failed temporarily: {message}")]
    TemporaryFetchError {
        /// The URI that was being fetched
        uri: String,
        /// Human readable explanation
        message: String,
    },
    /// WebFinger resolution did not find a matching `self` link
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// The signing worker pool was torn down while a request was in flight
    #[error("Signature worker pool was shut down")]
    SigningCancelled,
    /// Persistent storage returned an error
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// True for errors that should advance a domain's failure streak and be
    /// retried later rather than given up on immediately.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::TemporaryFetchError { .. })
    }
}
