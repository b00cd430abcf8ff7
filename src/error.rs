//! Error types for session open, ranged reads, and query execution

use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Failures during session open (URL parsing, pinning, header validation)
/// surface directly. Failures during query execution are first collapsed
/// into SQLite's disk-I/O sentinel inside the VFS shim, then re-expanded at
/// the API boundary: the shim records the underlying error on the session
/// and it is re-attached as the `cause` of [`Error::Query`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object URL: {0}")]
    Url(String),

    #[error("credentials provider failed: {0}")]
    Credentials(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("cannot sign request: {0}")]
    Signing(String),

    #[error("object store returned HTTP {status} for {context}")]
    HttpStatus { status: u16, context: String },

    #[error("object is not versioned: pin response carried no x-amz-version-id")]
    VersioningDisabled,

    #[error("object is not an SQLite database")]
    NotADatabase,

    #[error("requested {requested} but Content-Range was {returned:?}")]
    RangeMismatch {
        requested: String,
        returned: Option<String>,
    },

    #[error("short read: expected {expected} bytes, server sent {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("overread: server sent more than the {expected} bytes requested")]
    Overread { expected: u64 },

    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to prepare statement: {0}")]
    Prepare(#[source] rusqlite::Error),

    /// Engine failure during prepare or row iteration. When the failure was
    /// provoked by the VFS shim, `cause` holds the transport-level error
    /// that the engine only saw as a disk-I/O code.
    #[error("query failed: {message}")]
    Query {
        message: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    #[error("failed to register VFS: {0}")]
    Vfs(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Wrap a transport-layer failure.
    pub(crate) fn network<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Network(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display_keeps_engine_message() {
        let err = Error::Query {
            message: "disk I/O error".to_string(),
            cause: Some(Box::new(Error::Overread { expected: 4096 })),
        };
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn test_query_error_source_chains_to_cause() {
        let err = Error::Query {
            message: "disk I/O error".to_string(),
            cause: Some(Box::new(Error::ShortRead {
                expected: 4096,
                actual: 100,
            })),
        };
        let source = std::error::Error::source(&err).expect("cause should be chained");
        assert!(source.to_string().contains("short read"));
    }
}
