use thiserror::Error;

/// Errors that can occur when enqueueing jobs.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Failed to serialize the job data.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// Database error occurred during enqueueing.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// A job's `fn_name` could not be mapped to a callable.
///
/// This is recorded like any other execution failure; it never aborts the
/// claim cycle.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Nothing is registered under this name.
    #[error("no callable registered for `{0}`")]
    UnknownFunction(String),
}

/// A queue or error-log table name that cannot be safely used as an SQL identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTableName {
    /// The name, or one of its dot-separated segments, is empty.
    #[error("table name `{0}` has an empty segment")]
    Empty(String),

    /// The name has more than a schema and a table segment.
    #[error("table name `{0}` has too many segments")]
    TooManySegments(String),

    /// A segment contains a character outside `[A-Za-z0-9_]` or starts with a digit.
    #[error("table name `{0}` contains an invalid character")]
    InvalidCharacter(String),

    /// A segment exceeds the PostgreSQL identifier length limit.
    #[error("table name `{0}` is longer than 63 bytes")]
    TooLong(String),
}
