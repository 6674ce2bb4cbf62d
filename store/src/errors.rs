use thiserror::Error;

/// Errors surfaced by blob and block store operations.
///
/// [Error::Transient] is the only variant the retry ladder recovers from;
/// everything else propagates to the caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested object does not exist. Not logged above debug.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost its race. Only the legacy content-index
    /// updater expects (and recovers from) this.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Retryable backend failure. Unclassified backend errors map here so
    /// the retry ladder gets a chance to recover them.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The operation was abandoned before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Decode failure, hash mismatch, or a blob whose content does not
    /// match its key. The offending blob is left in place for inspection.
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// I/O after retries were exhausted, or an unexpected backend error.
    #[error("i/o error: {0}")]
    Fatal(String),

    /// Invalid configuration, rejected before any operation runs: unknown
    /// URI scheme, unsupported algorithm, crossed index protocols.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Severity used when combining the outcome of fanned-out operations:
    /// the worst result wins.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            Error::NotFound(_) => 1,
            Error::Cancelled => 2,
            Error::PreconditionFailed(_) => 2,
            Error::Transient(_) => 3,
            Error::Corruption(_) => 4,
            Error::Config(_) => 4,
            Error::Fatal(_) => 5,
        }
    }

    pub(crate) fn worse_of(a: Error, b: Error) -> Error {
        if b.severity() > a.severity() {
            b
        } else {
            a
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            object_store::Error::Precondition { path, .. } => {
                Error::PreconditionFailed(path)
            }
            object_store::Error::AlreadyExists { path, .. } => {
                Error::PreconditionFailed(path)
            }
            object_store::Error::NotImplemented => {
                Error::Fatal("operation not supported by backend".to_string())
            }
            e => Error::Transient(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Fatal(e.to_string())
    }
}
