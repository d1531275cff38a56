//! Error types for memport
//!
//! Every component reports failures through the single [`Error`] enum.
//! Callers predicate on [`ErrorKind`] through [`Error::is`], which sees
//! through wrapping ([`Error::Context`]) and merged failures
//! ([`Error::Multiple`]).
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for memport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller's scope was cancelled
    Cancelled,
    /// The caller's deadline passed
    DeadlineExceeded,
    /// Commit or rollback on a finished transaction
    TxDone,
    /// No transaction in the context
    NoTx,
    /// A required context value is missing
    NoCtx,
    /// Release without a matching lock context
    NoLock,
    /// Lookup, update or delete on an absent key
    NotFound,
    /// Create on a present key
    AlreadyExists,
    /// A required collaborator is absent
    NilPointer,
    /// An id was required but not supplied
    MissingId,
    /// The cache source lacks the requested capability
    NotImplementedBySource,
    /// The default minter cannot produce ids of this type
    UnsupportedIdType,
    /// Configuration could not be read or parsed
    Config,
    /// Several failures merged together
    Multiple,
    /// Invariant violation inside memport
    Internal,
}

/// Error types for memport
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Context cancelled
    #[error("context canceled")]
    Cancelled,

    /// Context deadline exceeded
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Transaction already committed or rolled back
    #[error("tx already done")]
    TxDone,

    /// No transaction found in the context
    #[error("no transaction found in the context")]
    NoTx,

    /// Required context value missing
    #[error("missing context value: {0}")]
    NoCtx(String),

    /// No lock held by the context
    #[error("no lock held by the context")]
    NoLock,

    /// Entity or record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Required collaborator is absent
    #[error("nil pointer: {0}")]
    NilPointer(String),

    /// Id required but missing
    #[error("missing id: {0}")]
    MissingId(String),

    /// Capability not implemented by the cache source
    #[error("operation not implemented by source: {0}")]
    NotImplementedBySource(&'static str),

    /// Default minter cannot produce this id type
    #[error("unsupported id type for default minting: {0}")]
    UnsupportedIdType(&'static str),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Several merged failures, in the order they happened
    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),

    /// An error annotated with where it happened
    #[error("{message}: {source}")]
    Context {
        /// Annotation
        message: String,
        /// Wrapped error
        source: Box<Error>,
    },

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Classify this error, looking through [`Error::Context`] wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::TxDone => ErrorKind::TxDone,
            Error::NoTx => ErrorKind::NoTx,
            Error::NoCtx(_) => ErrorKind::NoCtx,
            Error::NoLock => ErrorKind::NoLock,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NilPointer(_) => ErrorKind::NilPointer,
            Error::MissingId(_) => ErrorKind::MissingId,
            Error::NotImplementedBySource(_) => ErrorKind::NotImplementedBySource,
            Error::UnsupportedIdType(_) => ErrorKind::UnsupportedIdType,
            Error::Config(_) => ErrorKind::Config,
            Error::Multiple(_) => ErrorKind::Multiple,
            Error::Context { source, .. } => source.kind(),
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error, or any error it wraps or merges, is of `kind`
    pub fn is(&self, kind: ErrorKind) -> bool {
        match self {
            Error::Multiple(errors) => {
                kind == ErrorKind::Multiple || errors.iter().any(|e| e.is(kind))
            }
            Error::Context { source, .. } => source.is(kind),
            other => other.kind() == kind,
        }
    }

    /// Whether this error reports the end of the caller's scope
    pub fn is_cancellation(&self) -> bool {
        self.is(ErrorKind::Cancelled) || self.is(ErrorKind::DeadlineExceeded)
    }

    /// Annotate this error, preserving its kind
    pub fn context(self, message: impl Into<String>) -> Error {
        Error::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Merge a set of errors into at most one
    ///
    /// Nested [`Error::Multiple`] values are flattened.
    pub fn merge(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Multiple(flat)),
        }
    }

    /// Merge `other` into this error
    pub fn join(self, other: Error) -> Error {
        Error::merge([self, other]).unwrap_or(Error::Multiple(Vec::new()))
    }
}

/// Collapse a list of errors into a `Result`
pub fn merge_results(errors: Vec<Error>) -> Result<()> {
    match Error::merge(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
