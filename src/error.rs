//! Error types for the cStor operator
//!
//! Every reconcile pass returns [`Result`]. The worker loop decides whether to
//! re-enqueue a key by looking at [`Error::category`].

use thiserror::Error;

use crate::fault::FaultPoint;
use crate::placement::SelectionError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cStor operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that is not one of the mapped kinds below
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic concurrency failure on update
    #[error("version conflict on {kind} {name}")]
    Conflict { kind: String, name: String },

    /// Malformed object or request
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another actor holds a resource this pass needs
    #[error("contention: {0}")]
    Contention(String),

    /// Cluster state violates a controller invariant
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Not enough healthy pools to place the requested replicas
    #[error("insufficient pools: need {required}, have {available}")]
    InsufficientPools { required: usize, available: usize },

    /// Node or device selection failed for a pool spec
    #[error("placement failed: {0}")]
    Selection(#[from] SelectionError),

    /// Failure forced by the fault injection gate
    #[error("injected fault at {point}")]
    InjectedFault { point: FaultPoint },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unparseable capacity quantity
    #[error("invalid quantity {0:?}")]
    Quantity(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error annotated with what was being attempted
    #[error("failed to {context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// How the worker loop treats a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// API timeout, conflict, injected fault: retry with backoff
    Transient,
    /// Malformed object: do not retry
    Validation,
    /// Lease or device claimed elsewhere: retry with backoff
    Contention,
    /// Controller invariant broken: self-heal, then retry
    Invariant,
}

impl ErrorCategory {
    /// Whether the key should be re-enqueued with backoff.
    pub fn should_requeue(&self) -> bool {
        !matches!(self, ErrorCategory::Validation)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Contention => write!(f, "contention"),
            ErrorCategory::Invariant => write!(f, "invariant"),
        }
    }
}

impl Error {
    /// Classify this error for retry decisions.
    ///
    /// A missing primary object never reaches here: reconcilers read it as
    /// `None` and return early. Any other `NotFound` is a race with a
    /// concurrent delete and is retried.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Kube(_)
            | Error::NotFound { .. }
            | Error::Conflict { .. }
            | Error::AlreadyExists { .. }
            | Error::InjectedFault { .. }
            | Error::Internal(_) => ErrorCategory::Transient,
            Error::Validation(_) | Error::Serialization(_) | Error::Quantity(_) => {
                ErrorCategory::Validation
            }
            Error::Contention(_) | Error::InsufficientPools { .. } => ErrorCategory::Contention,
            Error::Selection(e) => e.category(),
            Error::Invariant(_) => ErrorCategory::Invariant,
            Error::Context { source, .. } => source.category(),
        }
    }

    /// Wrap this error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// Map a kube client error for an object of `kind` named `name`.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Error::Kube(other),
        }
    }
}

/// Attach context to the error side of a [`Result`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
