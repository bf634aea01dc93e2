//! Error taxonomy shared by the store, the runtime and the collectors

use crate::resource::ResourceId;
use thiserror::Error;

/// Typed errors returned by store operations and reconcile passes.
#[derive(Error, Debug)]
pub enum Error {
    /// No resource exists for the given id
    #[error("{0} not found")]
    NotFound(ResourceId),

    /// Optimistic concurrency failure: the resource exists already (create) or
    /// its stored version does not match the expected one (update)
    #[error("conflict writing {0}")]
    Conflict(ResourceId),

    /// The resource is owned by another controller
    #[error("{id} is owned by {owner:?}, write attempted by {attempted:?}")]
    OwnerConflict {
        /// The contested resource
        id: ResourceId,
        /// Name of the owning controller, if any
        owner: Option<String>,
        /// Name the writer presented, if any
        attempted: Option<String>,
    },

    /// Destroy was requested while finalizers are still present; the resource
    /// has entered the tearing-down phase and will be removed once the last
    /// finalizer is lifted
    #[error("{0} has finalizers, destroy deferred")]
    PreconditionFailed(ResourceId),

    /// Malformed input; not retried until the next input event
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transient failure talking to a remote node
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The surrounding operation was cancelled or ran out of its deadline
    #[error("operation cancelled")]
    Cancelled,

    /// Bug territory
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a reconcile pass failing with this error should be requeued
    /// with backoff. `InvalidArgument` is shelved until the next input event
    /// instead; `Internal` surfaces loudly but retries too, since the inputs
    /// may have moved on.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidArgument(_))
    }
}

/// Convenience alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;
