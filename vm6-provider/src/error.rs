//! Error types for the reconciliation core.

use thiserror::Error;

use crate::id::ResourceKind;
use crate::remote::RemoteError;

/// Errors surfaced by reconciler and provider operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote system has no record of the resource.
    ///
    /// Read and Update report a vanished resource as `Ok(None)`; this variant is
    /// only returned where a resource is required to exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The identifier does not match the codec grammar. Never retried.
    #[error("invalid resource format {id:?}: {reason}")]
    MalformedIdentifier { id: String, reason: String },

    /// A remote call failed; propagated verbatim.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A requested change the remote system cannot perform in place.
    #[error("cannot change {kind} attribute `{attribute}`: {reason}")]
    UnsupportedTransition {
        kind: ResourceKind,
        attribute: &'static str,
        reason: String,
    },

    /// An enumerated attribute holds a value outside its allowed set.
    #[error("invalid {attribute} {value:?}, must be one of {allowed:?}")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
        allowed: &'static [&'static str],
    },

    /// The primary resource was created but a substructure call failed.
    ///
    /// `applied` lists the substructure calls that succeeded, `pending` the
    /// failed call followed by those never attempted.
    #[error("{id} created, but {count} substructure call(s) were not applied: {source}", count = .pending.len())]
    PartialCreate {
        id: String,
        applied: Vec<String>,
        pending: Vec<String>,
        #[source]
        source: RemoteError,
    },

    /// The throttle was closed; no new operations are admitted.
    #[error("provider is shutting down")]
    Shutdown,
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;
