use thiserror::Error;

use crate::{ClientError, Interrupted, RequestIdentity};

/// Failure raised by resource-specific logic.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to get {kind} {identity}: {source}")]
    Fetch {
        kind: String,
        identity: RequestIdentity,
        #[source]
        source: ClientError,
    },

    #[error("failed to reconcile {kind} {identity}: {source}")]
    Apply {
        kind: String,
        identity: RequestIdentity,
        #[source]
        source: ApplyError,
    },

    #[error("reconcile of {kind} {identity} was cancelled")]
    Cancelled {
        kind: String,
        identity: RequestIdentity,
    },

    #[error("reconcile of {kind} {identity} exceeded its deadline")]
    DeadlineExceeded {
        kind: String,
        identity: RequestIdentity,
    },
}

impl Error {
    pub(crate) fn interrupted(reason: Interrupted, kind: &str, identity: &RequestIdentity) -> Self {
        let kind = kind.to_owned();
        let identity = identity.clone();
        match reason {
            Interrupted::Cancelled => Error::Cancelled { kind, identity },
            Interrupted::DeadlineExceeded => Error::DeadlineExceeded { kind, identity },
        }
    }

    pub fn identity(&self) -> &RequestIdentity {
        match self {
            Error::Fetch { identity, .. }
            | Error::Apply { identity, .. }
            | Error::Cancelled { identity, .. }
            | Error::DeadlineExceeded { identity, .. } => identity,
        }
    }

    /// True when the invocation was aborted by its cancellation token, which
    /// only happens while the process shuts down.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
