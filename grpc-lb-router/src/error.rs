//! Errors that cross component boundaries.

use std::{error::Error as StdError, fmt, sync::Arc};

/// A cloneable, type-erased error.
///
/// A single failure (a broken resolver, a router shutdown) is delivered to
/// every pending pick, so the error has to be shareable. The `source()` chain
/// of the wrapped error is preserved.
#[derive(Clone)]
pub struct SharedError(Arc<dyn StdError + Send + Sync + 'static>);

impl SharedError {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self(Arc::from(error.into()))
    }

    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

/// Failure reported by a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolverError {
    /// The resolver was shut down while a result was outstanding, carrying
    /// the error the channel was shut down with.
    #[error("resolver shut down")]
    Shutdown(#[source] Option<SharedError>),
    /// Resolution cannot make progress ever again.
    #[error("failed to resolve '{target}'")]
    Fatal {
        target: String,
        #[source]
        source: SharedError,
    },
}

impl ResolverError {
    pub fn fatal(target: impl Into<String>, source: impl Into<SharedError>) -> Self {
        Self::Fatal {
            target: target.into(),
            source: source.into(),
        }
    }
}

/// Failure to turn a resolution result into a usable policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LbPolicyError {
    #[error("no load balancing policy named '{0}' is registered")]
    UnknownPolicy(String),
    #[error("'{0}' requires at least one address")]
    NoAddresses(&'static str),
    #[error("failed to create '{policy}'")]
    Creation {
        policy: &'static str,
        #[source]
        source: SharedError,
    },
}

/// A [`RequestRouter`](crate::RequestRouter) could not be built.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    InvalidTarget(#[from] crate::target::ParseError),
    #[error("default load balancing policy '{0}' is not registered")]
    UnknownLbPolicy(String),
}

/// Outcome of a failed pick or ping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PickError {
    /// Name resolution is broken for good.
    #[error("name resolution failed")]
    ResolutionFailed(#[source] ResolverError),
    /// The caller cancelled the pick.
    #[error("pick cancelled")]
    Cancelled,
    /// The router or the policy holding the pick was shut down.
    #[error("channel shut down")]
    Shutdown(#[source] Option<SharedError>),
    /// No backend can serve the call right now.
    #[error("no connection available")]
    Unavailable(#[source] SharedError),
}

impl PickError {
    /// Error used to complete an operation whose owner went away.
    pub fn abandoned() -> Self {
        Self::Shutdown(None)
    }

    /// The gRPC status code a call failing with this error should carry.
    pub fn code(&self) -> tonic::Code {
        match self {
            PickError::Cancelled => tonic::Code::Cancelled,
            PickError::ResolutionFailed(_)
            | PickError::Shutdown(_)
            | PickError::Unavailable(_) => tonic::Code::Unavailable,
        }
    }
}

impl From<PickError> for tonic::Status {
    fn from(error: PickError) -> Self {
        tonic::Status::new(error.code(), error_chain(&error))
    }
}

/// Render an error and all of its sources as `outer: inner: root`.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_message_distinguishes_failure_stage() {
        let resolution = PickError::ResolutionFailed(ResolverError::fatal(
            "dns:///bad",
            SharedError::msg("NXDOMAIN"),
        ));
        let status = tonic::Status::from(resolution);
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(
            status.message(),
            "name resolution failed: failed to resolve 'dns:///bad': NXDOMAIN"
        );

        let backends = PickError::Unavailable(SharedError::msg("connection refused"));
        assert_eq!(
            tonic::Status::from(backends).message(),
            "no connection available: connection refused"
        );
    }

    #[test]
    fn cancellation_maps_to_cancelled() {
        assert_eq!(
            tonic::Status::from(PickError::Cancelled).code(),
            tonic::Code::Cancelled
        );
    }

    #[test]
    fn shared_error_keeps_anyhow_context_chain() {
        let error = anyhow::anyhow!("refused").context("connecting to 10.0.0.1:80");
        let shared = SharedError::from(error);
        assert_eq!(error_chain(&shared), "connecting to 10.0.0.1:80: refused");
    }
}
