/// Errors of the synchronous framework surface.
///
/// Only attaching a disk or a client can fail at runtime; detach never fails
/// outward and per-request failures are reported through [`RequestError`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failure: {what}")]
    AllocationFailure {
        what: &'static str,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    #[error("scheduler policy {name:?} is not registered")]
    PolicyNotFound { name: String },
    #[error("scheduler policy {name:?} is already registered")]
    PolicyAlreadyRegistered { name: String },
    #[error("scheduler policy {name:?} is still attached to {attached} disk(s)")]
    PolicyBusy { name: String, attached: usize },
    #[error("disk {disk:?} is detaching")]
    Detaching { disk: String },
}

impl Error {
    pub(crate) fn allocation<E>(what: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::AllocationFailure {
            what,
            source: Some(Box::new(source)),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a request that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The disk failed the request. The error is forwarded verbatim.
    #[error(transparent)]
    Device(#[from] std::io::Error),
    /// The request was removed from its queue before it reached the disk.
    /// Terminal; retrying a cancelled request is the submitter's decision
    /// and never happens inside the scheduler.
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}
