//! The scheduler policy interface and the built-in policies.
//!
//! A [`SchedulerPolicy`] is registered once in a
//! [`PolicyRegistry`](registry::PolicyRegistry) and looked up by name when a
//! disk is attached. Attaching produces a per-disk [`DiskScheduler`] that
//! receives every request submitted to that disk's [`DiskContext`](crate::DiskContext).

use std::{fmt, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::{client::ClientQueue, DiskCore, Request, Result};

pub mod bfq;
pub mod fq;
pub mod noop;
pub mod registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolicyVersion {
    pub major: u16,
    pub minor: u16,
}

impl PolicyVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        PolicyVersion { major, minor }
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A named scheduling discipline.
pub trait SchedulerPolicy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> PolicyVersion;

    /// Set up per-disk state and start any background task the policy needs.
    /// Fails only on resource exhaustion.
    fn attach(&self, core: &Arc<DiskCore>) -> Result<Arc<dyn DiskScheduler>>;
}

/// A policy's state on one disk.
///
/// All methods may be called concurrently from any thread. None of them may
/// block on the disk.
pub trait DiskScheduler: Send + Sync + 'static {
    /// Dispatch `request` now or queue it on `client`. `client` is
    /// registered on `core`'s disk.
    fn submit(&self, core: &Arc<DiskCore>, client: Arc<ClientQueue>, request: Request);

    /// Flush hook. Flush requests themselves arrive through [`Self::submit`].
    fn flush(&self, _core: &Arc<DiskCore>) {}

    /// Fail every queued request. Returns the number cancelled.
    fn cancel_all(&self, core: &Arc<DiskCore>) -> usize {
        core.cancel_pending()
    }

    fn on_client_attach(&self, _core: &Arc<DiskCore>, _client: &Arc<ClientQueue>) -> Result<()> {
        Ok(())
    }

    /// `client` has left the registry; dispose of its backlog.
    fn on_client_exit(&self, core: &Arc<DiskCore>, client: Arc<ClientQueue>);

    /// Tell the background task, if any, to stop. Shutdown is initiated by
    /// the call itself; the returned future only awaits the acknowledgement.
    fn shutdown(&self, core: &Arc<DiskCore>) -> BoxFuture<'static, ShutdownOutcome>;
}

/// How the policy's background task reacted to [`DiskScheduler::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The task stopped and released its reference on the disk state.
    Acknowledged,
    /// The task went away without acknowledging (it panicked, or its
    /// runtime was torn down).
    TaskGone,
    /// No acknowledgement within the teardown timeout. The task may still be
    /// running.
    TimedOut,
    /// [`DiskContext::detach`](crate::DiskContext::detach) was already called
    /// on another clone.
    AlreadyDetached,
}

pub(crate) fn await_ack(done_rx: oneshot::Receiver<()>) -> BoxFuture<'static, ShutdownOutcome> {
    done_rx
        .map(|res| match res {
            Ok(()) => ShutdownOutcome::Acknowledged,
            Err(_) => ShutdownOutcome::TaskGone,
        })
        .boxed()
}
