//! Pass-through policy: every request goes straight to [`Disk::submit_raw`](crate::Disk::submit_raw).

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};

use super::{DiskScheduler, PolicyVersion, SchedulerPolicy, ShutdownOutcome};
use crate::{client::ClientQueue, DiskCore, Request, Result};

pub const NAME: &str = "noop";

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl SchedulerPolicy for NoopPolicy {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> PolicyVersion {
        PolicyVersion::new(1, 0)
    }

    fn attach(&self, _core: &Arc<DiskCore>) -> Result<Arc<dyn DiskScheduler>> {
        Ok(Arc::new(NoopScheduler))
    }
}

pub(crate) struct NoopScheduler;

impl DiskScheduler for NoopScheduler {
    fn submit(&self, core: &Arc<DiskCore>, _client: Arc<ClientQueue>, request: Request) {
        core.submit_raw(request);
    }

    fn on_client_exit(&self, _core: &Arc<DiskCore>, _client: Arc<ClientQueue>) {}

    fn shutdown(&self, _core: &Arc<DiskCore>) -> BoxFuture<'static, ShutdownOutcome> {
        futures::future::ready(ShutdownOutcome::Acknowledged).boxed()
    }
}
