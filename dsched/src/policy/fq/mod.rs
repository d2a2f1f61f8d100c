//! Fair queueing: per-client rate limiting.
//!
//! Each client may have at most `max_throughput` requests on the disk at a
//! time. A submission that finds its client over the limit is queued; the
//! backlog is drained by the client's next admitted submission, never by a
//! completion. Reads are queued ahead of writes.
//!
//! A maintenance thread per disk runs an injected [`MaintenanceTask`]
//! periodically. It observes the disk state but never dispatches.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tracing::trace;

use super::{await_ack, DiskScheduler, PolicyVersion, SchedulerPolicy, ShutdownOutcome};
use crate::{
    client::{insert_read_priority, ClientQueue},
    DiskCore, Request, Result,
};

mod maintenance;

pub use maintenance::{LoadReporter, MaintenanceTask};

pub const NAME: &str = "fq";

#[derive(Debug, Clone)]
pub struct FqConfig {
    /// Applied to every newly attached client; 0 means unlimited.
    pub default_max_throughput: u64,
    pub maintenance_period: Duration,
}

impl Default for FqConfig {
    fn default() -> Self {
        FqConfig {
            default_max_throughput: 0,
            maintenance_period: Duration::from_secs(1),
        }
    }
}

impl FqConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = *crate::env_tunables::FQ_MAX_THROUGHPUT {
            config.default_max_throughput = max;
        }
        config
    }
}

pub struct FairQueueingPolicy {
    config: FqConfig,
    maintenance: Arc<dyn MaintenanceTask>,
}

impl FairQueueingPolicy {
    pub fn new(config: FqConfig) -> Self {
        Self::with_maintenance(config, Arc::new(LoadReporter))
    }

    pub fn with_maintenance(config: FqConfig, maintenance: Arc<dyn MaintenanceTask>) -> Self {
        FairQueueingPolicy {
            config,
            maintenance,
        }
    }
}

impl Default for FairQueueingPolicy {
    fn default() -> Self {
        Self::new(FqConfig::default())
    }
}

impl SchedulerPolicy for FairQueueingPolicy {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> PolicyVersion {
        PolicyVersion::new(1, 0)
    }

    fn attach(&self, core: &Arc<DiskCore>) -> Result<Arc<dyn DiskScheduler>> {
        let maintenance = maintenance::launch(
            Arc::clone(core),
            Arc::clone(&self.maintenance),
            self.config.maintenance_period,
        )?;
        Ok(Arc::new(FqDisk {
            config: self.config.clone(),
            maintenance: Mutex::new(Some(maintenance)),
        }))
    }
}

struct FqDisk {
    config: FqConfig,
    maintenance: Mutex<Option<maintenance::Handle>>,
}

impl DiskScheduler for FqDisk {
    fn submit(&self, core: &Arc<DiskCore>, client: Arc<ClientQueue>, request: Request) {
        let mut ready = Vec::new();
        {
            let mut pending = client.lock_pending();
            if client.admits() {
                while client.admits() {
                    let Some(queued) = pending.pop_front() else {
                        break;
                    };
                    client.note_issued(queued.length());
                    ready.push(queued);
                }
                if client.admits() {
                    client.note_issued(request.length());
                    ready.push(request);
                } else {
                    trace!(client = %client.owner(), id = request.id(), "backlog used the budget, queueing");
                    insert_read_priority(&mut pending, request);
                }
            } else {
                trace!(
                    client = %client.owner(),
                    id = request.id(),
                    in_flight = client.in_flight(),
                    "over limit, queueing"
                );
                insert_read_priority(&mut pending, request);
            }
        }
        for request in ready {
            core.dispatch_reserved(&client, request, |_| {});
        }
    }

    fn on_client_attach(&self, _core: &Arc<DiskCore>, client: &Arc<ClientQueue>) -> Result<()> {
        if client.max_throughput() == 0 {
            client.set_max_throughput(self.config.default_max_throughput);
        }
        Ok(())
    }

    fn on_client_exit(&self, core: &Arc<DiskCore>, client: Arc<ClientQueue>) {
        // nobody will submit on this client again to drain the backlog
        for request in client.drain_pending() {
            core.dispatch(&client, request);
        }
    }

    fn shutdown(&self, _core: &Arc<DiskCore>) -> BoxFuture<'static, ShutdownOutcome> {
        match self.maintenance.lock().unwrap().take() {
            Some(handle) => {
                handle.cancel.cancel();
                await_ack(handle.done_rx)
            }
            None => futures::future::ready(ShutdownOutcome::AlreadyDetached).boxed(),
        }
    }
}
