use std::{sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};

use crate::{DiskCore, Error, Result};

/// Periodic work the fair queueing policy runs on each disk.
///
/// Runs on the disk's maintenance thread. Must not dispatch requests.
pub trait MaintenanceTask: Send + Sync + 'static {
    fn run_once(&self, core: &DiskCore);
}

/// Logs per-client load at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadReporter;

impl MaintenanceTask for LoadReporter {
    fn run_once(&self, core: &DiskCore) {
        let clients = core.clients();
        debug!(
            incomplete = core.incomplete_count(),
            idle = core.is_idle(),
            idle_accumulated = ?core.idle_accumulated(),
            clients = clients.len(),
            "disk load"
        );
        for client in clients {
            let stats = client.stats();
            debug!(
                client = %stats.owner,
                in_flight = stats.issued.saturating_sub(stats.completed),
                pending = stats.pending,
                max_throughput = stats.max_throughput,
                latency = ?stats.latency_ewma,
                "client load"
            );
        }
    }
}

pub(super) struct Handle {
    pub(super) cancel: CancellationToken,
    pub(super) done_rx: oneshot::Receiver<()>,
}

pub(super) fn launch(
    core: Arc<DiskCore>,
    task: Arc<dyn MaintenanceTask>,
    period: Duration,
) -> Result<Handle> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::allocation("fq maintenance runtime", e))?;
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = oneshot::channel();
    let name = core.name().to_owned();
    std::thread::Builder::new()
        .name(format!("{}-fq-maint", name))
        .spawn({
            let cancel = cancel.clone();
            move || {
                let span = info_span!("fq_maintenance", disk = %name);
                let _entered = span.enter(); // safe to use here because we use new_current_thread
                info!("maintenance thread running");
                rt.block_on(run(&core, &*task, period, cancel));

                info!("maintenance shutdown start");
                scopeguard::defer_on_success! {info!("maintenance shutdown end")};
                scopeguard::defer_on_unwind! {tracing::error!("maintenance shutdown panic")};
                drop(core);
                // interest may be gone if the context was dropped without detach
                let _ = done_tx.send(());
            }
        })
        .map_err(|e| Error::allocation("fq maintenance thread", e))?;
    Ok(Handle { cancel, done_rx })
}

async fn run(core: &DiskCore, task: &dyn MaintenanceTask, period: Duration, cancel: CancellationToken) {
    // interval() panics on a zero period
    let mut ticks = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => task.run_once(core),
        }
    }
}
