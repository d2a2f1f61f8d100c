//! Budget fair queueing.
//!
//! All scheduling state of a disk lives on a dedicated control actor thread.
//! Submitters only queue their request on their client queue and ask the
//! actor to dequeue; completions ask again. Which client is
//! served, for how many bytes, and whether the disk is held idle for a
//! client that just ran dry is up to the [`BudgetStrategy`], by default
//! [`RoundRobinBudget`].
//!
//! Per-disk counters are published in [`diagnostics`] while the actor runs.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{await_ack, DiskScheduler, PolicyVersion, SchedulerPolicy, ShutdownOutcome};
use crate::{
    client::{insert_read_priority, ClientQueue},
    Direction, DiskCore, Request, Result,
};

mod actor;
mod budget;
pub mod diagnostics;
mod strategy;

pub use budget::RoundRobinBudget;
pub use diagnostics::{BfqDiagnostics, BfqStats};
pub use strategy::{BudgetStrategy, StrategyCx, StrategyFactory};

use actor::{ControlMessage, ControlSender, SendOutcome};
use strategy::StrategyHost;

pub const NAME: &str = "bfq";

const KIB: u64 = 1024;

#[derive(Debug, Clone)]
pub struct BfqConfig {
    /// Requests the disk may hold at once; the strategy stops dispatching
    /// when it is full.
    pub max_tag_queue_depth: usize,
    /// Budget of a client's first slice, and the floor of every later one.
    pub min_budget: u64,
    /// Initial value of [`BfqDiagnostics::max_budget`].
    pub max_budget: u64,
    /// Exhausted budgets below this double; above it they grow by
    /// `budget_step`.
    pub budget_doubling_threshold: u64,
    pub budget_step: u64,
    pub slice_timeout: Duration,
    pub anticipation_wait: Duration,
    pub anticipation: bool,
    pub auto_max_budget: bool,
}

impl Default for BfqConfig {
    fn default() -> Self {
        BfqConfig {
            max_tag_queue_depth: 32,
            min_budget: 64 * KIB,
            max_budget: 512 * KIB,
            budget_doubling_threshold: 256 * KIB,
            budget_step: 32 * KIB,
            slice_timeout: Duration::from_millis(125),
            anticipation_wait: Duration::from_millis(10),
            anticipation: true,
            auto_max_budget: false,
        }
    }
}

impl BfqConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = *crate::env_tunables::BFQ_ANTICIPATION {
            config.anticipation = enabled;
        }
        if let Some(enabled) = *crate::env_tunables::BFQ_AUTO_MAX_BUDGET {
            config.auto_max_budget = enabled;
        }
        if let Some(bytes) = *crate::env_tunables::BFQ_MAX_BUDGET {
            config.max_budget = bytes;
        }
        config
    }
}

pub struct BudgetFairQueueingPolicy {
    config: BfqConfig,
    strategy: StrategyFactory,
}

impl BudgetFairQueueingPolicy {
    pub fn new(config: BfqConfig) -> Self {
        Self::with_strategy(
            config,
            Arc::new(|config: &BfqConfig| {
                Box::new(RoundRobinBudget::new(config)) as Box<dyn BudgetStrategy>
            }),
        )
    }

    /// Use `strategy` to build each attached disk's [`BudgetStrategy`].
    pub fn with_strategy(config: BfqConfig, strategy: StrategyFactory) -> Self {
        BudgetFairQueueingPolicy { config, strategy }
    }
}

impl Default for BudgetFairQueueingPolicy {
    fn default() -> Self {
        Self::new(BfqConfig::default())
    }
}

impl SchedulerPolicy for BudgetFairQueueingPolicy {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> PolicyVersion {
        PolicyVersion::new(1, 0)
    }

    fn attach(&self, core: &Arc<DiskCore>) -> Result<Arc<dyn DiskScheduler>> {
        let config = self.config.clone();
        let diagnostics = Arc::new(BfqDiagnostics::new(core.name(), &config));
        diagnostics::register(&diagnostics);
        let strategy = (self.strategy)(&config);
        let launched = actor::launch(core.name(), {
            let core = Arc::clone(core);
            let diagnostics = Arc::clone(&diagnostics);
            move |sender| StrategyHost::new(core, sender, config, diagnostics, strategy)
        });
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                diagnostics::unregister(&diagnostics);
                return Err(e);
            }
        };
        Ok(Arc::new(BfqDisk {
            sender: handle.sender,
            cancel: handle.cancel,
            done_rx: Mutex::new(Some(handle.done_rx)),
        }))
    }
}

struct BfqDisk {
    sender: ControlSender,
    cancel: CancellationToken,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl DiskScheduler for BfqDisk {
    fn submit(&self, core: &Arc<DiskCore>, client: Arc<ClientQueue>, request: Request) {
        if request.direction() == Direction::Flush {
            core.submit_raw(request);
            return;
        }
        trace!(client = %client.owner(), id = request.id(), "queueing");
        insert_read_priority(&mut client.lock_pending(), request);
        if self.sender.send(ControlMessage::Dequeue) == SendOutcome::Closed {
            // nobody will ever dequeue it
            client.cancel_pending();
        }
    }

    fn on_client_exit(&self, _core: &Arc<DiskCore>, client: Arc<ClientQueue>) {
        // the actor dispatches what is left; if it is gone the backlog is cancelled
        self.sender.send(ControlMessage::DestroyClient(client));
    }

    fn shutdown(&self, _core: &Arc<DiskCore>) -> BoxFuture<'static, ShutdownOutcome> {
        match self.done_rx.lock().unwrap().take() {
            Some(done_rx) => {
                self.cancel.cancel();
                self.sender.send(ControlMessage::Shutdown);
                await_ack(done_rx)
            }
            None => futures::future::ready(ShutdownOutcome::AlreadyDetached).boxed(),
        }
    }
}
