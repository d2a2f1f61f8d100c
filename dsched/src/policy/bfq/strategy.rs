use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace};

use super::{
    actor::{ControlHandler, ControlMessage, ControlSender},
    diagnostics::{self, BfqDiagnostics},
    BfqConfig,
};
use crate::{client::ClientQueue, ClientId, DiskCore, Request};

/// Selection and anticipation logic of the BFQ policy.
///
/// Every method runs on the disk's control actor thread, one call at a time,
/// so implementations keep their state in plain fields.
pub trait BudgetStrategy: Send {
    /// Pick requests to hand to the disk. Called after every submission and
    /// every completion, with overlapping calls collapsed into one.
    fn dequeue(&mut self, cx: &mut StrategyCx<'_>);

    /// The anticipation armed with [`StrategyCx::arm_anticipation`] ran out
    /// without the client submitting again.
    fn anticipation_timeout(&mut self, cx: &mut StrategyCx<'_>);

    /// `client` left the disk. Its backlog is still queued and must be
    /// dispatched or cancelled here.
    fn destroy_client(&mut self, cx: &mut StrategyCx<'_>, client: Arc<ClientQueue>);
}

pub type StrategyFactory = Arc<dyn Fn(&BfqConfig) -> Box<dyn BudgetStrategy> + Send + Sync>;

struct Anticipation {
    client: ClientId,
    started: Instant,
    wait: Duration,
    timer: JoinHandle<()>,
}

/// Actor-owned state a strategy works against.
pub(super) struct ActorState {
    core: Arc<DiskCore>,
    sender: ControlSender,
    config: BfqConfig,
    diagnostics: Arc<BfqDiagnostics>,
    anticipation: Option<Anticipation>,
}

/// What a [`BudgetStrategy`] can see and do.
pub struct StrategyCx<'a> {
    state: &'a mut ActorState,
}

impl StrategyCx<'_> {
    pub fn core(&self) -> &Arc<DiskCore> {
        &self.state.core
    }

    pub fn config(&self) -> &BfqConfig {
        &self.state.config
    }

    /// Live counters and operator toggles of this disk.
    pub fn diagnostics(&self) -> &BfqDiagnostics {
        &self.state.diagnostics
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Registered clients with a non-empty backlog, in owner order.
    pub fn backlogged_clients(&self) -> Vec<Arc<ClientQueue>> {
        let mut clients = self.state.core.clients();
        clients.retain(|c| c.pending_len() > 0);
        clients
    }

    /// How many more requests the disk takes before its tag queue is full.
    pub fn free_slots(&self) -> usize {
        self.state
            .config
            .max_tag_queue_depth
            .saturating_sub(self.state.core.incomplete_count())
    }

    /// Hand `request` to the disk. Its completion requests another dequeue.
    pub fn dispatch(&mut self, client: &Arc<ClientQueue>, request: Request) {
        let sender = self.state.sender.clone();
        self.state.core.dispatch_then(client, request, move |_| {
            sender.send(ControlMessage::Dequeue);
        });
    }

    /// Run [`BudgetStrategy::dequeue`] again once the current call returns.
    pub fn request_dequeue(&mut self) {
        self.state.sender.send(ControlMessage::Dequeue);
    }

    /// Keep the disk for `client` for up to the configured anticipation wait.
    /// Replaces an anticipation already armed.
    pub fn arm_anticipation(&mut self, client: &ClientQueue) {
        self.disarm_anticipation();
        let wait = self.state.config.anticipation_wait;
        let sender = self.state.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            sender.send(ControlMessage::AnticipatoryTimeout);
        });
        trace!(client = %client.owner(), ?wait, "anticipating");
        self.state.anticipation = Some(Anticipation {
            client: client.owner(),
            started: Instant::now(),
            wait,
            timer,
        });
        self.state.diagnostics.set_anticipating(true);
    }

    /// The client anticipated for submitted again. Returns how long it took.
    pub fn anticipation_hit(&mut self) -> Option<Duration> {
        let anticipation = self.state.take_anticipation()?;
        let waited = anticipation.started.elapsed();
        trace!(client = %anticipation.client, ?waited, "anticipation hit");
        self.state.diagnostics.note_anticipation_wait(waited, false);
        Some(waited)
    }

    /// Drop the anticipation without recording a hit or a miss.
    pub fn disarm_anticipation(&mut self) {
        self.state.take_anticipation();
    }

    pub fn anticipating(&self) -> Option<ClientId> {
        self.state.anticipation.as_ref().map(|a| a.client)
    }
}

impl ActorState {
    fn take_anticipation(&mut self) -> Option<Anticipation> {
        let anticipation = self.anticipation.take()?;
        anticipation.timer.abort();
        self.diagnostics.set_anticipating(false);
        Some(anticipation)
    }
}

/// Runs a [`BudgetStrategy`] on the control actor.
pub(super) struct StrategyHost {
    state: ActorState,
    strategy: Box<dyn BudgetStrategy>,
}

impl StrategyHost {
    pub(super) fn new(
        core: Arc<DiskCore>,
        sender: ControlSender,
        config: BfqConfig,
        diagnostics: Arc<BfqDiagnostics>,
        strategy: Box<dyn BudgetStrategy>,
    ) -> Self {
        StrategyHost {
            state: ActorState {
                core,
                sender,
                config,
                diagnostics,
                anticipation: None,
            },
            strategy,
        }
    }
}

impl ControlHandler for StrategyHost {
    fn dequeue(&mut self) {
        self.strategy.dequeue(&mut StrategyCx {
            state: &mut self.state,
        });
    }

    fn anticipatory_timeout(&mut self) {
        let due = self
            .state
            .anticipation
            .as_ref()
            .map_or(false, |a| a.started.elapsed() >= a.wait);
        if !due {
            // the anticipation ended or was re-armed after this timer fired
            trace!("stale anticipation timeout");
            self.state.sender.send(ControlMessage::Dequeue);
            return;
        }
        if let Some(anticipation) = self.state.take_anticipation() {
            let waited = anticipation.started.elapsed();
            trace!(client = %anticipation.client, ?waited, "anticipation miss");
            self.state.diagnostics.note_anticipation_wait(waited, true);
        }
        self.strategy.anticipation_timeout(&mut StrategyCx {
            state: &mut self.state,
        });
    }

    fn destroy_client(&mut self, client: Arc<ClientQueue>) {
        debug!(client = %client.owner(), pending = client.pending_len(), "destroying client");
        if self
            .state
            .anticipation
            .as_ref()
            .map_or(false, |a| a.client == client.owner())
        {
            self.state.take_anticipation();
        }
        self.strategy.destroy_client(
            &mut StrategyCx {
                state: &mut self.state,
            },
            client,
        );
    }

    fn shutdown(&mut self) {
        self.state.take_anticipation();
        diagnostics::unregister(&self.state.diagnostics);
        debug!(
            incomplete = self.state.core.incomplete_count(),
            "released disk"
        );
    }
}
