//! The default [`BudgetStrategy`]: one client at a time, each with a byte
//! budget that adapts to how the client used its last turn.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use super::{
    strategy::{BudgetStrategy, StrategyCx},
    BfqConfig,
};
use crate::{client::ClientQueue, ClientId};

/// Peak-rate samples needed before automatic budget sizing kicks in.
const PEAK_RATE_SAMPLES: u64 = 8;
/// Slices shorter than this say nothing about the disk's throughput.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// The next request did not fit in what was left of the budget.
    BudgetExhausted,
    /// The queue ran empty with nothing to anticipate.
    QueueEmpty,
    SliceTimeout,
    /// The anticipated request never came.
    TooIdle,
}

struct Slice {
    client: Arc<ClientQueue>,
    budget: u64,
    remaining: u64,
    started: Instant,
    bytes_completed_at_start: u64,
    anticipating: bool,
}

impl Slice {
    fn service(&self) -> u64 {
        self.budget - self.remaining
    }
}

/// Serves backlogged clients in owner order, one slice each.
///
/// A slice ends when the client's next request exceeds what is left of its
/// budget, when its queue runs empty (after anticipating, if enabled), or
/// after the slice timeout. The budget for the client's next slice depends
/// on which of those happened.
pub struct RoundRobinBudget {
    budgets: HashMap<ClientId, u64>,
    active: Option<Slice>,
    last_served: Option<ClientId>,
}

impl RoundRobinBudget {
    pub fn new(_config: &BfqConfig) -> Self {
        RoundRobinBudget {
            budgets: HashMap::new(),
            active: None,
            last_served: None,
        }
    }

    /// Start a slice for the backlogged client following the last one
    /// served. Returns false if nobody is backlogged.
    fn activate_next(&mut self, cx: &mut StrategyCx<'_>) -> bool {
        let backlogged = cx.backlogged_clients();
        let next = match self.last_served {
            Some(last) => backlogged
                .iter()
                .position(|c| c.owner() > last)
                .unwrap_or(0),
            None => 0,
        };
        let Some(client) = backlogged.into_iter().nth(next) else {
            return false;
        };
        let budget = *self
            .budgets
            .entry(client.owner())
            .or_insert(cx.config().min_budget);
        debug!(client = %client.owner(), budget, "slice start");
        self.active = Some(Slice {
            bytes_completed_at_start: client.bytes_completed(),
            client,
            budget,
            remaining: budget,
            started: cx.now(),
            anticipating: false,
        });
        true
    }

    fn expire(&mut self, cx: &mut StrategyCx<'_>, why: Expiry) {
        let Some(slice) = self.active.take() else {
            return;
        };
        if slice.anticipating {
            cx.disarm_anticipation();
        }
        let elapsed = cx.now().saturating_duration_since(slice.started);
        cx.diagnostics().note_time_slice(elapsed);
        sample_peak_rate(cx, &slice, elapsed);

        let budget = next_budget(
            cx.config(),
            cx.diagnostics().max_budget(),
            &slice,
            why,
        );
        let owner = slice.client.owner();
        debug!(client = %owner, ?why, service = slice.service(), ?elapsed, budget, "slice expired");
        self.budgets.insert(owner, budget);
        self.last_served = Some(owner);
    }
}

fn next_budget(config: &BfqConfig, max_budget: u64, slice: &Slice, why: Expiry) -> u64 {
    let min = config.min_budget;
    let budget = match why {
        Expiry::BudgetExhausted if slice.budget < config.budget_doubling_threshold => {
            slice.budget.saturating_mul(2)
        }
        Expiry::BudgetExhausted => slice.budget.saturating_add(config.budget_step),
        Expiry::QueueEmpty | Expiry::SliceTimeout => slice.service(),
        Expiry::TooIdle if slice.client.in_flight() > 0 => slice.service(),
        Expiry::TooIdle => min,
    };
    budget.min(max_budget).max(min)
}

/// Feed the bytes the slice completed per second into the peak-rate
/// estimate, and resize the max budget from it when enabled.
fn sample_peak_rate(cx: &StrategyCx<'_>, slice: &Slice, elapsed: Duration) {
    let completed = slice
        .client
        .bytes_completed()
        .saturating_sub(slice.bytes_completed_at_start);
    if completed == 0 || elapsed < MIN_SAMPLE_INTERVAL || elapsed > cx.config().slice_timeout {
        return;
    }
    let rate = u64::try_from(u128::from(completed) * 1_000_000 / elapsed.as_micros())
        .unwrap_or(u64::MAX);
    let (peak_rate, samples) = cx.diagnostics().note_peak_rate(rate, PEAK_RATE_SAMPLES);
    if cx.diagnostics().auto_max_budget() && samples == PEAK_RATE_SAMPLES {
        let max_budget = max_budget_for(peak_rate, cx.config().slice_timeout);
        if max_budget != cx.diagnostics().max_budget() {
            debug!(peak_rate, max_budget, "resized max budget");
            cx.diagnostics().set_max_budget(max_budget);
        }
    }
}

/// Bytes a disk serving `peak_rate` bytes per second completes in one slice.
fn max_budget_for(peak_rate: u64, slice_timeout: Duration) -> u64 {
    u64::try_from(u128::from(peak_rate) * slice_timeout.as_micros() / 1_000_000)
        .unwrap_or(u64::MAX)
}

impl BudgetStrategy for RoundRobinBudget {
    fn dequeue(&mut self, cx: &mut StrategyCx<'_>) {
        loop {
            let Some(slice) = self.active.as_mut() else {
                if self.activate_next(cx) {
                    continue;
                }
                return;
            };
            let client = Arc::clone(&slice.client);

            if slice.anticipating {
                if client.pending_len() == 0 {
                    return;
                }
                slice.anticipating = false;
                cx.anticipation_hit();
            }
            if cx.now().saturating_duration_since(slice.started) >= cx.config().slice_timeout {
                self.expire(cx, Expiry::SliceTimeout);
                continue;
            }

            let Some(length) = client.peek_front_length() else {
                if slice.remaining == 0 || !cx.diagnostics().anticipation() {
                    self.expire(cx, Expiry::QueueEmpty);
                    continue;
                }
                slice.anticipating = true;
                cx.arm_anticipation(&client);
                return;
            };
            if length > slice.remaining && slice.remaining != slice.budget {
                self.expire(cx, Expiry::BudgetExhausted);
                continue;
            }
            if cx.free_slots() == 0 {
                // a completion asks again
                return;
            }
            let Some(request) = client.pop_front() else {
                continue;
            };
            slice.remaining = slice.remaining.saturating_sub(request.length());
            cx.dispatch(&client, request);
        }
    }

    fn anticipation_timeout(&mut self, cx: &mut StrategyCx<'_>) {
        if let Some(slice) = self.active.as_mut() {
            slice.anticipating = false;
        }
        self.expire(cx, Expiry::TooIdle);
        self.dequeue(cx);
    }

    fn destroy_client(&mut self, cx: &mut StrategyCx<'_>, client: Arc<ClientQueue>) {
        if self
            .active
            .as_ref()
            .map_or(false, |s| Arc::ptr_eq(&s.client, &client))
        {
            self.active = None;
            self.last_served = Some(client.owner());
        }
        self.budgets.remove(&client.owner());
        // nobody is left to submit again, so the backlog goes out unthrottled
        for request in client.drain_pending() {
            cx.dispatch(&client, request);
        }
        cx.request_dequeue();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::Instant;

    use super::{max_budget_for, next_budget, Expiry, Slice};
    use crate::{client::ClientQueue, policy::bfq::BfqConfig, ClientId};

    const KIB: u64 = 1024;

    fn slice(budget: u64, remaining: u64) -> Slice {
        Slice {
            client: Arc::new(ClientQueue::new(ClientId(1), 0)),
            budget,
            remaining,
            started: Instant::now(),
            bytes_completed_at_start: 0,
            anticipating: false,
        }
    }

    #[test]
    fn exhausted_budget_doubles_then_steps_up_to_the_cap() {
        let config = BfqConfig::default();
        let max = config.max_budget;
        let grow = |budget| next_budget(&config, max, &slice(budget, 0), Expiry::BudgetExhausted);
        assert_eq!(grow(64 * KIB), 128 * KIB);
        assert_eq!(grow(128 * KIB), 256 * KIB);
        assert_eq!(grow(256 * KIB), 288 * KIB);
        assert_eq!(grow(500 * KIB), max);
    }

    #[test]
    fn budget_shrinks_to_the_service_received() {
        let config = BfqConfig::default();
        let max = config.max_budget;
        let s = slice(256 * KIB, 96 * KIB);
        assert_eq!(next_budget(&config, max, &s, Expiry::SliceTimeout), 160 * KIB);
        assert_eq!(next_budget(&config, max, &s, Expiry::QueueEmpty), 160 * KIB);
        // never below the minimum
        let s = slice(128 * KIB, 120 * KIB);
        assert_eq!(
            next_budget(&config, max, &s, Expiry::SliceTimeout),
            config.min_budget
        );
    }

    #[test]
    fn idle_client_drops_to_minimum_unless_still_busy() {
        let config = BfqConfig::default();
        let max = config.max_budget;
        let s = slice(256 * KIB, 0);
        assert_eq!(
            next_budget(&config, max, &s, Expiry::TooIdle),
            config.min_budget
        );
        s.client.note_issued(4 * KIB);
        assert_eq!(next_budget(&config, max, &s, Expiry::TooIdle), 256 * KIB);
    }

    #[test]
    fn max_budget_is_one_slice_at_peak_rate() {
        assert_eq!(
            max_budget_for(8 * 1024 * KIB, Duration::from_millis(125)),
            1024 * KIB
        );
    }
}
