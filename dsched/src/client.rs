//! Per (disk, submitting entity) scheduling state.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tracing::debug;

use crate::{metrics::GLOBAL_STORAGE, Direction, Request};

/// Identifies a submitting entity (thread, process, cgroup...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Backlog and counters of one client on one disk.
///
/// Shared between the submitting threads (through [`ClientHandle`]), the
/// disk's client registry, and every in-flight request's completion path.
/// Freed when the last of those lets go.
pub struct ClientQueue {
    owner: ClientId,
    disk_id: usize,
    pending: Mutex<VecDeque<Request>>,
    issued: AtomicU64,
    completed: AtomicU64,
    /// Maximum requests in flight; 0 means unlimited.
    max_throughput: AtomicU64,
    latency: Mutex<LatencyStats>,
    bytes_issued: AtomicU64,
    bytes_completed: AtomicU64,
    exited: AtomicBool,
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyStats {
    samples: u64,
    ewma: Duration,
}

/// Plain copy of a [`ClientQueue`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub owner: ClientId,
    pub pending: usize,
    pub issued: u64,
    pub completed: u64,
    pub max_throughput: u64,
    pub latency_ewma: Duration,
    pub bytes_issued: u64,
    pub bytes_completed: u64,
}

impl ClientQueue {
    pub(crate) fn new(owner: ClientId, disk_id: usize) -> Self {
        GLOBAL_STORAGE
            .clients_created
            .fetch_add(1, Ordering::Relaxed);
        ClientQueue {
            owner,
            disk_id,
            pending: Mutex::new(VecDeque::new()),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            max_throughput: AtomicU64::new(0),
            latency: Mutex::new(LatencyStats::default()),
            bytes_issued: AtomicU64::new(0),
            bytes_completed: AtomicU64::new(0),
            exited: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub(crate) fn disk_id(&self) -> usize {
        self.disk_id
    }

    /// Set once the queue has left its disk's client registry.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    /// Lock the backlog. Never call into the [`crate::Disk`] or a completion
    /// callback while holding the guard.
    pub fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Request>> {
        self.pending.lock().unwrap()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Length of the request at the head of the backlog.
    pub fn peek_front_length(&self) -> Option<u64> {
        self.lock_pending().front().map(Request::length)
    }

    pub fn pop_front(&self) -> Option<Request> {
        self.lock_pending().pop_front()
    }

    /// Append at the tail, no reordering.
    pub fn push_back(&self, request: Request) {
        self.lock_pending().push_back(request);
    }

    /// Take the whole backlog in queue order.
    pub fn drain_pending(&self) -> Vec<Request> {
        self.lock_pending().drain(..).collect()
    }

    /// Fail the whole backlog with [`crate::RequestError::Cancelled`].
    pub(crate) fn cancel_pending(&self) -> usize {
        let cancelled = self.drain_pending();
        let n = cancelled.len();
        for request in cancelled {
            request.cancel();
        }
        if n > 0 {
            GLOBAL_STORAGE
                .requests_cancelled
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Requests dispatched to the disk whose completion has not run yet.
    pub fn in_flight(&self) -> u64 {
        // completed is read first: it can only trail issued
        let completed = self.completed();
        let issued = self.issued();
        issued.saturating_sub(completed)
    }

    pub fn max_throughput(&self) -> u64 {
        self.max_throughput.load(Ordering::Relaxed)
    }

    pub fn set_max_throughput(&self, max: u64) {
        self.max_throughput.store(max, Ordering::Relaxed);
    }

    /// Rate-limit admission test.
    pub fn admits(&self) -> bool {
        let max = self.max_throughput();
        max == 0 || self.in_flight() < max
    }

    pub fn latency_ewma(&self) -> Duration {
        self.latency.lock().unwrap().ewma
    }

    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed.load(Ordering::Relaxed)
    }

    /// Account one request as handed to the disk. Must happen before the
    /// disk sees the request so a synchronous completion cannot overtake it.
    pub fn note_issued(&self, length: u64) {
        self.issued.fetch_add(1, Ordering::AcqRel);
        self.bytes_issued.fetch_add(length, Ordering::Relaxed);
    }

    /// `latency` is `None` for requests that failed on the device; those are
    /// counted as completed but do not feed the latency average.
    pub(crate) fn note_completed(&self, length: u64, latency: Option<Duration>) {
        if let Some(latency) = latency {
            let mut stats = self.latency.lock().unwrap();
            let n = u128::from(stats.samples);
            let ewma_ns = (n * stats.ewma.as_nanos() + latency.as_nanos()) / (n + 1);
            stats.ewma = Duration::from_nanos(u64::try_from(ewma_ns).unwrap_or(u64::MAX));
            stats.samples += 1;
            self.bytes_completed.fetch_add(length, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stats(&self) -> ClientStats {
        let completed = self.completed();
        ClientStats {
            owner: self.owner,
            pending: self.pending_len(),
            issued: self.issued(),
            completed,
            max_throughput: self.max_throughput(),
            latency_ewma: self.latency_ewma(),
            bytes_issued: self.bytes_issued.load(Ordering::Relaxed),
            bytes_completed: self.bytes_completed(),
        }
    }
}

/// Insert keeping reads ahead of writes and flushes. Reads stay FIFO among
/// themselves, as do the others.
pub(crate) fn insert_read_priority(queue: &mut VecDeque<Request>, request: Request) {
    if request.direction() == Direction::Read {
        let first_non_read = queue
            .iter()
            .position(|r| r.direction() != Direction::Read)
            .unwrap_or(queue.len());
        queue.insert(first_non_read, request);
    } else {
        queue.push_back(request);
    }
}

impl Drop for ClientQueue {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().map(|p| p.len()).unwrap_or(0);
        debug!(client = %self.owner, disk_id = self.disk_id, pending, "client queue destroyed");
        GLOBAL_STORAGE
            .clients_destroyed
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for ClientQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientQueue")
            .field("owner", &self.owner)
            .field("disk_id", &self.disk_id)
            .field("issued", &self.issued())
            .field("completed", &self.completed())
            .field("max_throughput", &self.max_throughput())
            .finish_non_exhaustive()
    }
}

/// The submitter's handle on its [`ClientQueue`], returned by
/// [`crate::DiskContext::on_client_attach`].
#[derive(Debug, Clone)]
pub struct ClientHandle(Arc<ClientQueue>);

impl ClientHandle {
    pub(crate) fn new(queue: Arc<ClientQueue>) -> Self {
        ClientHandle(queue)
    }

    pub(crate) fn queue(&self) -> &Arc<ClientQueue> {
        &self.0
    }

    pub(crate) fn into_queue(self) -> Arc<ClientQueue> {
        self.0
    }

    pub fn id(&self) -> ClientId {
        self.0.owner()
    }

    pub fn set_max_throughput(&self, max: u64) {
        self.0.set_max_throughput(max)
    }

    pub fn stats(&self) -> ClientStats {
        self.0.stats()
    }
}
