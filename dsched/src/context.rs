//! Per-disk state shared by the framework and the attached policy.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    client::ClientQueue,
    metrics::GLOBAL_STORAGE,
    policy::{
        noop::{self, NoopScheduler},
        registry::PolicyRef,
        DiskScheduler, ShutdownOutcome,
    },
    ClientHandle, ClientId, Completion, Direction, Disk, Error, PolicyRegistry, Request,
    RequestError, Result,
};

static DISK_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct IdleState {
    idle: bool,
    since: Instant,
    accumulated: Duration,
}

/// The state every policy works against: the disk, its client registry and
/// the in-flight accounting.
///
/// Kept alive by the [`DiskContext`] handles, by the policy's background
/// task, and by every dispatched request until its completion has run.
pub struct DiskCore {
    id: usize,
    name: String,
    disk: Arc<dyn Disk>,
    clients: Mutex<HashMap<ClientId, Arc<ClientQueue>>>,
    /// Only changed with `idle` held, so the idle flag never disagrees with it.
    incomplete: AtomicUsize,
    idle: Mutex<IdleState>,
    detaching: AtomicBool,
    /// Submissions between the detaching check and the policy's `submit`.
    submitting: AtomicUsize,
    policy_ref: Mutex<Option<PolicyRef>>,
}

/// Held by a submission that passed the detaching check.
pub(crate) struct SubmitGuard<'a>(&'a DiskCore);

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.0.submitting.fetch_sub(1, Ordering::Release);
    }
}

impl DiskCore {
    pub(crate) fn new(disk: Arc<dyn Disk>, policy_ref: Option<PolicyRef>) -> Arc<Self> {
        let id = DISK_ID.fetch_add(1, Ordering::Relaxed);
        let name = disk.name().to_owned();
        GLOBAL_STORAGE.disks_attached.fetch_add(1, Ordering::Relaxed);
        Arc::new(DiskCore {
            id,
            name,
            disk,
            clients: Mutex::new(HashMap::new()),
            incomplete: AtomicUsize::new(0),
            idle: Mutex::new(IdleState {
                idle: true,
                since: Instant::now(),
                accumulated: Duration::ZERO,
            }),
            detaching: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            policy_ref: Mutex::new(policy_ref),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disk(&self) -> &Arc<dyn Disk> {
        &self.disk
    }

    /// Requests handed to [`Disk::accept_async`] whose completion has not run.
    pub fn incomplete_count(&self) -> usize {
        self.incomplete.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.lock().unwrap().idle
    }

    /// Total time spent idle, not counting the current idle period.
    pub fn idle_accumulated(&self) -> Duration {
        self.idle.lock().unwrap().accumulated
    }

    #[cfg(test)]
    fn idle_snapshot(&self) -> (bool, usize) {
        let idle = self.idle.lock().unwrap();
        (idle.idle, self.incomplete.load(Ordering::Acquire))
    }

    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_detaching(&self) {
        self.detaching.store(true, Ordering::SeqCst);
    }

    /// Undo [`Self::mark_detaching`] once a policy switch is complete.
    fn resume(&self) {
        self.detaching.store(false, Ordering::SeqCst);
    }

    /// `None` if the disk is detaching and the request must bypass the
    /// scheduler.
    pub(crate) fn enter_submit(&self) -> Option<SubmitGuard<'_>> {
        // pairs with the SeqCst load in quiesce()
        self.submitting.fetch_add(1, Ordering::SeqCst);
        let guard = SubmitGuard(self);
        (!self.is_detaching()).then_some(guard)
    }

    /// Wait until every submission that got past the detaching check before
    /// [`Self::mark_detaching`] has reached the policy.
    async fn quiesce(&self) {
        while self.submitting.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn replace_policy_ref(&self, policy_ref: Option<PolicyRef>) -> Option<PolicyRef> {
        std::mem::replace(&mut *self.policy_ref.lock().unwrap(), policy_ref)
    }

    pub fn client(&self, owner: ClientId) -> Option<Arc<ClientQueue>> {
        self.clients.lock().unwrap().get(&owner).cloned()
    }

    /// Registered clients in owner order.
    pub fn clients(&self) -> Vec<Arc<ClientQueue>> {
        let mut clients: Vec<_> = self.clients.lock().unwrap().values().cloned().collect();
        clients.sort_by_key(|c| c.owner());
        clients
    }

    pub(crate) fn register_client(&self, owner: ClientId) -> Result<Arc<ClientQueue>> {
        let mut clients = self.clients.lock().unwrap();
        if self.is_detaching() {
            return Err(Error::Detaching {
                disk: self.name.clone(),
            });
        }
        if let Some(existing) = clients.get(&owner) {
            return Ok(Arc::clone(existing));
        }
        clients
            .try_reserve(1)
            .map_err(|e| Error::allocation("client registry", e))?;
        let queue = Arc::new(ClientQueue::new(owner, self.id));
        clients.insert(owner, Arc::clone(&queue));
        debug!(disk = %self.name, client = %owner, "client attached");
        Ok(queue)
    }

    pub(crate) fn unregister_client(&self, owner: ClientId) -> Option<Arc<ClientQueue>> {
        self.clients.lock().unwrap().remove(&owner)
    }

    pub(crate) fn clear_clients(&self) -> usize {
        let drained: Vec<_> = self.clients.lock().unwrap().drain().collect();
        let n = drained.len();
        for (_, client) in drained {
            client.mark_exited();
        }
        n
    }

    /// Remove every queued request of every registered client and report it
    /// cancelled. Returns the number of requests cancelled.
    ///
    /// The requests are taken under the registry lock; their callbacks run
    /// after it is released, but before this function returns.
    pub fn cancel_pending(&self) -> usize {
        let cancelled: Vec<Request> = {
            let clients = self.clients.lock().unwrap();
            clients
                .values()
                .flat_map(|client| client.drain_pending())
                .collect()
        };
        let n = cancelled.len();
        for request in cancelled {
            request.cancel();
        }
        if n > 0 {
            GLOBAL_STORAGE
                .requests_cancelled
                .fetch_add(n as u64, Ordering::Relaxed);
            debug!(disk = %self.name, cancelled = n, "cancelled pending requests");
        }
        n
    }

    /// Unscheduled path.
    pub fn submit_raw(&self, request: Request) {
        GLOBAL_STORAGE.raw_submissions.fetch_add(1, Ordering::Relaxed);
        self.disk.submit_raw(request);
    }

    /// Hand `request` to the disk on behalf of `client`.
    pub fn dispatch(self: &Arc<Self>, client: &Arc<ClientQueue>, request: Request) {
        self.dispatch_then(client, request, |_| {})
    }

    /// Like [`Self::dispatch`], running `after` on the completion path once
    /// the statistics are updated and before the submitter's callback.
    pub fn dispatch_then<F>(self: &Arc<Self>, client: &Arc<ClientQueue>, request: Request, after: F)
    where
        F: FnOnce(&Arc<ClientQueue>) + Send + 'static,
    {
        // accounted before the disk sees the request: it may complete inline
        client.note_issued(request.length());
        self.dispatch_reserved(client, request, after)
    }

    /// Dispatch a request for which [`ClientQueue::note_issued`] was already
    /// called, typically under the client's pending lock.
    pub fn dispatch_reserved<F>(
        self: &Arc<Self>,
        client: &Arc<ClientQueue>,
        request: Request,
        after: F,
    ) where
        F: FnOnce(&Arc<ClientQueue>) + Send + 'static,
    {
        {
            let mut idle = self.idle.lock().unwrap();
            if idle.idle {
                let since = idle.since;
                idle.accumulated += Instant::now().saturating_duration_since(since);
                idle.idle = false;
            }
            self.incomplete.fetch_add(1, Ordering::AcqRel);
        }
        trace!(disk = %self.name, client = %client.owner(), id = request.id(), "dispatch");

        let core = Arc::clone(self);
        let client = Arc::clone(client);
        self.disk.accept_async(
            request,
            Box::new(move |request, result| {
                DiskCore::complete(core, client, request, result, after)
            }),
        );
    }

    fn complete<F>(
        core: Arc<DiskCore>,
        client: Arc<ClientQueue>,
        request: Request,
        result: std::io::Result<()>,
        after: F,
    ) where
        F: FnOnce(&Arc<ClientQueue>),
    {
        match &result {
            Ok(()) => {
                let now = Instant::now();
                {
                    let mut idle = core.idle.lock().unwrap();
                    let remaining = core.incomplete.fetch_sub(1, Ordering::AcqRel) - 1;
                    if remaining <= 1 && !idle.idle {
                        idle.idle = true;
                        idle.since = now;
                    }
                }
                let latency = now.saturating_duration_since(request.submitted_at());
                client.note_completed(request.length(), Some(latency));
            }
            Err(error) => {
                core.incomplete.fetch_sub(1, Ordering::AcqRel);
                debug!(disk = %core.name, client = %client.owner(), id = request.id(), %error, "request failed");
                client.note_completed(request.length(), None);
            }
        }
        after(&client);
        drop(client);
        drop(core);
        request.finish(result.map_err(RequestError::Device));
    }
}

impl Drop for DiskCore {
    fn drop(&mut self) {
        debug_assert_eq!(*self.incomplete.get_mut(), 0);
        info!(disk = %self.name, id = self.id, "disk context destroyed");
        GLOBAL_STORAGE.disks_destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for DiskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("incomplete", &self.incomplete_count())
            .field("detaching", &self.is_detaching())
            .finish_non_exhaustive()
    }
}

/// A disk with a scheduler policy attached.
///
/// Cheap to clone. Dropping the last clone without calling
/// [`DiskContext::detach`] still stops the policy's background task and
/// cancels queued requests, but does not wait for the task to finish.
#[derive(Clone)]
pub struct DiskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    core: Arc<DiskCore>,
    attached: RwLock<Attached>,
    /// Serializes [`DiskContext::switch_policy`] and [`DiskContext::detach`].
    lifecycle: tokio::sync::Mutex<()>,
    teardown_timeout: Duration,
    detached: AtomicBool,
}

#[derive(Clone)]
struct Attached {
    scheduler: Arc<dyn DiskScheduler>,
    policy: String,
}

impl Attached {
    fn unscheduled() -> Self {
        Attached {
            scheduler: Arc::new(NoopScheduler),
            policy: noop::NAME.to_owned(),
        }
    }
}

impl ContextInner {
    fn attached(&self) -> Attached {
        self.attached.read().unwrap().clone()
    }

    fn scheduler(&self) -> Arc<dyn DiskScheduler> {
        Arc::clone(&self.attached.read().unwrap().scheduler)
    }

    /// Shut `scheduler` down, waiting at most the teardown timeout.
    async fn stop(&self, scheduler: &Arc<dyn DiskScheduler>) -> ShutdownOutcome {
        let core = &self.core;
        let ack = scheduler.shutdown(core);
        let outcome = match tokio::time::timeout(self.teardown_timeout, ack).await {
            Ok(outcome) => outcome,
            Err(_) => ShutdownOutcome::TimedOut,
        };
        match outcome {
            ShutdownOutcome::Acknowledged | ShutdownOutcome::AlreadyDetached => {}
            ShutdownOutcome::TaskGone => {
                warn!(disk = %core.name(), "policy task ended without acknowledging shutdown")
            }
            ShutdownOutcome::TimedOut => warn!(
                disk = %core.name(),
                timeout = ?self.teardown_timeout,
                "policy task did not acknowledge shutdown in time, proceeding"
            ),
        }
        outcome
    }
}

impl DiskContext {
    pub(crate) fn new(
        core: Arc<DiskCore>,
        scheduler: Arc<dyn DiskScheduler>,
        policy: String,
        teardown_timeout: Duration,
    ) -> Self {
        info!(disk = %core.name(), %policy, "disk attached");
        DiskContext {
            inner: Arc::new(ContextInner {
                core,
                attached: RwLock::new(Attached { scheduler, policy }),
                lifecycle: tokio::sync::Mutex::new(()),
                teardown_timeout,
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub fn core(&self) -> &Arc<DiskCore> {
        &self.inner.core
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Name of the policy currently attached.
    pub fn policy_name(&self) -> String {
        self.inner.attached.read().unwrap().policy.clone()
    }

    pub fn incomplete_count(&self) -> usize {
        self.inner.core.incomplete_count()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.core.is_idle()
    }

    pub fn idle_accumulated(&self) -> Duration {
        self.inner.core.idle_accumulated()
    }

    pub fn downgrade(&self) -> WeakDiskContext {
        WeakDiskContext {
            core: Arc::downgrade(&self.inner.core),
        }
    }

    /// Submit a request. Never blocks and never fails: any outcome,
    /// including bypass of the scheduler, ends in the request's callback.
    pub fn submit(&self, mut request: Request) {
        request.stamp_submitted();
        let core = &self.inner.core;
        let client = request.take_client();
        let Some(_submitting) = core.enter_submit() else {
            trace!(disk = %core.name(), id = request.id(), "disk detaching, bypassing scheduler");
            core.submit_raw(request);
            return;
        };
        let client = match client {
            Some(client) if client.disk_id() == core.id() && !client.is_exited() => client,
            client => {
                trace!(
                    disk = %core.name(),
                    id = request.id(),
                    client = ?client.map(|c| c.owner()),
                    "no client queue on this disk, bypassing scheduler"
                );
                GLOBAL_STORAGE
                    .unassociated_submissions
                    .fetch_add(1, Ordering::Relaxed);
                core.submit_raw(request);
                return;
            }
        };
        self.inner.scheduler().submit(core, client, request);
    }

    /// [`Self::submit`] with the callback replaced by a future.
    pub fn submit_async(
        &self,
        client: Option<&ClientHandle>,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = Completion> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut request = Request::new(direction, offset, length, move |completion| {
            // receiver may be gone if the caller dropped the future
            let _ = tx.send(completion);
        });
        if let Some(client) = client {
            request = request.with_client(client);
        }
        let id = request.id();
        self.submit(request);
        async move {
            match rx.await {
                Ok(completion) => completion,
                Err(_) => Completion {
                    id,
                    direction,
                    offset,
                    length,
                    result: Err(RequestError::Cancelled),
                },
            }
        }
    }

    /// Policy flush hook, then `request` (if any) through the normal submit
    /// path.
    pub fn flush(&self, request: Option<Request>) {
        self.inner.scheduler().flush(&self.inner.core);
        if let Some(request) = request {
            self.submit(request);
        }
    }

    /// Fail every queued request with [`RequestError::Cancelled`]. Requests
    /// already on the disk are not recalled. Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        self.inner.scheduler().cancel_all(&self.inner.core)
    }

    /// Create (or look up) the client queue of `owner` on this disk.
    pub fn on_client_attach(&self, owner: ClientId) -> Result<ClientHandle> {
        let core = &self.inner.core;
        let queue = core.register_client(owner)?;
        if let Err(e) = self.inner.scheduler().on_client_attach(core, &queue) {
            core.unregister_client(owner);
            return Err(e);
        }
        Ok(ClientHandle::new(queue))
    }

    /// Remove the client from the registry and let the policy dispose of
    /// its backlog. The queue itself is freed once the last in-flight
    /// request referencing it has completed.
    pub fn on_client_exit(&self, client: ClientHandle) {
        let core = &self.inner.core;
        let queue = client.into_queue();
        if queue.disk_id() != core.id() {
            warn!(disk = %core.name(), client = %queue.owner(), "client exit on foreign disk ignored");
            return;
        }
        core.unregister_client(queue.owner());
        queue.mark_exited();
        debug!(disk = %core.name(), client = %queue.owner(), pending = queue.pending_len(), "client exit");
        self.inner.scheduler().on_client_exit(core, queue);
    }

    /// Tear the context down.
    ///
    /// Later submissions bypass the scheduler and later client attaches fail.
    /// The policy's background task is told to stop and awaited for at most
    /// the configured teardown timeout; teardown proceeds either way. Then
    /// queued requests are cancelled and the client registry is cleared.
    /// The underlying state is freed once the last in-flight request has
    /// completed.
    pub async fn detach(self) -> ShutdownOutcome {
        let inner = &self.inner;
        let core = &inner.core;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.detached.swap(true, Ordering::AcqRel) {
            debug!(disk = %core.name(), "already detached");
            return ShutdownOutcome::AlreadyDetached;
        }
        let Attached { scheduler, policy } = inner.attached();
        info!(disk = %core.name(), %policy, "detach start");
        scopeguard::defer_on_success! {info!(disk = %core.name(), "detach end")};
        scopeguard::defer_on_unwind! {tracing::error!(disk = %core.name(), "detach panic")};

        core.mark_detaching();
        core.quiesce().await;
        let outcome = inner.stop(&scheduler).await;
        let cancelled = scheduler.cancel_all(core);
        let clients = core.clear_clients();
        debug!(disk = %core.name(), cancelled, clients, incomplete = core.incomplete_count(), "detached");
        outcome
    }

    /// Replace the attached policy with the one registered as `name` in
    /// `registry`. Switching to the current policy does nothing.
    ///
    /// While the switch is in progress, submissions bypass the scheduler and
    /// client attaches fail with [`Error::Detaching`]. The old policy's task
    /// is stopped with the same bounded wait as [`Self::detach`]. Requests
    /// the old policy still had queued are handed to the new one in queue
    /// order, before later submissions. If the new policy cannot attach, the
    /// disk is left on the pass-through policy and the error is returned.
    pub async fn switch_policy(&self, registry: &PolicyRegistry, name: &str) -> Result<()> {
        let inner = &self.inner;
        let core = &inner.core;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.detached.load(Ordering::Acquire) {
            return Err(Error::Detaching {
                disk: core.name().to_owned(),
            });
        }
        let old = inner.attached();
        if old.policy == name {
            debug!(disk = %core.name(), policy = %name, "policy unchanged");
            return Ok(());
        }
        let (policy, policy_ref) = registry.resolve(name)?;
        info!(disk = %core.name(), from = %old.policy, to = %name, "switch start");
        scopeguard::defer_on_success! {info!(disk = %core.name(), "switch end")};
        scopeguard::defer_on_unwind! {tracing::error!(disk = %core.name(), "switch panic")};

        core.mark_detaching();
        core.quiesce().await;
        let outcome = inner.stop(&old.scheduler).await;
        drop(old);

        let (attached, policy_ref, result) = match policy.attach(core) {
            Ok(scheduler) => (
                Attached {
                    scheduler,
                    policy: policy.name().to_owned(),
                },
                Some(policy_ref),
                Ok(()),
            ),
            Err(e) => {
                warn!(disk = %core.name(), policy = %name, error = %e, "attach failed, disk left unscheduled");
                drop(policy_ref);
                let noop_ref = registry.resolve(noop::NAME).ok().map(|(_, r)| r);
                (Attached::unscheduled(), noop_ref, Err(e))
            }
        };
        let scheduler = Arc::clone(&attached.scheduler);
        let clients = core.clients();
        for client in &clients {
            if let Err(e) = scheduler.on_client_attach(core, client) {
                warn!(disk = %core.name(), client = %client.owner(), error = %e, "client setup failed under new policy");
            }
        }
        drop(core.replace_policy_ref(policy_ref));
        *inner.attached.write().unwrap() = attached;

        // still marked detaching: nothing can overtake the old backlog
        let mut requeued = 0;
        for client in clients {
            for request in client.drain_pending() {
                requeued += 1;
                scheduler.submit(core, Arc::clone(&client), request);
            }
        }
        core.resume();
        debug!(disk = %core.name(), ?outcome, requeued, "policy switched");
        result
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if *self.detached.get_mut() {
            return;
        }
        info!(disk = %self.core.name(), "disk context dropped without detach");
        self.core.mark_detaching();
        let scheduler = Arc::clone(&self.attached.get_mut().unwrap().scheduler);
        // initiates shutdown; nobody waits for the acknowledgement
        drop(scheduler.shutdown(&self.core));
        scheduler.cancel_all(&self.core);
        self.core.clear_clients();
    }
}

impl fmt::Debug for DiskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskContext")
            .field("core", &self.inner.core)
            .field("policy", &self.policy_name())
            .finish_non_exhaustive()
    }
}

/// Observes a [`DiskContext`]'s state without keeping it alive.
#[derive(Debug, Clone)]
pub struct WeakDiskContext {
    core: Weak<DiskCore>,
}

impl WeakDiskContext {
    /// Whether anything (a context handle, a policy task, an in-flight
    /// request) still keeps the disk state alive.
    pub fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<Arc<DiskCore>> {
        self.core.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use crate::{
        policy::{fq::FairQueueingPolicy, DiskScheduler, PolicyVersion, SchedulerPolicy},
        test_util::{init_tracing, record, record_into, MockDisk, Recorded},
        ClientId, Direction, DiskCore, Error, PolicyRegistry, Request, RequestError, Result,
        ShutdownOutcome,
    };

    #[tokio::test]
    async fn request_without_client_goes_raw() {
        let disk = MockDisk::new("sda");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let (seen, cb) = record();
        ctx.submit(Request::read(0, 512, cb));
        assert_eq!(disk.raw_count(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        ctx.detach().await;
    }

    #[tokio::test]
    async fn client_attach_is_idempotent_and_fails_while_detaching() {
        let disk = MockDisk::new("sdb");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk)
            .unwrap();
        let a = ctx.on_client_attach(ClientId(1)).unwrap();
        let b = ctx.on_client_attach(ClientId(1)).unwrap();
        assert!(Arc::ptr_eq(a.queue(), b.queue()));
        assert_eq!(ctx.core().clients().len(), 1);

        ctx.core().mark_detaching();
        assert!(matches!(
            ctx.on_client_attach(ClientId(2)),
            Err(Error::Detaching { .. })
        ));
        ctx.detach().await;
    }

    #[tokio::test]
    async fn submit_after_detach_bypasses_scheduler() {
        let disk = MockDisk::new("sdc");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let client = ctx.on_client_attach(ClientId(1)).unwrap();
        let ctx2 = ctx.clone();
        ctx.detach().await;

        let (seen, cb) = record();
        ctx2.submit(Request::write(0, 512, cb).with_client(&client));
        assert_eq!(disk.raw_count(), 1);
        assert!(seen.lock().unwrap()[0].result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_is_folded_on_dispatch() {
        let disk = MockDisk::new("sdd");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let core = Arc::clone(ctx.core());
        let client = core.register_client(ClientId(1)).unwrap();
        assert!(core.is_idle());

        tokio::time::advance(Duration::from_millis(5)).await;
        core.dispatch(&client, Request::read(0, 512, |_| {}));
        assert!(!core.is_idle());
        assert_eq!(core.idle_accumulated(), Duration::from_millis(5));

        // the last in-flight completion marks the disk idle again
        disk.complete_next(Ok(()));
        assert!(core.is_idle());

        tokio::time::advance(Duration::from_millis(7)).await;
        core.dispatch(&client, Request::read(512, 512, |_| {}));
        assert_eq!(core.idle_accumulated(), Duration::from_millis(12));
        disk.complete_next(Ok(()));
        ctx.detach().await;
    }

    #[tokio::test]
    async fn device_error_is_forwarded_and_counted() {
        let disk = MockDisk::new("sde");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let core = Arc::clone(ctx.core());
        let client = core.register_client(ClientId(1)).unwrap();
        let (seen, cb) = record();
        core.dispatch(&client, Request::new(Direction::Write, 0, 512, cb));
        disk.complete_next(Err(std::io::Error::from_raw_os_error(5)));

        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0].result, Err(RequestError::Device(e)) if e.raw_os_error() == Some(5)));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.latency_ewma(), Duration::ZERO);
        assert_eq!(core.incomplete_count(), 0);
        drop(seen);
        ctx.detach().await;
    }

    #[tokio::test]
    async fn weak_context_outlives_nothing() {
        let disk = MockDisk::new("sdf");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let weak = ctx.downgrade();
        let core = Arc::clone(ctx.core());
        let client = core.register_client(ClientId(1)).unwrap();
        core.dispatch(&client, Request::read(0, 512, |_| {}));
        drop(core);
        drop(client);
        ctx.detach().await;
        // the in-flight request keeps the state alive
        assert!(weak.is_alive());
        disk.complete_next(Ok(()));
        assert!(!weak.is_alive());
    }

    #[tokio::test]
    async fn cancel_pending_reports_every_queued_request() {
        let disk = MockDisk::new("sdg");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk)
            .unwrap();
        let core = Arc::clone(ctx.core());
        let client = core.register_client(ClientId(3)).unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let results = Arc::clone(&results);
            client.push_back(Request::write(i * 512, 512, move |c| {
                results.lock().unwrap().push(c.result)
            }));
        }
        assert_eq!(core.cancel_pending(), 3);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_cancelled())));
        assert_eq!(client.issued(), 0);
        drop(results);
        ctx.detach().await;
    }

    #[test]
    fn idle_flag_never_set_with_requests_in_flight() {
        let disk = MockDisk::new("sdh");
        let ctx = PolicyRegistry::with_builtin_noop()
            .attach("noop", disk.clone())
            .unwrap();
        let core = Arc::clone(ctx.core());
        let client = core.register_client(ClientId(1)).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        for offset in 0..2000 {
                            core.dispatch(&client, Request::read(offset, 512, |_| {}));
                            // completes this thread's request or another one's
                            assert!(disk.complete_next(Ok(())));
                        }
                    })
                })
                .collect();
            let checker = s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let (idle, incomplete) = core.idle_snapshot();
                    assert!(!idle || incomplete <= 1, "idle with {incomplete} in flight");
                }
            });
            for worker in workers {
                worker.join().unwrap();
            }
            done.store(true, Ordering::Relaxed);
            checker.join().unwrap();
        });

        assert_eq!(core.incomplete_count(), 0);
        assert!(core.is_idle());
        assert_eq!(client.in_flight(), 0);
    }

    fn fq_and_noop() -> PolicyRegistry {
        init_tracing();
        let registry = PolicyRegistry::with_builtin_noop();
        registry
            .register(Arc::new(FairQueueingPolicy::default()))
            .unwrap();
        registry
    }

    fn attached(registry: &PolicyRegistry, name: &str) -> usize {
        registry
            .policies()
            .into_iter()
            .find(|p| p.name == name)
            .map_or(0, |p| p.attached)
    }

    #[tokio::test]
    async fn switch_hands_queued_requests_to_the_new_policy() {
        let registry = fq_and_noop();
        let disk = MockDisk::new("sdi");
        let ctx = registry.attach("fq", disk.clone()).unwrap();
        let client = ctx.on_client_attach(ClientId(1)).unwrap();
        client.set_max_throughput(1);
        let seen: Recorded = Default::default();
        for offset in 1..=3 {
            ctx.submit(Request::write(offset, 512, record_into(&seen)).with_client(&client));
        }
        assert_eq!(disk.accepted_count(), 1);
        assert_eq!(client.stats().pending, 2);

        ctx.switch_policy(&registry, "noop").await.unwrap();
        assert_eq!(ctx.policy_name(), "noop");
        assert!(!ctx.core().is_detaching());
        assert_eq!(attached(&registry, "fq"), 0);
        assert_eq!(attached(&registry, "noop"), 1);

        // the backlog went out in queue order, the in-flight one is untouched
        assert_eq!(disk.raw_count(), 2);
        assert_eq!(client.stats().pending, 0);
        {
            let seen = seen.lock().unwrap();
            let offsets: Vec<_> = seen.iter().map(|c| c.offset).collect();
            assert_eq!(offsets, vec![2, 3]);
            assert!(seen.iter().all(|c| c.result.is_ok()));
        }
        disk.complete_next(Ok(()));
        assert_eq!(seen.lock().unwrap().len(), 3);

        // the client keeps working under the new policy
        ctx.submit(Request::write(4, 512, record_into(&seen)).with_client(&client));
        assert_eq!(disk.raw_count(), 3);

        ctx.on_client_exit(client);
        assert_eq!(ctx.detach().await, ShutdownOutcome::Acknowledged);
        assert_eq!(attached(&registry, "noop"), 0);
    }

    #[tokio::test]
    async fn switch_rejects_unknown_and_detached() {
        let registry = fq_and_noop();
        let ctx = registry.attach("fq", MockDisk::new("sdj")).unwrap();

        // same policy: nothing happens
        ctx.switch_policy(&registry, "fq").await.unwrap();
        assert_eq!(ctx.policy_name(), "fq");

        assert!(matches!(
            ctx.switch_policy(&registry, "cfq").await,
            Err(Error::PolicyNotFound { name }) if name == "cfq"
        ));
        assert_eq!(ctx.policy_name(), "fq");
        assert!(!ctx.core().is_detaching());
        assert_eq!(attached(&registry, "fq"), 1);

        let other = ctx.clone();
        assert_eq!(ctx.detach().await, ShutdownOutcome::Acknowledged);
        assert!(matches!(
            other.switch_policy(&registry, "noop").await,
            Err(Error::Detaching { .. })
        ));
    }

    struct Unattachable;

    impl SchedulerPolicy for Unattachable {
        fn name(&self) -> &str {
            "unattachable"
        }

        fn version(&self) -> PolicyVersion {
            PolicyVersion::new(0, 1)
        }

        fn attach(&self, _core: &Arc<DiskCore>) -> Result<Arc<dyn DiskScheduler>> {
            Err(Error::AllocationFailure {
                what: "test policy",
                source: None,
            })
        }
    }

    #[tokio::test]
    async fn failed_switch_leaves_the_disk_unscheduled() {
        let registry = fq_and_noop();
        registry.register(Arc::new(Unattachable)).unwrap();
        let disk = MockDisk::new("sdk");
        let ctx = registry.attach("fq", disk.clone()).unwrap();
        let client = ctx.on_client_attach(ClientId(1)).unwrap();

        assert!(matches!(
            ctx.switch_policy(&registry, "unattachable").await,
            Err(Error::AllocationFailure { .. })
        ));
        assert_eq!(ctx.policy_name(), "noop");
        assert_eq!(attached(&registry, "unattachable"), 0);
        assert_eq!(attached(&registry, "fq"), 0);
        assert_eq!(attached(&registry, "noop"), 1);

        let (seen, cb) = record();
        ctx.submit(Request::read(0, 512, cb).with_client(&client));
        assert_eq!(disk.raw_count(), 1);
        assert!(seen.lock().unwrap()[0].result.is_ok());

        ctx.on_client_exit(client);
        ctx.detach().await;
    }
}
