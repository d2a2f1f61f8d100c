//! The per-disk control actor.
//!
//! One OS thread per disk runs a current-thread tokio runtime and executes
//! [`ControlMessage`]s one at a time against a [`ControlHandler`]. The
//! handler's state is therefore only ever touched from that thread.
//!
//! Messages sent while a handler is running on the actor's own thread are not
//! posted to the channel. They go to a thread-local inline queue that the
//! actor drains before it waits for the next message, so a handler can
//! trigger more work for its own actor without deadlocking and without
//! growing the channel.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace};

use crate::{client::ClientQueue, Error, Result};

static ACTOR_ID: AtomicUsize = AtomicUsize::new(0);

pub enum ControlMessage {
    /// Run the selection routine. Overlapping requests collapse into one.
    Dequeue,
    /// The anticipation timer fired.
    AnticipatoryTimeout,
    /// Tear down scheduling state of a client that left the disk.
    DestroyClient(Arc<ClientQueue>),
    Shutdown,
}

impl ControlMessage {
    /// Dispose of a message that will never be handled.
    fn discard(self) {
        if let ControlMessage::DestroyClient(client) = self {
            let cancelled = client.cancel_pending();
            if cancelled > 0 {
                debug!(client = %client.owner(), cancelled, "actor gone, cancelled backlog of exited client");
            }
        }
    }
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Dequeue => write!(f, "Dequeue"),
            ControlMessage::AnticipatoryTimeout => write!(f, "AnticipatoryTimeout"),
            ControlMessage::DestroyClient(c) => write!(f, "DestroyClient({})", c.owner()),
            ControlMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// What [`ControlSender::send`] did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on the actor's channel.
    Posted,
    /// Sent from inside the actor; runs before the actor waits again.
    Inline,
    /// A dequeue was already pending.
    Collapsed,
    /// The actor has stopped. The message was discarded.
    Closed,
}

struct InlineFrame {
    actor_id: usize,
    queue: VecDeque<ControlMessage>,
}

thread_local! {
    static INLINE: RefCell<Option<InlineFrame>> = RefCell::new(None);
}

/// Marks the current thread as executing a handler of actor `actor_id`.
struct InlineScope {
    actor_id: usize,
}

impl InlineScope {
    fn enter(actor_id: usize) -> Self {
        INLINE.with(|frame| {
            let prev = frame.borrow_mut().replace(InlineFrame {
                actor_id,
                queue: VecDeque::new(),
            });
            assert!(prev.is_none(), "actor handlers do not nest");
        });
        InlineScope { actor_id }
    }

    fn pop(&self) -> Option<ControlMessage> {
        INLINE.with(|frame| frame.borrow_mut().as_mut()?.queue.pop_front())
    }

    fn take_rest(self) -> Vec<ControlMessage> {
        INLINE.with(|frame| {
            frame
                .borrow_mut()
                .as_mut()
                .map(|f| f.queue.drain(..).collect())
                .unwrap_or_default()
        })
    }
}

impl Drop for InlineScope {
    fn drop(&mut self) {
        let frame = INLINE.with(|frame| frame.borrow_mut().take());
        debug_assert!(frame.map_or(true, |f| f.actor_id == self.actor_id));
    }
}

/// Try to queue `message` on the inline queue of `actor_id`. Gives the
/// message back if the current thread is not running that actor's handler.
fn push_inline(actor_id: usize, message: ControlMessage) -> Option<ControlMessage> {
    INLINE.with(|frame| match frame.borrow_mut().as_mut() {
        Some(f) if f.actor_id == actor_id => {
            f.queue.push_back(message);
            None
        }
        _ => Some(message),
    })
}

/// Cloneable, non-blocking sending side of a control actor.
#[derive(Clone)]
pub struct ControlSender {
    actor_id: usize,
    tx: mpsc::UnboundedSender<ControlMessage>,
    pending_dequeue: Arc<AtomicBool>,
    backlog: Arc<AtomicUsize>,
}

impl ControlSender {
    pub fn send(&self, message: ControlMessage) -> SendOutcome {
        if self.tx.is_closed() {
            message.discard();
            return SendOutcome::Closed;
        }
        if matches!(message, ControlMessage::Dequeue)
            && self
                .pending_dequeue
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            trace!(actor = self.actor_id, "dequeue already pending");
            return SendOutcome::Collapsed;
        }
        let message = match push_inline(self.actor_id, message) {
            None => return SendOutcome::Inline,
            Some(message) => message,
        };
        self.backlog.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(message) {
            Ok(()) => SendOutcome::Posted,
            Err(mpsc::error::SendError(message)) => {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                message.discard();
                SendOutcome::Closed
            }
        }
    }

    /// Messages posted to the channel and not yet received by the actor.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

/// The state an actor serializes access to.
pub(crate) trait ControlHandler: 'static {
    fn dequeue(&mut self);
    fn anticipatory_timeout(&mut self);
    fn destroy_client(&mut self, client: Arc<ClientQueue>);
    /// Last call; the handler is dropped right after.
    fn shutdown(&mut self) {}
}

pub(crate) struct ActorHandle {
    pub(crate) sender: ControlSender,
    pub(crate) cancel: CancellationToken,
    pub(crate) done_rx: oneshot::Receiver<()>,
}

/// Start the actor thread for `disk`. `make_handler` runs on the new thread.
pub(crate) fn launch<H, F>(disk: &str, make_handler: F) -> Result<ActorHandle>
where
    H: ControlHandler,
    F: FnOnce(ControlSender) -> H + Send + 'static,
{
    let actor_id = ACTOR_ID.fetch_add(1, Ordering::Relaxed);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::allocation("bfq actor runtime", e))?;
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = ControlSender {
        actor_id,
        tx,
        pending_dequeue: Arc::new(AtomicBool::new(false)),
        backlog: Arc::new(AtomicUsize::new(0)),
    };
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = oneshot::channel();
    let disk = disk.to_owned();
    std::thread::Builder::new()
        .name(format!("{}-bfq-actor", disk))
        .spawn({
            let sender = sender.clone();
            let cancel = cancel.clone();
            move || {
                let span = info_span!("bfq_actor", disk = %disk, actor = actor_id);
                let _entered = span.enter(); // safe to use here because we use new_current_thread
                info!("actor thread running");
                let mut rx = rx;
                rt.block_on(async {
                    let mut handler = make_handler(sender.clone());
                    let leftover = run(&mut handler, &mut rx, &sender, &cancel).await;

                    info!("actor shutdown start");
                    scopeguard::defer_on_success! {info!("actor shutdown end")};
                    scopeguard::defer_on_unwind! {tracing::error!("actor shutdown panic")};
                    rx.close();
                    // a dequeue left in the channel must not make later sends collapse
                    sender.pending_dequeue.store(false, Ordering::Release);
                    let mut discarded = leftover.len();
                    for message in leftover {
                        message.discard();
                    }
                    while let Ok(message) = rx.try_recv() {
                        discarded += 1;
                        message.discard();
                    }
                    debug!(discarded, "discarded unhandled messages");
                    handler.shutdown();
                    drop(handler);
                });
                // runtime drop aborts a pending anticipation timer
                drop(rt);
                // interest may be gone if the context was dropped without detach
                let _ = done_tx.send(());
            }
        })
        .map_err(|e| Error::allocation("bfq actor thread", e))?;
    Ok(ActorHandle {
        sender,
        cancel,
        done_rx,
    })
}

/// Returns the inline messages left over when a shutdown was handled.
async fn run<H: ControlHandler>(
    handler: &mut H,
    rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
    sender: &ControlSender,
    cancel: &CancellationToken,
) -> Vec<ControlMessage> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled");
                return Vec::new();
            }
            message = rx.recv() => match message {
                Some(message) => message,
                None => return Vec::new(),
            },
        };
        sender.backlog.fetch_sub(1, Ordering::AcqRel);
        if let Some(leftover) = process(handler, sender, message) {
            return leftover;
        }
    }
}

/// Handle `first` and everything it sends inline. Returns `Some` if a
/// shutdown message was handled.
fn process<H: ControlHandler>(
    handler: &mut H,
    sender: &ControlSender,
    first: ControlMessage,
) -> Option<Vec<ControlMessage>> {
    let scope = InlineScope::enter(sender.actor_id);
    let mut next = Some(first);
    while let Some(message) = next {
        trace!(?message, backlog = sender.backlog(), "handling");
        match message {
            ControlMessage::Dequeue => {
                sender.pending_dequeue.store(false, Ordering::Release);
                handler.dequeue();
            }
            ControlMessage::AnticipatoryTimeout => handler.anticipatory_timeout(),
            ControlMessage::DestroyClient(client) => handler.destroy_client(client),
            ControlMessage::Shutdown => {
                debug!("shutdown message");
                return Some(scope.take_rest());
            }
        }
        next = scope.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread::ThreadId,
        time::Duration,
    };

    use super::{launch, ControlHandler, ControlMessage, ControlSender, SendOutcome};
    use crate::{client::ClientQueue, test_util::init_tracing, ClientId, Request};

    #[derive(Default)]
    struct Log {
        events: Vec<&'static str>,
        outcomes: Vec<SendOutcome>,
        threads: Vec<ThreadId>,
        backlog_seen: Vec<usize>,
    }

    struct Recorder {
        sender: ControlSender,
        log: Arc<Mutex<Log>>,
        resend: usize,
    }

    impl ControlHandler for Recorder {
        fn dequeue(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.events.push("dequeue");
            log.threads.push(std::thread::current().id());
            log.backlog_seen.push(self.sender.backlog());
            if self.resend > 0 {
                self.resend -= 1;
                drop(log);
                let first = self.sender.send(ControlMessage::Dequeue);
                // a second one before the first ran collapses
                let second = self.sender.send(ControlMessage::Dequeue);
                let timeout = self.sender.send(ControlMessage::AnticipatoryTimeout);
                let mut log = self.log.lock().unwrap();
                log.outcomes.extend([first, second, timeout]);
            }
        }

        fn anticipatory_timeout(&mut self) {
            self.log.lock().unwrap().events.push("timeout");
        }

        fn destroy_client(&mut self, client: Arc<ClientQueue>) {
            self.log.lock().unwrap().events.push("destroy");
            drop(client);
        }

        fn shutdown(&mut self) {
            self.log.lock().unwrap().events.push("shutdown");
        }
    }

    #[tokio::test]
    async fn send_from_handler_runs_inline_without_deadlock() {
        init_tracing();
        let log = Arc::new(Mutex::new(Log::default()));
        let handle = launch("actor-inline", {
            let log = Arc::clone(&log);
            move |sender| Recorder {
                sender,
                log,
                resend: 3,
            }
        })
        .unwrap();

        assert_eq!(handle.sender.send(ControlMessage::Dequeue), SendOutcome::Posted);
        handle.sender.send(ControlMessage::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), handle.done_rx)
            .await
            .unwrap()
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.events,
            vec![
                "dequeue", "dequeue", "timeout", "dequeue", "timeout", "dequeue", "timeout",
                "shutdown"
            ]
        );
        assert_eq!(
            log.outcomes,
            [SendOutcome::Inline, SendOutcome::Collapsed, SendOutcome::Inline].repeat(3)
        );
        // every handler ran on the one actor thread; only the shutdown was
        // ever waiting in the channel
        assert!(log.threads.windows(2).all(|w| w[0] == w[1]));
        assert_ne!(log.threads[0], std::thread::current().id());
        assert!(log.backlog_seen.iter().all(|&b| b <= 1));
    }

    #[tokio::test]
    async fn overlapping_dequeues_collapse() {
        init_tracing();
        let log = Arc::new(Mutex::new(Log::default()));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let handle = launch("actor-collapse", {
            let log = Arc::clone(&log);
            let gate = Arc::clone(&gate);
            move |sender| {
                // keep the actor from receiving until the test has sent
                drop(gate.lock().unwrap());
                Recorder {
                    sender,
                    log,
                    resend: 0,
                }
            }
        })
        .unwrap();
        let outcomes: Vec<_> = (0..5)
            .map(|_| handle.sender.send(ControlMessage::Dequeue))
            .collect();
        assert_eq!(outcomes[0], SendOutcome::Posted);
        assert!(outcomes[1..].iter().all(|o| *o == SendOutcome::Collapsed));
        drop(held);

        handle.sender.send(ControlMessage::Shutdown);
        handle.done_rx.await.unwrap();
        assert_eq!(log.lock().unwrap().events, vec!["dequeue", "shutdown"]);
        assert_eq!(handle.sender.send(ControlMessage::Dequeue), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn cancellation_discards_queued_client_teardown() {
        init_tracing();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let handle = launch("actor-cancel", {
            let log = Arc::clone(&log);
            let gate = Arc::clone(&gate);
            move |sender| {
                drop(gate.lock().unwrap());
                Recorder {
                    sender,
                    log,
                    resend: 0,
                }
            }
        })
        .unwrap();

        let client = Arc::new(ClientQueue::new(ClientId(4), usize::MAX));
        let (seen, cb) = crate::test_util::record();
        client.push_back(Request::read(0, 512, cb));
        handle.cancel.cancel();
        handle
            .sender
            .send(ControlMessage::DestroyClient(Arc::clone(&client)));
        drop(held);
        handle.done_rx.await.unwrap();

        assert_eq!(log.lock().unwrap().events, vec!["shutdown"]);
        assert_eq!(client.pending_len(), 0);
        assert!(seen.lock().unwrap()[0].result.as_ref().unwrap_err().is_cancelled());
    }
}
