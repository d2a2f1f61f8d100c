use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{Direction, Disk, DiskCallback, Request, RequestId};

/// A request the disk has accepted but not completed yet.
pub(crate) struct PendingIo {
    request: Request,
    done: DiskCallback,
}

impl PendingIo {
    pub(crate) fn id(&self) -> RequestId {
        self.request.id()
    }

    pub(crate) fn complete(self, result: io::Result<()>) {
        (self.done)(self.request, result)
    }
}

/// Records what the scheduler hands it. Accepted requests stay pending until
/// the test completes them, unless the disk is in inline mode, in which case
/// `accept_async` completes them successfully before returning. Raw
/// submissions always complete immediately.
pub(crate) struct MockDisk {
    name: String,
    inline: AtomicBool,
    pending: Mutex<VecDeque<PendingIo>>,
    accepted: Mutex<Vec<(RequestId, Direction, u64)>>,
    raw: Mutex<Vec<RequestId>>,
}

impl MockDisk {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(MockDisk {
            name: name.to_owned(),
            inline: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            accepted: Mutex::new(Vec::new()),
            raw: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn inline(name: &str) -> Arc<Self> {
        let disk = Self::new(name);
        disk.set_inline(true);
        disk
    }

    pub(crate) fn set_inline(&self, inline: bool) {
        self.inline.store(inline, Ordering::Relaxed);
    }

    pub(crate) fn raw_count(&self) -> usize {
        self.raw.lock().unwrap().len()
    }

    /// Offsets of every request ever accepted, in acceptance order.
    pub(crate) fn accepted_offsets(&self) -> Vec<u64> {
        self.accepted.lock().unwrap().iter().map(|(_, _, o)| *o).collect()
    }

    pub(crate) fn accepted_count(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }

    /// Complete the oldest pending request. Returns false if none is pending.
    pub(crate) fn complete_next(&self, result: io::Result<()>) -> bool {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some(io) => {
                io.complete(result);
                true
            }
            None => false,
        }
    }

    /// Complete every pending request successfully, including any accepted
    /// while doing so.
    pub(crate) fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_next(Ok(())) {
            n += 1;
        }
        n
    }

    pub(crate) fn take_pending(&self) -> Vec<PendingIo> {
        self.pending.lock().unwrap().drain(..).collect()
    }
}

impl Disk for MockDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept_async(&self, request: Request, done: DiskCallback) {
        self.accepted
            .lock()
            .unwrap()
            .push((request.id(), request.direction(), request.offset()));
        if self.inline.load(Ordering::Relaxed) {
            done(request, Ok(()));
        } else {
            self.pending
                .lock()
                .unwrap()
                .push_back(PendingIo { request, done });
        }
    }

    fn submit_raw(&self, request: Request) {
        self.raw.lock().unwrap().push(request.id());
        request.complete(Ok(()));
    }
}
