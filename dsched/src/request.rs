use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::time::Instant;

use crate::{client::ClientQueue, ClientHandle, RequestError};

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
    Flush,
}

/// What the submitter's callback receives, exactly once per request.
#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub direction: Direction,
    pub offset: u64,
    pub length: u64,
    pub result: Result<(), RequestError>,
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One I/O operation.
///
/// Owned by the submitter until handed to [`crate::DiskContext::submit`];
/// from then on it lives in exactly one place: a [`ClientQueue`] backlog, the
/// [`crate::Disk`], or nowhere once its callback has run.
pub struct Request {
    id: RequestId,
    direction: Direction,
    offset: u64,
    length: u64,
    submitted_at: Instant,
    on_complete: Option<CompletionFn>,
    client: Option<Arc<ClientQueue>>,
}

impl Request {
    pub fn new<F>(direction: Direction, offset: u64, length: u64, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            offset,
            length,
            submitted_at: Instant::now(),
            on_complete: Some(Box::new(on_complete)),
            client: None,
        }
    }

    pub fn read<F>(offset: u64, length: u64, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self::new(Direction::Read, offset, length, on_complete)
    }

    pub fn write<F>(offset: u64, length: u64, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self::new(Direction::Write, offset, length, on_complete)
    }

    pub fn flush<F>(on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self::new(Direction::Flush, 0, 0, on_complete)
    }

    /// Attribute this request to a client queue.
    ///
    /// Requests without a client bypass the scheduler entirely.
    pub fn with_client(mut self, client: &ClientHandle) -> Self {
        self.client = Some(Arc::clone(client.queue()));
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Completion from a [`crate::Disk`] that took the request through
    /// [`crate::Disk::submit_raw`].
    pub fn complete(self, result: std::io::Result<()>) {
        self.finish(result.map_err(RequestError::Device));
    }

    pub(crate) fn stamp_submitted(&mut self) {
        self.submitted_at = Instant::now();
    }

    pub(crate) fn take_client(&mut self) -> Option<Arc<ClientQueue>> {
        self.client.take()
    }

    pub(crate) fn cancel(self) {
        self.finish(Err(RequestError::Cancelled));
    }

    pub(crate) fn finish(mut self, result: Result<(), RequestError>) {
        let on_complete = self
            .on_complete
            .take()
            .expect("on_complete is only taken here and in Drop");
        let completion = Completion {
            id: self.id,
            direction: self.direction,
            offset: self.offset,
            length: self.length,
            result,
        };
        drop(self);
        on_complete(completion);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            tracing::warn!(id = self.id, "request dropped without completion, reporting it cancelled");
            on_complete(Completion {
                id: self.id,
                direction: self.direction,
                offset: self.offset,
                length: self.length,
                result: Err(RequestError::Cancelled),
            });
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("client", &self.client.as_ref().map(|c| c.owner()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn dropped_request_reports_cancelled_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let req = Request::write(512, 4096, {
            let seen = Arc::clone(&seen);
            move |c| seen.lock().unwrap().push(c)
        });
        drop(req);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0].result, Err(RequestError::Cancelled)));
        assert_eq!(seen[0].offset, 512);
    }

    #[test]
    fn complete_forwards_device_error_verbatim() {
        let seen = Arc::new(Mutex::new(None));
        let req = Request::read(0, 512, {
            let seen = Arc::clone(&seen);
            move |c| *seen.lock().unwrap() = Some(c)
        });
        req.complete(Err(std::io::Error::from_raw_os_error(5)));
        let c = seen.lock().unwrap().take().unwrap();
        match c.result {
            Err(RequestError::Device(e)) => assert_eq!(e.raw_os_error(), Some(5)),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
