use crate::Request;

/// Handed to [`Disk::accept_async`]; the disk calls it exactly once with the
/// request it was given and the outcome of the I/O.
pub type DiskCallback = Box<dyn FnOnce(Request, std::io::Result<()>) + Send + 'static>;

/// The physical device collaborator.
///
/// Implementations own the hardware submission path. The scheduler never
/// waits on them: [`Disk::accept_async`] must not block on the completion of
/// the request it is handed, and the callback may be invoked from any thread,
/// including the calling one.
pub trait Disk: Send + Sync + 'static {
    /// Stable name, used for policy selection, thread names and diagnostics.
    fn name(&self) -> &str;

    /// Start the request; report its outcome through `done`.
    fn accept_async(&self, request: Request, done: DiskCallback);

    /// Unscheduled path. The disk completes the request itself through
    /// [`Request::complete`].
    fn submit_raw(&self, request: Request);
}
