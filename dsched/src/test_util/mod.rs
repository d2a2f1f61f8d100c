use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::Completion;

mod mock_disk;

pub(crate) use mock_disk::MockDisk;

pub(crate) type Recorded = Arc<Mutex<Vec<Completion>>>;

/// A completion callback that appends to the returned list.
pub(crate) fn record() -> (Recorded, impl FnOnce(Completion) + Send + 'static) {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let cb = {
        let seen = Arc::clone(&seen);
        move |completion| seen.lock().unwrap().push(completion)
    };
    (seen, cb)
}

/// Like [`record`] but shares one list between many requests.
pub(crate) fn record_into(seen: &Recorded) -> impl FnOnce(Completion) + Send + 'static {
    let seen = Arc::clone(seen);
    move |completion| seen.lock().unwrap().push(completion)
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `done` on real time, for state changed by background threads that
/// run on their own clock.
pub(crate) async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
