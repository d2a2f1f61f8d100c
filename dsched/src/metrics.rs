use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub disks_attached: u64,
    pub disks_destroyed: u64,
    pub clients_created: u64,
    pub clients_destroyed: u64,
    /// Requests handed to `Disk::submit_raw`, for any reason.
    pub raw_submissions: u64,
    /// Requests submitted without a client queue on their disk.
    pub unassociated_submissions: u64,
    pub requests_cancelled: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) disks_attached: AtomicU64,
    pub(crate) disks_destroyed: AtomicU64,
    pub(crate) clients_created: AtomicU64,
    pub(crate) clients_destroyed: AtomicU64,
    pub(crate) raw_submissions: AtomicU64,
    pub(crate) unassociated_submissions: AtomicU64,
    pub(crate) requests_cancelled: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            disks_attached: AtomicU64::new(0),
            disks_destroyed: AtomicU64::new(0),
            clients_created: AtomicU64::new(0),
            clients_destroyed: AtomicU64::new(0),
            raw_submissions: AtomicU64::new(0),
            unassociated_submissions: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
        }
    }

    fn make_pub(&self) -> Metrics {
        Metrics {
            disks_attached: self.disks_attached.load(Ordering::Relaxed),
            disks_destroyed: self.disks_destroyed.load(Ordering::Relaxed),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            clients_destroyed: self.clients_destroyed.load(Ordering::Relaxed),
            raw_submissions: self.raw_submissions.load(Ordering::Relaxed),
            unassociated_submissions: self.unassociated_submissions.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}

#[cfg(test)]
mod tests {
    use super::global;
    use crate::{test_util::MockDisk, ClientId, PolicyRegistry, Request};

    // counters are process-global and other tests run concurrently, so only
    // lower bounds hold
    #[tokio::test]
    async fn bypass_and_cancellation_are_counted() {
        let before = global();
        let registry = PolicyRegistry::with_builtin_noop();
        let disk = MockDisk::new("metrics");
        let ctx = registry.attach("noop", disk.clone()).unwrap();
        let client = ctx.on_client_attach(ClientId(1)).unwrap();

        ctx.submit(Request::read(0, 512, |_| {}));
        ctx.submit(Request::write(512, 512, |_| {}).with_client(&client));
        for offset in 0..3 {
            client
                .queue()
                .push_back(Request::write(offset, 512, |_| {}));
        }
        assert_eq!(ctx.cancel_all(), 3);

        let after = global();
        assert!(after.unassociated_submissions >= before.unassociated_submissions + 1);
        assert!(after.raw_submissions >= before.raw_submissions + 2);
        assert!(after.requests_cancelled >= before.requests_cancelled + 3);
        assert!(after.disks_attached >= before.disks_attached + 1);
        assert!(after.clients_created >= before.clients_created + 1);
        assert_eq!(disk.raw_count(), 2);

        ctx.on_client_exit(client);
        ctx.detach().await;
    }
}
