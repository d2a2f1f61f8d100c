use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tracing::{debug, error};

use super::{noop::NoopPolicy, PolicyVersion, SchedulerPolicy};
use crate::{Disk, DiskContext, DiskCore, Error, Result};

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_millis(1500);

/// Name-indexed table of [`SchedulerPolicy`]s.
pub struct PolicyRegistry {
    policies: Mutex<BTreeMap<String, Arc<PolicyEntry>>>,
    teardown_timeout: Duration,
}

struct PolicyEntry {
    policy: Arc<dyn SchedulerPolicy>,
    /// Live disk contexts attached through this entry.
    attached: AtomicUsize,
}

/// Held by a [`DiskCore`] for as long as it lives; keeps its policy from
/// being unregistered.
pub(crate) struct PolicyRef(Arc<PolicyEntry>);

impl PolicyRef {
    fn new(entry: &Arc<PolicyEntry>) -> Self {
        entry.attached.fetch_add(1, Ordering::AcqRel);
        PolicyRef(Arc::clone(entry))
    }
}

impl Drop for PolicyRef {
    fn drop(&mut self) {
        self.0.attached.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    pub name: String,
    pub version: PolicyVersion,
    pub attached: usize,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        PolicyRegistry {
            policies: Mutex::new(BTreeMap::new()),
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// A registry holding only the [`noop`](super::noop) policy.
    pub fn with_builtin_noop() -> Self {
        let registry = Self::new();
        if let Err(e) = registry.register(Arc::new(NoopPolicy)) {
            unreachable!("fresh registry: {e}")
        }
        registry
    }

    /// Upper bound on how long [`DiskContext::detach`] waits for a policy's
    /// background task.
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn teardown_timeout(&self) -> Duration {
        self.teardown_timeout
    }

    pub fn register(&self, policy: Arc<dyn SchedulerPolicy>) -> Result<()> {
        let mut policies = self.policies.lock().unwrap();
        let name = policy.name().to_owned();
        if policies.contains_key(&name) {
            error!(policy = %name, "policy already registered");
            return Err(Error::PolicyAlreadyRegistered { name });
        }
        debug!(policy = %name, version = %policy.version(), "policy registered");
        policies.insert(
            name,
            Arc::new(PolicyEntry {
                policy,
                attached: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    /// Remove a policy. Fails while a disk context created through it is
    /// still alive. Unknown names are not an error.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut policies = self.policies.lock().unwrap();
        if let Some(entry) = policies.get(name) {
            let attached = entry.attached.load(Ordering::Acquire);
            if attached > 0 {
                return Err(Error::PolicyBusy {
                    name: name.to_owned(),
                    attached,
                });
            }
            policies.remove(name);
            debug!(policy = %name, "policy unregistered");
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn SchedulerPolicy>> {
        self.policies
            .lock()
            .unwrap()
            .get(name)
            .map(|entry| Arc::clone(&entry.policy))
    }

    /// Registered policies in name order.
    pub fn policies(&self) -> Vec<PolicyInfo> {
        self.policies
            .lock()
            .unwrap()
            .values()
            .map(|entry| PolicyInfo {
                name: entry.policy.name().to_owned(),
                version: entry.policy.version(),
                attached: entry.attached.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Look up `name` and count one more disk against it.
    pub(crate) fn resolve(&self, name: &str) -> Result<(Arc<dyn SchedulerPolicy>, PolicyRef)> {
        let policies = self.policies.lock().unwrap();
        let entry = policies.get(name).ok_or_else(|| Error::PolicyNotFound {
            name: name.to_owned(),
        })?;
        Ok((Arc::clone(&entry.policy), PolicyRef::new(entry)))
    }

    /// Attach the policy called `name` to `disk`.
    pub fn attach(&self, name: &str, disk: Arc<dyn Disk>) -> Result<DiskContext> {
        let (policy, policy_ref) = self.resolve(name)?;
        let core = DiskCore::new(disk, Some(policy_ref));
        let scheduler = policy.attach(&core)?;
        Ok(DiskContext::new(
            core,
            scheduler,
            policy.name().to_owned(),
            self.teardown_timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::PolicyRegistry;
    use crate::{
        policy::{noop::NoopPolicy, PolicyVersion},
        test_util::MockDisk,
        Error,
    };

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = PolicyRegistry::with_builtin_noop();
        assert!(matches!(
            registry.register(Arc::new(NoopPolicy)),
            Err(Error::PolicyAlreadyRegistered { name }) if name == "noop"
        ));
        let policies = registry.policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].version, PolicyVersion::new(1, 0));
    }

    #[test]
    fn unknown_policy_is_not_found() {
        let registry = PolicyRegistry::new();
        assert!(registry.find("noop").is_none());
        assert!(matches!(
            registry.attach("noop", MockDisk::new("sda")),
            Err(Error::PolicyNotFound { .. })
        ));
        // unknown names unregister silently
        registry.unregister("nope").unwrap();
    }

    #[tokio::test]
    async fn attached_policy_cannot_be_unregistered() {
        let registry = PolicyRegistry::with_builtin_noop();
        let ctx = registry.attach("noop", MockDisk::new("sda")).unwrap();
        assert_eq!(registry.policies()[0].attached, 1);
        assert!(matches!(
            registry.unregister("noop"),
            Err(Error::PolicyBusy { attached: 1, .. })
        ));
        ctx.detach().await;
        registry.unregister("noop").unwrap();
        assert!(registry.policies().is_empty());
    }
}
