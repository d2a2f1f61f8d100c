use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::{
    env_tunables,
    policy::{
        bfq::BudgetFairQueueingPolicy, fq::FairQueueingPolicy, noop, noop::NoopPolicy,
        registry::PolicyRegistry,
    },
    Disk, DiskContext, Error, Result, SchedulerConfig,
};

/// A [`PolicyRegistry`] holding the built-in policies, plus the rules for
/// picking one per disk.
pub struct Scheduler {
    registry: PolicyRegistry,
    config: SchedulerConfig,
    /// Starts as [`SchedulerConfig::default_policy`].
    default_policy: RwLock<Option<String>>,
    /// Consult `DSCHED_POLICY_<DISK>` at attach time.
    disk_env: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let registry = PolicyRegistry::new().with_teardown_timeout(config.teardown_timeout);
        let builtin: [Arc<dyn crate::SchedulerPolicy>; 3] = [
            Arc::new(NoopPolicy),
            Arc::new(FairQueueingPolicy::new(config.fq.clone())),
            Arc::new(BudgetFairQueueingPolicy::new(config.bfq.clone())),
        ];
        for policy in builtin {
            if let Err(e) = registry.register(policy) {
                unreachable!("fresh registry: {e}")
            }
        }
        Scheduler {
            registry,
            default_policy: RwLock::new(config.default_policy.clone()),
            config,
            disk_env: false,
        }
    }

    /// [`SchedulerConfig::from_env`], and per-disk policy overrides from the
    /// environment.
    pub fn from_env() -> Self {
        env_tunables::assert_no_unknown_env_vars();
        Scheduler {
            disk_env: true,
            ..Self::new(SchedulerConfig::from_env())
        }
    }

    /// Register additional policies here.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Policy for disks without a per-disk entry, if one is set.
    pub fn default_policy(&self) -> Option<String> {
        self.default_policy.read().unwrap().clone()
    }

    /// Change the policy later attaches use for disks without a per-disk
    /// entry. Disks already attached keep theirs; see [`Self::switch_policy`].
    pub fn set_default_policy(&self, name: &str) -> Result<()> {
        if self.registry.find(name).is_none() {
            return Err(Error::PolicyNotFound {
                name: name.to_owned(),
            });
        }
        info!(policy = %name, "default policy set");
        *self.default_policy.write().unwrap() = Some(name.to_owned());
        Ok(())
    }

    /// Name of the policy [`Self::attach_disk`] would pick for `disk`: the
    /// per-disk entry, then the default policy, then noop.
    pub fn policy_for(&self, disk: &str) -> String {
        let configured = self
            .disk_env
            .then(|| env_tunables::policy_for_disk(disk))
            .flatten()
            .or_else(|| self.config.disk_policies.get(disk).cloned())
            .or_else(|| self.default_policy())
            .unwrap_or_else(|| noop::NAME.to_owned());
        if self.registry.find(&configured).is_some() {
            return configured;
        }
        debug!(%disk, policy = %configured, "unknown policy, falling back to noop");
        noop::NAME.to_owned()
    }

    /// Attach `disk` to its configured policy.
    ///
    /// Fails only if the policy cannot allocate its per-disk resources; the
    /// caller can then submit to the disk unscheduled.
    pub fn attach_disk(&self, disk: Arc<dyn Disk>) -> Result<DiskContext> {
        let policy = self.policy_for(disk.name());
        info!(disk = %disk.name(), %policy, "attaching disk");
        self.registry.attach(&policy, disk)
    }

    /// Move an attached disk to the policy registered as `name`.
    pub async fn switch_policy(&self, ctx: &DiskContext, name: &str) -> Result<()> {
        ctx.switch_policy(&self.registry, name).await
    }
}
