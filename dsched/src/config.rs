use std::{collections::HashMap, time::Duration};

use crate::{
    env_tunables,
    policy::{bfq::BfqConfig, fq::FqConfig, noop, registry::DEFAULT_TEARDOWN_TIMEOUT},
};

/// Everything a [`crate::Scheduler`] is built from.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Policy for disks without an entry in `disk_policies`. `None` means
    /// [`noop`].
    pub default_policy: Option<String>,
    /// Policy name by disk name.
    pub disk_policies: HashMap<String, String>,
    pub teardown_timeout: Duration,
    pub fq: FqConfig,
    pub bfq: BfqConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            default_policy: None,
            disk_policies: HashMap::new(),
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            fq: FqConfig::default(),
            bfq: BfqConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Compiled-in defaults overlaid with the `DSCHED_*` environment.
    /// Per-disk `DSCHED_POLICY_<DISK>` overrides are read at attach time.
    pub fn from_env() -> Self {
        SchedulerConfig {
            default_policy: env_tunables::POLICY_DEFAULT.clone(),
            disk_policies: HashMap::new(),
            teardown_timeout: (*env_tunables::TEARDOWN_TIMEOUT).unwrap_or(DEFAULT_TEARDOWN_TIMEOUT),
            fq: FqConfig::from_env(),
            bfq: BfqConfig::from_env(),
        }
    }

    /// The policy name configured for `disk`: its own entry, then the
    /// default, then [`noop`].
    pub fn policy_for(&self, disk: &str) -> &str {
        self.disk_policies
            .get(disk)
            .or(self.default_policy.as_ref())
            .map_or(noop::NAME, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::SchedulerConfig;

    #[test]
    fn disk_entry_beats_default_beats_noop() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.policy_for("sda"), "noop");
        config.default_policy = Some("fq".to_owned());
        assert_eq!(config.policy_for("sda"), "fq");
        config
            .disk_policies
            .insert("sda".to_owned(), "bfq".to_owned());
        assert_eq!(config.policy_for("sda"), "bfq");
        assert_eq!(config.policy_for("sdb"), "fq");
    }
}
