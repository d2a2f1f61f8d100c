//! Pluggable block-I/O scheduling.
//!
//! A [`DiskContext`] sits between a block consumer and a physical [`Disk`].
//! Submitters hand [`Request`]s to the context; the context's
//! [`SchedulerPolicy`] decides whether each request goes to the disk now or
//! waits in the submitter's [`ClientQueue`].
//!
//! # Usage
//!
//! 1. Build a [`Scheduler`] (or your own [`PolicyRegistry`]).
//! 2. Attach a [`Disk`] to get a [`DiskContext`].
//! 3. Register each submitting entity with [`DiskContext::on_client_attach`].
//! 4. Submit requests bound to the returned [`ClientHandle`]. The request's
//!    completion callback fires exactly once: on success, on device error,
//!    or when the request is cancelled.
//! 5. [`DiskContext::detach`] to tear the context down.
//!
//! ```rust
//! # use std::sync::Arc;
//! # struct NullDisk;
//! # impl dsched::Disk for NullDisk {
//! #     fn name(&self) -> &str { "null0" }
//! #     fn accept_async(&self, request: dsched::Request, done: dsched::DiskCallback) {
//! #         done(request, Ok(()))
//! #     }
//! #     fn submit_raw(&self, request: dsched::Request) { request.complete(Ok(())) }
//! # }
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let scheduler = dsched::Scheduler::new(dsched::SchedulerConfig::default());
//!     let ctx = scheduler.registry().attach("fq", Arc::new(NullDisk)).unwrap();
//!     let client = ctx.on_client_attach(dsched::ClientId(1)).unwrap();
//!
//!     let completion = ctx
//!         .submit_async(Some(&client), dsched::Direction::Read, 0, 4096)
//!         .await;
//!     assert!(completion.result.is_ok());
//!
//!     ctx.on_client_exit(client);
//!     ctx.detach().await;
//! }
//! ```
//!
//! # Policies
//!
//! - [`policy::noop`]: every request goes straight to [`Disk::submit_raw`].
//! - [`policy::fq`]: per-client rate limiting with latency and idle statistics.
//! - [`policy::bfq`]: budget fair queueing whose scheduling state is owned by a
//!   per-disk control actor thread.

mod client;
mod config;
mod context;
mod disk;
mod error;
pub mod metrics;
pub mod policy;
mod request;
mod scheduler;

#[cfg(test)]
pub(crate) mod test_util;

pub use client::{ClientHandle, ClientId, ClientQueue, ClientStats};
pub use config::SchedulerConfig;
pub use context::{DiskContext, DiskCore, WeakDiskContext};
pub use disk::{Disk, DiskCallback};
pub use error::{Error, RequestError, Result};
pub use policy::registry::PolicyRegistry;
pub use policy::{DiskScheduler, PolicyVersion, SchedulerPolicy, ShutdownOutcome};
pub use request::{Completion, CompletionFn, Direction, Request, RequestId};
pub use scheduler::Scheduler;

#[doc(hidden)]
pub mod env_tunables {
    use std::time::Duration;

    fn var(name: &str) -> Option<String> {
        match std::env::var(name) {
            Ok(v) => Some(v),
            Err(std::env::VarError::NotPresent) => None,
            Err(std::env::VarError::NotUnicode(_)) => {
                panic!("{name} must be a unicode string")
            }
        }
    }

    fn switch(name: &str) -> Option<bool> {
        var(name).map(|v| match v.as_str() {
            "1" => true,
            "0" => false,
            x => panic!("{name} must be 0 or 1, got {x:?}"),
        })
    }

    pub(crate) static POLICY_DEFAULT: once_cell::sync::Lazy<Option<String>> =
        once_cell::sync::Lazy::new(|| var("DSCHED_POLICY_DEFAULT"));
    pub(crate) static TEARDOWN_TIMEOUT: once_cell::sync::Lazy<Option<Duration>> =
        once_cell::sync::Lazy::new(|| {
            var("DSCHED_TEARDOWN_TIMEOUT").map(|v| {
                humantime::parse_duration(&v).unwrap_or_else(|e| {
                    panic!("DSCHED_TEARDOWN_TIMEOUT must be a duration like 1500ms: {e}")
                })
            })
        });
    pub(crate) static FQ_MAX_THROUGHPUT: once_cell::sync::Lazy<Option<u64>> =
        once_cell::sync::Lazy::new(|| {
            var("DSCHED_FQ_MAX_THROUGHPUT").map(|v| {
                v.parse()
                    .unwrap_or_else(|e| panic!("DSCHED_FQ_MAX_THROUGHPUT must be an integer: {e}"))
            })
        });
    pub(crate) static BFQ_ANTICIPATION: once_cell::sync::Lazy<Option<bool>> =
        once_cell::sync::Lazy::new(|| switch("DSCHED_BFQ_ANTICIPATION"));
    pub(crate) static BFQ_AUTO_MAX_BUDGET: once_cell::sync::Lazy<Option<bool>> =
        once_cell::sync::Lazy::new(|| switch("DSCHED_BFQ_AUTO_MAX_BUDGET"));
    pub(crate) static BFQ_MAX_BUDGET: once_cell::sync::Lazy<Option<u64>> =
        once_cell::sync::Lazy::new(|| {
            var("DSCHED_BFQ_MAX_BUDGET").map(|v| {
                v.parse()
                    .unwrap_or_else(|e| panic!("DSCHED_BFQ_MAX_BUDGET must be an integer: {e}"))
            })
        });

    /// Per-disk policy override, e.g. `DSCHED_POLICY_NVME0N1=bfq` for disk `nvme0n1`.
    pub(crate) fn policy_for_disk(disk_name: &str) -> Option<String> {
        var(&disk_policy_var(disk_name))
    }

    pub(crate) fn disk_policy_var(disk_name: &str) -> String {
        let suffix: String = disk_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("DSCHED_POLICY_{suffix}")
    }

    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("DSCHED_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "DSCHED_POLICY_DEFAULT"
                | "DSCHED_TEARDOWN_TIMEOUT"
                | "DSCHED_FQ_MAX_THROUGHPUT"
                | "DSCHED_BFQ_ANTICIPATION"
                | "DSCHED_BFQ_AUTO_MAX_BUDGET"
                | "DSCHED_BFQ_MAX_BUDGET" => {}
                x if x.starts_with("DSCHED_POLICY_") => {}
                x => panic!("env var starts with DSCHED_ but is not an env_tunable: {x:?}"),
            });
    }

    #[cfg(test)]
    mod tests {
        #[test]
        fn disk_policy_var_normalizes_name() {
            assert_eq!(super::disk_policy_var("nvme0n1"), "DSCHED_POLICY_NVME0N1");
            assert_eq!(
                super::disk_policy_var("mapper/root-vol"),
                "DSCHED_POLICY_MAPPER_ROOT_VOL"
            );
        }
    }
}
