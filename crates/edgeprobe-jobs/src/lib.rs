//! EdgeProbe Job Orchestration
//!
//! Control flow for the probe pipeline:
//!
//! - [`broker`]: the [`broker::JobBroker`] contract plus the in-process
//!   [`broker::LocalBroker`] with the hard per-job timeout
//! - [`group`]: serial-within-group, parallel-across-groups execution
//!   driven by a one-second status poll
//! - [`schedule`]: the cron trigger table feeding the `"testing"` group
//! - [`jobs`]: the job set composing each provider's test cycle

pub mod broker;
pub mod group;
pub mod jobs;
pub mod schedule;

pub use broker::{JobBroker, JobSpec, JobStatus, LocalBroker, JOB_TIMEOUT};
pub use group::{JobGroupRunner, POLL_INTERVAL};
pub use jobs::{names, register_jobs, start_testing, JobContext};
pub use schedule::{ScheduleEntry, Scheduler, SCHEDULE, TESTING_GROUP};
