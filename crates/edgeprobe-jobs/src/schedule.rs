//! Cron-bound periodic triggers
//!
//! The scheduler never executes probe work itself: on each firing it
//! enqueues the bound job for every monitored provider into the
//! `"testing"` group and starts the group. Execution order and status
//! polling stay with the [`crate::group::JobGroupRunner`].
//!
//! Bound schedule (second-resolution cron, local time):
//!
//! | job | expression |
//! |---|---|
//! | `tcping_test` | `0 0 9,12,15,18 * * *` |
//! | `tcping_test_monitor_list` | `0 30 8-18 * * *` |
//! | `curl_test` | `0 45 8-18 * * *` |

use crate::broker::JobSpec;
use crate::group::JobGroupRunner;
use crate::jobs::names;
use edgeprobe_core::{Error, Result};
use edgeprobe_store::Store;
use serde_json::json;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

/// The group scheduled probe work runs in
pub const TESTING_GROUP: &str = "testing";

/// One bound trigger
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEntry {
    pub job: &'static str,
    pub cron: &'static str,
}

/// The complete trigger table
pub const SCHEDULE: [ScheduleEntry; 3] = [
    ScheduleEntry {
        job: names::TCPING_TEST,
        cron: "0 0 9,12,15,18 * * *",
    },
    ScheduleEntry {
        job: names::TCPING_TEST_MONITOR_LIST,
        cron: "0 30 8-18 * * *",
    },
    ScheduleEntry {
        job: names::CURL_TEST,
        cron: "0 45 8-18 * * *",
    },
];

/// Periodic trigger wiring the schedule into the group runner
pub struct Scheduler {
    runner: Arc<JobGroupRunner>,
    store: Store,
}

impl Scheduler {
    pub fn new(runner: Arc<JobGroupRunner>, store: Store) -> Self {
        Self { runner, store }
    }

    /// Enqueue one schedule entry's job for every monitored provider
    ///
    /// Used by each cron firing, and directly by operators forcing a
    /// run out of schedule.
    pub async fn trigger(&self, job_name: &str) -> Result<()> {
        let providers = self.store.enabled_monitor_providers().await?;
        if providers.is_empty() {
            debug!("No monitored providers; {} not enqueued", job_name);
            return Ok(());
        }

        for provider_id in providers {
            self.runner.enqueue_to_group(
                TESTING_GROUP,
                JobSpec::new(job_name, json!({ "provider_id": provider_id })),
            );
        }
        self.runner.start_group(TESTING_GROUP);
        Ok(())
    }

    /// Install the trigger table and start the cron loop
    ///
    /// Returns the running scheduler handle; shut it down on exit.
    pub async fn start(&self) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Config(format!("failed to create scheduler: {}", e)))?;

        for entry in SCHEDULE {
            let runner = Arc::clone(&self.runner);
            let store = self.store.clone();

            let job = Job::new_async(entry.cron, move |_id, _scheduler| {
                let trigger = Scheduler {
                    runner: Arc::clone(&runner),
                    store: store.clone(),
                };
                Box::pin(async move {
                    if let Err(e) = trigger.trigger(entry.job).await {
                        error!("Scheduled trigger {} failed: {}", entry.job, e);
                    }
                })
            })
            .map_err(|e| {
                Error::Config(format!("invalid cron expression {}: {}", entry.cron, e))
            })?;

            scheduler
                .add(job)
                .await
                .map_err(|e| Error::Config(format!("failed to add {}: {}", entry.job, e)))?;
        }

        scheduler
            .start()
            .await
            .map_err(|e| Error::Config(format!("failed to start scheduler: {}", e)))?;

        info!("Schedule installed: {} triggers", SCHEDULE.len());
        Ok(scheduler)
    }
}
