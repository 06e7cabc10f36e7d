//! Serial-within-group, parallel-across-groups job orchestration
//!
//! Each named group holds a FIFO of job specs. Starting a group is
//! idempotent: while a runner is active for the group, further starts
//! are no-ops. The runner submits one job at a time to the broker and
//! polls its status roughly once a second until it completes; only then
//! is the next job dequeued, so job N's side effects are visible before
//! job N+1 begins. Distinct groups run on independent tasks.
//!
//! A status outside the transient set that is not `Complete` aborts the
//! group: its remaining queue is dropped and the error surfaces through
//! [`JobGroupRunner::join_group`]. Other groups are unaffected.

use crate::broker::{JobBroker, JobSpec, JobStatus};
use edgeprobe_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cadence of the status poll loop
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Orchestrates grouped jobs over a broker
pub struct JobGroupRunner {
    broker: Arc<dyn JobBroker>,
    groups: Mutex<HashMap<String, VecDeque<JobSpec>>>,
    running: Mutex<HashSet<String>>,
    handles: Mutex<HashMap<String, JoinHandle<Result<()>>>>,
    poll_interval: Duration,
}

impl JobGroupRunner {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self {
            broker,
            groups: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            handles: Mutex::new(HashMap::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the status-poll cadence
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Append a job to the group's FIFO
    pub fn enqueue_to_group(&self, group: &str, spec: JobSpec) {
        debug!("Enqueued {} to group {}", spec.name, group);
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .push_back(spec);
    }

    /// Jobs still waiting in the group's FIFO
    pub fn queued_len(&self, group: &str) -> usize {
        self.groups
            .lock()
            .get(group)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Is a runner currently active for the group?
    pub fn is_running(&self, group: &str) -> bool {
        self.running.lock().contains(group)
    }

    /// Start draining the group on its own task
    ///
    /// Idempotent: returns `false` without side effects when the group
    /// is already running. Exactly one runner instance exists per group
    /// at any time.
    pub fn start_group(self: &Arc<Self>, group: &str) -> bool {
        if !self.running.lock().insert(group.to_string()) {
            warn!("Group {} is already running", group);
            return false;
        }

        let this = Arc::clone(self);
        let group_name = group.to_string();
        let handle = tokio::spawn(async move {
            let result = this.run_group(&group_name).await;
            if let Err(e) = &result {
                error!("Group {} aborted: {}", group_name, e);
                // Jobs behind the failure never run
                this.groups.lock().remove(&group_name);
            }
            this.running.lock().remove(&group_name);
            result
        });

        self.handles.lock().insert(group.to_string(), handle);
        true
    }

    /// Await the group's active runner, surfacing its outcome
    ///
    /// Returns `Ok(())` when the group has no runner.
    pub async fn join_group(&self, group: &str) -> Result<()> {
        let handle = self.handles.lock().remove(group);
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Storage(format!("group task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    async fn run_group(&self, group: &str) -> Result<()> {
        info!("Group {} started", group);
        loop {
            let spec = self
                .groups
                .lock()
                .get_mut(group)
                .and_then(VecDeque::pop_front);
            let Some(spec) = spec else {
                break;
            };

            let job_name = spec.name.clone();
            let id = self.broker.submit(spec).await?;
            debug!("Group {}: submitted {} as {}", group, job_name, id);

            loop {
                match self.broker.status(&id).await? {
                    JobStatus::Complete => {
                        debug!("Group {}: {} complete", group, id);
                        break;
                    }
                    JobStatus::Queued | JobStatus::Deferred | JobStatus::InProgress => {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    other => {
                        return Err(Error::UnexpectedJobStatus {
                            job: job_name,
                            status: other.to_string(),
                        });
                    }
                }
            }
        }
        info!("Group {} drained", group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use serde_json::json;
    use std::time::Instant;

    fn fast_runner(broker: LocalBroker) -> Arc<JobGroupRunner> {
        Arc::new(
            JobGroupRunner::new(Arc::new(broker))
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    /// Broker whose jobs log (name, start, end) into a shared journal
    fn journaling_broker(
        names: &[&str],
        delay: Duration,
    ) -> (LocalBroker, Arc<Mutex<Vec<(String, Instant, Instant)>>>) {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut broker = LocalBroker::new();
        for &name in names {
            let journal = Arc::clone(&journal);
            let owned = name.to_string();
            broker = broker.register(name, move |_args| {
                let journal = Arc::clone(&journal);
                let owned = owned.clone();
                async move {
                    let started = Instant::now();
                    tokio::time::sleep(delay).await;
                    journal.lock().push((owned, started, Instant::now()));
                    Ok(())
                }
            });
        }
        (broker, journal)
    }

    #[tokio::test]
    async fn test_group_runs_serially_in_order() {
        let (broker, journal) = journaling_broker(&["a", "b", "c"], Duration::from_millis(30));
        let runner = fast_runner(broker);

        for name in ["a", "b", "c"] {
            runner.enqueue_to_group("testing", JobSpec::new(name, json!({})));
        }
        assert!(runner.start_group("testing"));
        runner.join_group("testing").await.unwrap();

        let journal = journal.lock();
        let order: Vec<&str> = journal.iter().map(|(name, _, _)| name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        // Job N+1 starts only after job N finished
        for pair in journal.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!(next_start >= prev_end);
        }
    }

    #[tokio::test]
    async fn test_start_group_is_idempotent() {
        let (broker, journal) = journaling_broker(&["only"], Duration::from_millis(50));
        let runner = fast_runner(broker);

        runner.enqueue_to_group("testing", JobSpec::new("only", json!({})));
        assert!(runner.start_group("testing"));
        // Second start while running is a no-op
        assert!(!runner.start_group("testing"));

        runner.join_group("testing").await.unwrap();
        assert_eq!(journal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_groups_run_in_parallel() {
        let (broker, _journal) = journaling_broker(&["sleep"], Duration::from_millis(120));
        let runner = fast_runner(broker);

        runner.enqueue_to_group("alpha", JobSpec::new("sleep", json!({})));
        runner.enqueue_to_group("beta", JobSpec::new("sleep", json!({})));

        let started = Instant::now();
        runner.start_group("alpha");
        runner.start_group("beta");
        runner.join_group("alpha").await.unwrap();
        runner.join_group("beta").await.unwrap();

        // Two 120 ms jobs overlapping finish well under the serial 240 ms
        assert!(started.elapsed() < Duration::from_millis(220));
    }

    #[tokio::test]
    async fn test_failed_job_aborts_group() {
        let ran_after = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran_after);
        let broker = LocalBroker::new()
            .register("boom", |_args| async {
                Err(Error::Storage("broken".to_string()))
            })
            .register("after", move |_args| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    *ran.lock() = true;
                    Ok(())
                }
            });
        let runner = fast_runner(broker);

        runner.enqueue_to_group("testing", JobSpec::new("boom", json!({})));
        runner.enqueue_to_group("testing", JobSpec::new("after", json!({})));
        runner.start_group("testing");

        let result = runner.join_group("testing").await;
        assert!(matches!(
            result,
            Err(Error::UnexpectedJobStatus { status, .. }) if status == "failed"
        ));
        // The job behind the failure never ran and the queue is dropped
        assert!(!*ran_after.lock());
        assert_eq!(runner.queued_len("testing"), 0);
    }

    #[tokio::test]
    async fn test_group_failure_leaves_other_groups_alone() {
        let (ok_broker, journal) = journaling_broker(&["fine"], Duration::from_millis(20));
        let broker = ok_broker.register("boom", |_args| async {
            Err(Error::Storage("broken".to_string()))
        });
        let runner = fast_runner(broker);

        runner.enqueue_to_group("bad", JobSpec::new("boom", json!({})));
        runner.enqueue_to_group("good", JobSpec::new("fine", json!({})));
        runner.start_group("bad");
        runner.start_group("good");

        assert!(runner.join_group("bad").await.is_err());
        runner.join_group("good").await.unwrap();
        assert_eq!(journal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_drain() {
        let (broker, journal) = journaling_broker(&["job"], Duration::from_millis(10));
        let runner = fast_runner(broker);

        runner.enqueue_to_group("testing", JobSpec::new("job", json!({})));
        runner.start_group("testing");
        runner.join_group("testing").await.unwrap();
        assert!(!runner.is_running("testing"));

        // A drained group can be started again with fresh work
        runner.enqueue_to_group("testing", JobSpec::new("job", json!({})));
        assert!(runner.start_group("testing"));
        runner.join_group("testing").await.unwrap();
        assert_eq!(journal.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_join_without_start_is_ok() {
        let runner = fast_runner(LocalBroker::new());
        runner.join_group("never-started").await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_len() {
        let runner = fast_runner(LocalBroker::new());
        assert_eq!(runner.queued_len("testing"), 0);
        runner.enqueue_to_group("testing", JobSpec::new("x", json!({})));
        runner.enqueue_to_group("testing", JobSpec::new("y", json!({})));
        assert_eq!(runner.queued_len("testing"), 2);
    }
}
