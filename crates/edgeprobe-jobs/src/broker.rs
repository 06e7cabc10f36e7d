//! Job broker abstraction
//!
//! The group runner only needs two operations from a broker: submit a
//! named job and poll its status. The external broker deployment is out
//! of scope here; [`LocalBroker`] implements the same contract
//! in-process by spawning registered handlers on the runtime, which
//! keeps the worker binary self-contained and the runner testable.
//!
//! Every job execution is wrapped in the hard [`JOB_TIMEOUT`]; a handler
//! overrunning it is marked `Failed`.

use async_trait::async_trait;
use dashmap::DashMap;
use edgeprobe_core::{Error, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Hard per-job execution budget
pub const JOB_TIMEOUT: Duration = Duration::from_secs(1200);

/// Lifecycle states a broker may report
///
/// `Queued`, `Deferred` and `InProgress` are transient; `Complete` and
/// `Failed` are terminal. Anything else a broker invents is treated as
/// unexpected by the group runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Deferred,
    InProgress,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Deferred => "deferred",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named job with JSON arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub args: serde_json::Value,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// What the group runner requires of a broker
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Hand a job to the broker; returns its id for status polling
    async fn submit(&self, spec: JobSpec) -> Result<String>;

    /// Current status of a submitted job
    async fn status(&self, id: &str) -> Result<JobStatus>;
}

type HandlerFuture = BoxFuture<'static, Result<()>>;
type JobHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// In-process broker running registered handlers on spawned tasks
///
/// Handlers are registered once at construction; submitting an
/// unregistered name yields a job that is terminally `Failed`.
pub struct LocalBroker {
    handlers: HashMap<String, JobHandler>,
    statuses: Arc<DashMap<String, JobStatus>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            statuses: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            timeout: JOB_TIMEOUT,
        }
    }

    /// Override the per-job execution budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a handler under a job name
    pub fn register<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(name.to_string(), Arc::new(move |args| Box::pin(handler(args))));
        self
    }

    /// Registered job names, for startup logging
    pub fn job_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for LocalBroker {
    async fn submit(&self, spec: JobSpec) -> Result<String> {
        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", spec.name, sequence);

        let Some(handler) = self.handlers.get(&spec.name) else {
            warn!("No handler registered for job '{}'", spec.name);
            self.statuses.insert(id.clone(), JobStatus::Failed);
            return Ok(id);
        };

        self.statuses.insert(id.clone(), JobStatus::Queued);

        let handler = Arc::clone(handler);
        let statuses = Arc::clone(&self.statuses);
        let timeout = self.timeout;
        let job_id = id.clone();
        let args = spec.args;

        tokio::spawn(async move {
            statuses.insert(job_id.clone(), JobStatus::InProgress);
            let status = match tokio::time::timeout(timeout, handler(args)).await {
                Ok(Ok(())) => {
                    debug!("Job {} completed", job_id);
                    JobStatus::Complete
                }
                Ok(Err(e)) => {
                    error!("Job {} failed: {}", job_id, e);
                    JobStatus::Failed
                }
                Err(_elapsed) => {
                    error!("Job {} exceeded the {:?} budget", job_id, timeout);
                    JobStatus::Failed
                }
            };
            statuses.insert(job_id, status);
        });

        Ok(id)
    }

    async fn status(&self, id: &str) -> Result<JobStatus> {
        self.statuses
            .get(id)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::UnexpectedJobStatus {
                job: id.to_string(),
                status: "not_found".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn wait_terminal(broker: &LocalBroker, id: &str) -> JobStatus {
        loop {
            let status = broker.status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let broker = LocalBroker::new().register("noop", |_args| async { Ok(()) });

        let id = broker
            .submit(JobSpec::new("noop", json!({})))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&broker, &id).await, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_handler_receives_args() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let broker = LocalBroker::new().register("echo", move |args| {
            let seen = Arc::clone(&seen_clone);
            async move {
                *seen.lock() = Some(args);
                Ok(())
            }
        });

        let id = broker
            .submit(JobSpec::new("echo", json!({"provider_id": 7})))
            .await
            .unwrap();
        wait_terminal(&broker, &id).await;
        assert_eq!(*seen.lock(), Some(json!({"provider_id": 7})));
    }

    #[tokio::test]
    async fn test_failing_handler_marks_failed() {
        let broker = LocalBroker::new().register("boom", |_args| async {
            Err(Error::Storage("query failed".to_string()))
        });

        let id = broker
            .submit(JobSpec::new("boom", json!({})))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&broker, &id).await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let broker = LocalBroker::new()
            .with_timeout(Duration::from_millis(20))
            .register("slow", |_args| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });

        let id = broker
            .submit(JobSpec::new("slow", json!({})))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&broker, &id).await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job_fails_terminally() {
        let broker = LocalBroker::new();
        let id = broker
            .submit(JobSpec::new("missing", json!({})))
            .await
            .unwrap();
        assert_eq!(broker.status(&id).await.unwrap(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_id_is_unexpected() {
        let broker = LocalBroker::new();
        assert!(matches!(
            broker.status("ghost-1").await,
            Err(Error::UnexpectedJobStatus { .. })
        ));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let broker = LocalBroker::new().register("noop", |_args| async { Ok(()) });
        let a = broker
            .submit(JobSpec::new("noop", json!({})))
            .await
            .unwrap();
        let b = broker
            .submit(JobSpec::new("noop", json!({})))
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Deferred.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
