//! Batched latency probing with gated retention and early termination
//!
//! Candidates are processed in fixed-size batches of concurrent probes.
//! Each successful triple is checked against the provider's retention
//! gates; kept results are written through to the result store while an
//! atomic counter tracks how many have been stored. Once the counter
//! reaches the target no further batch starts, but probes already in
//! flight are allowed to finish. A progress event is published after
//! every batch and a terminal `completed` event at the end.

use crate::tcping::TcpingProber;
use edgeprobe_core::{LatencyStats, ProgressBus, ProgressEvent, Result, PROGRESS_CHANNEL};
use edgeprobe_store::ResultStore;
use futures::future::join_all;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed number of probes in flight within one batch
pub const BATCH_SIZE: usize = 20;

/// Retention gates for one latency run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyGates {
    /// Maximum acceptable mean latency, milliseconds
    pub max_avg: f64,
    /// Maximum acceptable loss ratio in `[0, 1]`
    pub max_loss: f64,
    /// Stop once this many results have been stored
    pub target_count: usize,
}

impl LatencyGates {
    /// Does a triple pass both gates?
    pub fn passes(&self, stats: &LatencyStats) -> bool {
        stats.avg_ms <= self.max_avg && stats.loss <= self.max_loss
    }
}

/// Which side of the gate gets stored
///
/// The intuitive polarity is [`GatePolicy::KeepPassing`] (pass ⇒ store);
/// the inverse exists because deployments disagreed historically and the
/// choice must stay explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatePolicy {
    #[default]
    KeepPassing,
    KeepFailing,
}

impl GatePolicy {
    fn keeps(&self, passed: bool) -> bool {
        match self {
            GatePolicy::KeepPassing => passed,
            GatePolicy::KeepFailing => !passed,
        }
    }
}

/// Counts from one finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Candidates actually probed (early stop may leave a tail untested)
    pub probed: usize,
    /// Results written through to the store
    pub stored: usize,
}

/// Drives batches of latency probes against a candidate list
#[derive(Clone)]
pub struct TcpingBatchRunner {
    prober: TcpingProber,
    results: ResultStore,
    bus: ProgressBus,
    batch_size: usize,
    policy: GatePolicy,
}

impl TcpingBatchRunner {
    pub fn new(prober: TcpingProber, results: ResultStore, bus: ProgressBus) -> Self {
        Self {
            prober,
            results,
            bus,
            batch_size: BATCH_SIZE,
            policy: GatePolicy::default(),
        }
    }

    /// Override the gate polarity
    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the batch width; probe runs keep the default of 20
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Probe `candidates` under `gates` until the target is met or the
    /// list is exhausted
    ///
    /// A single probe failure never fails the run; it is simply not
    /// stored. Storage errors are logged and absorbed per probe so one
    /// bad write cannot sink a batch.
    pub async fn run(&self, candidates: &[IpAddr], gates: &LatencyGates) -> Result<BatchOutcome> {
        let total = candidates.len();
        let stored = Arc::new(AtomicUsize::new(0));
        let mut probed = 0usize;

        info!(
            "Starting latency run over {} candidates (target {})",
            total, gates.target_count
        );

        for batch in candidates.chunks(self.batch_size) {
            if stored.load(Ordering::SeqCst) >= gates.target_count {
                debug!("Target met; not starting further batches");
                break;
            }

            let futures = batch.iter().map(|&ip| {
                let stored = Arc::clone(&stored);
                async move {
                    let Some(stats) = self.prober.probe(ip).await else {
                        return;
                    };
                    if !self.policy.keeps(gates.passes(&stats)) {
                        return;
                    }

                    // Claim a slot below the target before writing; probes
                    // that lose the race are dropped on the floor.
                    let claimed = stored
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                            (current < gates.target_count).then_some(current + 1)
                        })
                        .is_ok();
                    if !claimed {
                        return;
                    }

                    if let Err(e) = self.results.upsert_latency(ip, &stats).await {
                        warn!("Failed to store latency result for {}: {}", ip, e);
                        stored.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            });
            join_all(futures).await;

            probed += batch.len();
            self.bus.publish(
                PROGRESS_CHANNEL,
                ProgressEvent::in_progress(probed, total, "latency batch finished"),
            );
        }

        let stored = stored.load(Ordering::SeqCst);
        self.bus.publish(
            PROGRESS_CHANNEL,
            ProgressEvent::completed(probed, total, "latency run finished"),
        );
        info!("Latency run stored {}/{} candidates", stored, probed);

        Ok(BatchOutcome { probed, stored })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprobe_core::ProgressStatus;
    use edgeprobe_store::Store;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn fixture() -> (TempDir, ResultStore, ProgressBus) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db")).await.unwrap();
        (dir, store.results(), ProgressBus::new(100))
    }

    fn fast_prober(port: u16) -> TcpingProber {
        TcpingProber::new(port)
            .with_count(2)
            .with_interval(Duration::ZERO)
            .with_connect_timeout(Duration::from_millis(200))
    }

    fn open_gates(target: usize) -> LatencyGates {
        LatencyGates {
            max_avg: 10_000.0,
            max_loss: 1.0,
            target_count: target,
        }
    }

    #[tokio::test]
    async fn test_gate_passes() {
        let gates = LatencyGates {
            max_avg: 150.0,
            max_loss: 0.2,
            target_count: 30,
        };
        let good = LatencyStats {
            avg_ms: 100.0,
            std_ms: 1.0,
            loss: 0.1,
        };
        let slow = LatencyStats {
            avg_ms: 151.0,
            ..good
        };
        let lossy = LatencyStats { loss: 0.5, ..good };

        assert!(gates.passes(&good));
        assert!(!gates.passes(&slow));
        assert!(!gates.passes(&lossy));
    }

    #[tokio::test]
    async fn test_run_stores_passing_results() {
        let (_dir, results, bus) = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let runner = TcpingBatchRunner::new(fast_prober(port), results.clone(), bus);
        let candidates = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        let outcome = runner.run(&candidates, &open_gates(10)).await.unwrap();

        assert_eq!(outcome.probed, 1);
        assert_eq!(outcome.stored, 1);
        assert!(results
            .get(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_early_termination_stores_exactly_target() {
        let (_dir, results, bus) = fixture().await;
        // Wildcard bind so every 127.0.0.x alias reaches the listener
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Loopback aliases all reach the same listener, so every
        // candidate passes; the counter must still cap retention.
        let candidates: Vec<IpAddr> = (1..=12u8)
            .map(|i| IpAddr::V4(Ipv4Addr::new(127, 0, 0, i)))
            .collect();

        let runner =
            TcpingBatchRunner::new(fast_prober(port), results.clone(), bus).with_batch_size(4);
        let outcome = runner.run(&candidates, &open_gates(3)).await.unwrap();

        assert_eq!(outcome.stored, 3);
        // Target met inside the first batch; no later batch started
        assert_eq!(outcome.probed, 4);
        assert_eq!(results.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_probes_leave_no_rows() {
        let (_dir, results, bus) = fixture().await;
        // Bind then drop so connects are refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let runner = TcpingBatchRunner::new(fast_prober(port), results.clone(), bus);
        let candidates = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        let outcome = runner.run(&candidates, &open_gates(5)).await.unwrap();

        assert_eq!(outcome.probed, 1);
        assert_eq!(outcome.stored, 0);
        assert_eq!(results.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_gate_filters_results() {
        let (_dir, results, bus) = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Impossible gate: nothing has negative latency
        let gates = LatencyGates {
            max_avg: -1.0,
            max_loss: 0.0,
            target_count: 5,
        };
        let runner = TcpingBatchRunner::new(fast_prober(port), results.clone(), bus);
        let outcome = runner
            .run(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], &gates)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 0);
    }

    #[tokio::test]
    async fn test_keep_failing_policy_inverts_gate() {
        let (_dir, results, bus) = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let gates = LatencyGates {
            max_avg: -1.0,
            max_loss: 0.0,
            target_count: 5,
        };
        let runner = TcpingBatchRunner::new(fast_prober(port), results.clone(), bus)
            .with_policy(GatePolicy::KeepFailing);
        let outcome = runner
            .run(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], &gates)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 1);
    }

    #[tokio::test]
    async fn test_progress_events_published() {
        let (_dir, results, bus) = fixture().await;
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let runner =
            TcpingBatchRunner::new(fast_prober(port), results, bus.clone()).with_batch_size(2);
        let candidates: Vec<IpAddr> = (1..=4u8)
            .map(|i| IpAddr::V4(Ipv4Addr::new(127, 0, 0, i)))
            .collect();
        runner.run(&candidates, &open_gates(100)).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = bus.pull_next() {
            events.push(event);
        }

        // Two batch events plus the terminal one
        assert_eq!(events.len(), 3);
        assert!(events[..2]
            .iter()
            .all(|e| e.status == ProgressStatus::InProgress));
        let last = events.last().unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!(last.progress, 1.0);
        assert_eq!(last.processed, 4);
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let (_dir, results, bus) = fixture().await;
        let runner = TcpingBatchRunner::new(fast_prober(1), results, bus);
        let outcome = runner.run(&[], &open_gates(5)).await.unwrap();
        assert_eq!(outcome.probed, 0);
        assert_eq!(outcome.stored, 0);
    }
}
