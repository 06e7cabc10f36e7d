//! Per-provider monitor state and test-cycle composition
//!
//! A provider becomes monitored the first time a test cycle is planned
//! for it. The plan is the ordered three-stage pipeline; the candidate
//! rewrite stage is included only on that first cycle, when no monitor
//! row exists yet.

use edgeprobe_core::{Monitor, Result};
use edgeprobe_store::Store;
use std::fmt;
use tracing::debug;

/// One stage of the per-provider test cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStage {
    /// Rewrite candidate IP rows from the provider's ranges
    StoreProviderIps,
    /// Latency sweep with gated retention
    TcpingTest,
    /// Bandwidth measurement over the current best set
    CurlTest,
}

impl TestStage {
    /// The broker-facing job name
    pub fn job_name(&self) -> &'static str {
        match self {
            TestStage::StoreProviderIps => "store_provider_ips",
            TestStage::TcpingTest => "tcping_test",
            TestStage::CurlTest => "curl_test",
        }
    }
}

impl fmt::Display for TestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_name())
    }
}

/// Per-provider enable flag and stage composition
#[derive(Clone)]
pub struct ProviderMonitor {
    store: Store,
}

impl ProviderMonitor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Is scheduled probing switched on for the provider?
    ///
    /// Providers without a monitor row count as enabled; the row is
    /// created on their first planned cycle.
    pub async fn is_enabled(&self, provider_id: i64) -> Result<bool> {
        Ok(self
            .store
            .monitor_for_provider(provider_id)
            .await?
            .map(|monitor| monitor.enable)
            .unwrap_or(true))
    }

    /// Flip the enable flag on an enrolled provider
    pub async fn set_enabled(&self, provider_id: i64, enable: bool) -> Result<()> {
        self.store.set_monitor_enabled(provider_id, enable).await
    }

    /// The provider's monitor row, if enrolled
    pub async fn get(&self, provider_id: i64) -> Result<Option<Monitor>> {
        self.store.monitor_for_provider(provider_id).await
    }

    /// Plan the provider's next test cycle
    ///
    /// Enrolls the provider on first use; that first plan includes the
    /// candidate rewrite stage, later plans skip straight to probing.
    pub async fn plan_test_cycle(&self, provider_id: i64) -> Result<Vec<TestStage>> {
        let enrolled = self.store.monitor_for_provider(provider_id).await?.is_some();

        let mut stages = Vec::with_capacity(3);
        if !enrolled {
            debug!(
                "Provider {} not monitored yet; including candidate rewrite",
                provider_id
            );
            self.store.create_monitor(provider_id, true).await?;
            stages.push(TestStage::StoreProviderIps);
        }
        stages.push(TestStage::TcpingTest);
        stages.push(TestStage::CurlTest);
        Ok(stages)
    }
}
