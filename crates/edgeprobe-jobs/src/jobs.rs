//! The probe job set
//!
//! Four jobs compose every test cycle:
//!
//! - `store_provider_ips`: rewrite the provider's candidate rows from
//!   its current ranges
//! - `tcping_test`: full latency sweep over the candidate pool with
//!   gated retention
//! - `tcping_test_monitor_list`: re-test the current best set, dropping
//!   stale rows and refilling from the pool when the set ran short
//! - `curl_test`: bandwidth-test the top-ranked IPs, record the failure
//!   sentinel under the speed gate, then sweep sentinel rows
//!
//! Handlers take their parameters from the per-provider config blob;
//! disabled stages return early without touching the store.

use crate::broker::{JobSpec, LocalBroker};
use crate::group::JobGroupRunner;
use crate::schedule::TESTING_GROUP;
use edgeprobe_core::{Error, IpType, ProgressBus, Result, TcpingConfig, SPEED_FAILED};
use edgeprobe_prober::{
    DownloadProber, LatencyGates, ProviderMonitor, RangeExpander, TcpingBatchRunner, TcpingProber,
};
use edgeprobe_store::{ResultStore, Store};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Broker-facing job names
pub mod names {
    pub const STORE_PROVIDER_IPS: &str = "store_provider_ips";
    pub const TCPING_TEST: &str = "tcping_test";
    pub const TCPING_TEST_MONITOR_LIST: &str = "tcping_test_monitor_list";
    pub const CURL_TEST: &str = "curl_test";
}

/// Shared dependencies of every job handler
#[derive(Clone)]
pub struct JobContext {
    pub store: Store,
    pub results: ResultStore,
    pub bus: ProgressBus,
}

impl JobContext {
    pub fn new(store: Store, bus: ProgressBus) -> Self {
        let results = store.results();
        Self {
            store,
            results,
            bus,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderArgs {
    provider_id: i64,
}

fn provider_id_arg(args: &serde_json::Value) -> Result<i64> {
    let parsed: ProviderArgs = serde_json::from_value(args.clone())
        .map_err(|e| Error::Validation(format!("bad job arguments: {}", e)))?;
    Ok(parsed.provider_id)
}

/// Register the full job set on a broker
pub fn register_jobs(broker: LocalBroker, ctx: JobContext) -> LocalBroker {
    let store_ctx = ctx.clone();
    let tcping_ctx = ctx.clone();
    let monitor_ctx = ctx.clone();
    let curl_ctx = ctx;

    broker
        .register(names::STORE_PROVIDER_IPS, move |args| {
            let ctx = store_ctx.clone();
            async move { store_provider_ips(&ctx, provider_id_arg(&args)?).await }
        })
        .register(names::TCPING_TEST, move |args| {
            let ctx = tcping_ctx.clone();
            async move { tcping_test(&ctx, provider_id_arg(&args)?).await }
        })
        .register(names::TCPING_TEST_MONITOR_LIST, move |args| {
            let ctx = monitor_ctx.clone();
            async move { tcping_test_monitor_list(&ctx, provider_id_arg(&args)?).await }
        })
        .register(names::CURL_TEST, move |args| {
            let ctx = curl_ctx.clone();
            async move { curl_test(&ctx, provider_id_arg(&args)?).await }
        })
}

/// Enqueue a provider's test cycle and start the group
///
/// The candidate rewrite stage is included only on the provider's first
/// cycle, when it has no monitor row yet. A provider whose monitoring is
/// switched off enqueues nothing.
pub async fn start_testing(
    runner: &Arc<JobGroupRunner>,
    store: &Store,
    provider_id: i64,
) -> Result<()> {
    let monitor = ProviderMonitor::new(store.clone());
    if !monitor.is_enabled(provider_id).await? {
        info!("Provider {} monitoring is disabled; not enqueuing", provider_id);
        return Ok(());
    }

    for stage in monitor.plan_test_cycle(provider_id).await? {
        runner.enqueue_to_group(
            TESTING_GROUP,
            JobSpec::new(stage.job_name(), json!({ "provider_id": provider_id })),
        );
    }
    runner.start_group(TESTING_GROUP);
    Ok(())
}

/// Rewrite the provider's candidate IP rows from its ranges
pub async fn store_provider_ips(ctx: &JobContext, provider_id: i64) -> Result<()> {
    RangeExpander::new(ctx.store.clone(), ctx.bus.clone())
        .rewrite_provider_ips(provider_id)
        .await?;
    Ok(())
}

fn prober_from_config(config: &TcpingConfig) -> TcpingProber {
    TcpingProber::new(config.port)
        .with_connect_timeout(Duration::from_secs(config.time_out))
}

fn gates_from_config(config: &TcpingConfig) -> LatencyGates {
    LatencyGates {
        max_avg: config.avg_latency,
        max_loss: config.packet_loss,
        target_count: config.count,
    }
}

/// Full latency sweep over the provider's candidate pool
pub async fn tcping_test(ctx: &JobContext, provider_id: i64) -> Result<()> {
    let config = ctx.store.provider_config(provider_id).await?.tcping;
    tcping_test_with_prober(ctx, provider_id, prober_from_config(&config)).await
}

pub(crate) async fn tcping_test_with_prober(
    ctx: &JobContext,
    provider_id: i64,
    prober: TcpingProber,
) -> Result<()> {
    let config = ctx.store.provider_config(provider_id).await?.tcping;
    if !config.enable {
        info!("TCPing disabled for provider {}; skipping", provider_id);
        return Ok(());
    }

    let gates = gates_from_config(&config);
    let runner = TcpingBatchRunner::new(prober, ctx.results.clone(), ctx.bus.clone());

    for (enabled, family) in [
        (config.ip_v4_enable, IpType::Ipv4),
        (config.ip_v6_enable, IpType::Ipv6),
    ] {
        if !enabled {
            continue;
        }
        let candidates = ctx
            .store
            .candidate_ips(provider_id, family, None, true)
            .await?;
        if candidates.is_empty() {
            debug!(
                "Provider {} has no {} candidates",
                provider_id,
                family.as_str()
            );
            continue;
        }
        runner.run(&candidates, &gates).await?;
    }
    Ok(())
}

/// Refresh the best-IP set: re-test, drop stale rows, refill if short
pub async fn tcping_test_monitor_list(ctx: &JobContext, provider_id: i64) -> Result<()> {
    let config = ctx.store.provider_config(provider_id).await?.tcping;
    tcping_monitor_list_with_prober(ctx, provider_id, prober_from_config(&config)).await
}

pub(crate) async fn tcping_monitor_list_with_prober(
    ctx: &JobContext,
    provider_id: i64,
    prober: TcpingProber,
) -> Result<()> {
    let config = ctx.store.provider_config(provider_id).await?.tcping;
    if !config.enable {
        info!("TCPing disabled for provider {}; skipping refresh", provider_id);
        return Ok(());
    }

    let better = ctx.results.better_ips(config.count).await?;
    for ip in &better {
        ctx.results.delete(*ip).await?;
    }

    let candidates: Vec<IpAddr> = if better.len() < config.count {
        debug!(
            "Best set for provider {} is short ({} < {}); refilling from the pool",
            provider_id,
            better.len(),
            config.count
        );
        let mut pool = Vec::new();
        for (enabled, family) in [
            (config.ip_v4_enable, IpType::Ipv4),
            (config.ip_v6_enable, IpType::Ipv6),
        ] {
            if enabled {
                pool.extend(
                    ctx.store
                        .candidate_ips(provider_id, family, None, true)
                        .await?,
                );
            }
        }
        pool
    } else {
        better
    };

    if candidates.is_empty() {
        debug!("Nothing to refresh for provider {}", provider_id);
        return Ok(());
    }

    let gates = gates_from_config(&config);
    TcpingBatchRunner::new(prober, ctx.results.clone(), ctx.bus.clone())
        .run(&candidates, &gates)
        .await?;
    Ok(())
}

/// Bandwidth-test the top-ranked IPs and sweep failures
pub async fn curl_test(ctx: &JobContext, provider_id: i64) -> Result<()> {
    curl_test_with_prober(ctx, provider_id, DownloadProber::new()).await
}

pub(crate) async fn curl_test_with_prober(
    ctx: &JobContext,
    provider_id: i64,
    prober: DownloadProber,
) -> Result<()> {
    let config = ctx.store.provider_config(provider_id).await?.curl;
    if !config.enable {
        info!("Curl disabled for provider {}; skipping", provider_id);
        return Ok(());
    }
    let Some(download_url) = config.download_url.as_deref() else {
        info!(
            "Provider {} has no download_url; skipping bandwidth test",
            provider_id
        );
        return Ok(());
    };

    let targets = ctx.results.better_ips(config.count).await?;
    let timeout = Duration::from_secs(config.time_out);

    for ip in targets {
        let family_enabled = if ip.is_ipv4() {
            config.ip_v4_enable
        } else {
            config.ip_v6_enable
        };
        if !family_enabled {
            continue;
        }

        match prober.probe(ip, download_url, config.port, timeout).await {
            Some(speed) if config.speed > speed => {
                // Below the gate: record the sentinel so the sweep
                // removes the row
                ctx.results.update_speed(ip, SPEED_FAILED).await?;
            }
            Some(speed) => {
                ctx.results.update_speed(ip, speed).await?;
            }
            None => {
                debug!("No bandwidth measurement for {}", ip);
            }
        }
    }

    if ctx.results.has_speed_value().await? {
        ctx.results.prune_speed_failures().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprobe_core::{LatencyStats, NewIpRange, ProviderConfig, RangeSource};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fixture() -> (TempDir, JobContext) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db")).await.unwrap();
        let ctx = JobContext::new(store, ProgressBus::new(1000));
        (dir, ctx)
    }

    fn fast_prober(port: u16) -> TcpingProber {
        TcpingProber::new(port)
            .with_count(2)
            .with_interval(Duration::ZERO)
            .with_connect_timeout(Duration::from_millis(200))
    }

    fn stats(avg: f64, std: f64, loss: f64) -> LatencyStats {
        LatencyStats {
            avg_ms: avg,
            std_ms: std,
            loss,
        }
    }

    async fn seed_provider_with_candidates(
        ctx: &JobContext,
        candidates: &[&str],
    ) -> i64 {
        let provider = ctx.store.create_provider("cf", None, None).await.unwrap();
        let ranges: Vec<NewIpRange> = candidates
            .iter()
            .map(|raw| {
                let ip: IpAddr = raw.parse().unwrap();
                NewIpRange::new(provider.id, ip, ip, None, RangeSource::Single).unwrap()
            })
            .collect();
        ctx.store
            .replace_ranges(provider.id, RangeSource::Single, &ranges)
            .await
            .unwrap();
        store_provider_ips(ctx, provider.id).await.unwrap();
        provider.id
    }

    #[tokio::test]
    async fn test_store_provider_ips_job() {
        let (_dir, ctx) = fixture().await;
        let provider_id =
            seed_provider_with_candidates(&ctx, &["10.0.0.1", "10.0.0.2"]).await;
        assert_eq!(ctx.store.count_ips(provider_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tcping_test_stores_gated_results() {
        let (_dir, ctx) = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider_id = seed_provider_with_candidates(&ctx, &["127.0.0.1"]).await;

        let mut config = ProviderConfig::default();
        config.tcping.port = port;
        config.tcping.avg_latency = 10_000.0;
        config.tcping.packet_loss = 1.0;
        config.tcping.count = 5;
        ctx.store
            .put_provider_config(provider_id, &config)
            .await
            .unwrap();

        tcping_test_with_prober(&ctx, provider_id, fast_prober(port))
            .await
            .unwrap();

        assert_eq!(ctx.results.count().await.unwrap(), 1);
        assert!(ctx
            .results
            .get("127.0.0.1".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_tcping_test_disabled_is_noop() {
        let (_dir, ctx) = fixture().await;
        let provider_id = seed_provider_with_candidates(&ctx, &["127.0.0.1"]).await;

        let mut config = ProviderConfig::default();
        config.tcping.enable = false;
        ctx.store
            .put_provider_config(provider_id, &config)
            .await
            .unwrap();

        tcping_test_with_prober(&ctx, provider_id, fast_prober(1))
            .await
            .unwrap();
        assert_eq!(ctx.results.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_monitor_list_refreshes_and_refills() {
        let (_dir, ctx) = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let provider_id = seed_provider_with_candidates(&ctx, &["127.0.0.1"]).await;

        // One stale best-set row for an address that now refuses probes
        ctx.results
            .upsert_latency("10.9.9.9".parse().unwrap(), &stats(40.0, 1.0, 0.0))
            .await
            .unwrap();

        let mut config = ProviderConfig::default();
        config.tcping.port = port;
        config.tcping.avg_latency = 10_000.0;
        config.tcping.packet_loss = 1.0;
        config.tcping.count = 5;
        ctx.store
            .put_provider_config(provider_id, &config)
            .await
            .unwrap();

        tcping_monitor_list_with_prober(&ctx, provider_id, fast_prober(port))
            .await
            .unwrap();

        // The stale row was dropped; the refill re-tested the pool
        assert!(ctx
            .results
            .get("10.9.9.9".parse().unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(ctx
            .results
            .get("127.0.0.1".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_curl_test_records_speed_and_prunes_failures() {
        let (_dir, ctx) = fixture().await;
        let server = MockServer::start().await;
        let body = vec![0u8; 1_048_576];
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        let port = server.address().port();

        let provider = ctx.store.create_provider("cf", None, None).await.unwrap();

        let fast: IpAddr = "127.0.0.1".parse().unwrap();
        let dead: IpAddr = "192.0.2.1".parse().unwrap();
        ctx.results
            .upsert_latency(fast, &stats(10.0, 1.0, 0.0))
            .await
            .unwrap();
        ctx.results
            .upsert_latency(dead, &stats(20.0, 1.0, 0.0))
            .await
            .unwrap();

        let mut config = ProviderConfig::default();
        config.curl.port = port;
        config.curl.speed = 0.1;
        config.curl.time_out = 2;
        config.curl.count = 5;
        config.curl.download_url =
            Some(format!("http://files.example.com:{}/file.bin", port));
        ctx.store
            .put_provider_config(provider.id, &config)
            .await
            .unwrap();

        curl_test_with_prober(&ctx, provider.id, DownloadProber::new())
            .await
            .unwrap();

        // 1 MiB over 2 s passes the 0.1 MB/s gate
        let row = ctx.results.get(fast).await.unwrap().unwrap();
        assert_eq!(row.download_speed, Some(0.5));
        // The unreachable target produced no measurement; its row stays
        let dead_row = ctx.results.get(dead).await.unwrap().unwrap();
        assert_eq!(dead_row.download_speed, None);
    }

    #[tokio::test]
    async fn test_curl_test_speed_gate_sentinel() {
        let (_dir, ctx) = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1024]))
            .mount(&server)
            .await;
        let port = server.address().port();

        let provider = ctx.store.create_provider("cf", None, None).await.unwrap();
        let slow: IpAddr = "127.0.0.1".parse().unwrap();
        ctx.results
            .upsert_latency(slow, &stats(10.0, 1.0, 0.0))
            .await
            .unwrap();

        let mut config = ProviderConfig::default();
        config.curl.port = port;
        // 1 KiB over 2 s cannot reach 50 MB/s: gate fails
        config.curl.speed = 50.0;
        config.curl.time_out = 2;
        config.curl.download_url =
            Some(format!("http://files.example.com:{}/file.bin", port));
        ctx.store
            .put_provider_config(provider.id, &config)
            .await
            .unwrap();

        curl_test_with_prober(&ctx, provider.id, DownloadProber::new())
            .await
            .unwrap();

        // Sentinel row was recorded and then swept
        assert!(ctx.results.get(slow).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_curl_test_without_url_is_noop() {
        let (_dir, ctx) = fixture().await;
        let provider = ctx.store.create_provider("cf", None, None).await.unwrap();
        ctx.results
            .upsert_latency("127.0.0.1".parse().unwrap(), &stats(10.0, 1.0, 0.0))
            .await
            .unwrap();

        curl_test(&ctx, provider.id).await.unwrap();
        assert_eq!(ctx.results.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_testing_composes_three_stages() {
        let (_dir, ctx) = fixture().await;
        let provider = ctx.store.create_provider("cf", None, None).await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut broker = LocalBroker::new();
        for name in [
            names::STORE_PROVIDER_IPS,
            names::TCPING_TEST,
            names::CURL_TEST,
        ] {
            let seen = Arc::clone(&seen);
            let owned = name.to_string();
            broker = broker.register(name, move |_args| {
                let seen = Arc::clone(&seen);
                let owned = owned.clone();
                async move {
                    seen.lock().push(owned);
                    Ok(())
                }
            });
        }

        let runner = Arc::new(
            JobGroupRunner::new(Arc::new(broker))
                .with_poll_interval(Duration::from_millis(5)),
        );

        start_testing(&runner, &ctx.store, provider.id).await.unwrap();
        runner.join_group(TESTING_GROUP).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                names::STORE_PROVIDER_IPS.to_string(),
                names::TCPING_TEST.to_string(),
                names::CURL_TEST.to_string()
            ]
        );

        // Second cycle: provider is enrolled, the rewrite stage is gone
        seen.lock().clear();
        start_testing(&runner, &ctx.store, provider.id).await.unwrap();
        runner.join_group(TESTING_GROUP).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![names::TCPING_TEST.to_string(), names::CURL_TEST.to_string()]
        );
    }

    #[tokio::test]
    async fn test_registered_jobs_run_through_group_runner() {
        let (_dir, ctx) = fixture().await;
        let provider_id = seed_provider_with_candidates(&ctx, &["10.0.0.1"]).await;

        // tcping/curl disabled so the registered defaults return fast
        let mut config = ProviderConfig::default();
        config.tcping.enable = false;
        config.curl.enable = false;
        ctx.store
            .put_provider_config(provider_id, &config)
            .await
            .unwrap();

        let broker = register_jobs(LocalBroker::new(), ctx.clone());
        let runner = Arc::new(
            JobGroupRunner::new(Arc::new(broker))
                .with_poll_interval(Duration::from_millis(5)),
        );

        for name in [
            names::STORE_PROVIDER_IPS,
            names::TCPING_TEST,
            names::TCPING_TEST_MONITOR_LIST,
            names::CURL_TEST,
        ] {
            runner.enqueue_to_group(
                TESTING_GROUP,
                JobSpec::new(name, json!({ "provider_id": provider_id })),
            );
        }
        runner.start_group(TESTING_GROUP);
        runner.join_group(TESTING_GROUP).await.unwrap();

        assert_eq!(ctx.store.count_ips(provider_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_job_arguments_rejected() {
        let (_dir, ctx) = fixture().await;
        let broker = register_jobs(LocalBroker::new(), ctx);
        let runner = Arc::new(
            JobGroupRunner::new(Arc::new(broker))
                .with_poll_interval(Duration::from_millis(5)),
        );

        runner.enqueue_to_group(
            TESTING_GROUP,
            JobSpec::new(names::TCPING_TEST, json!({"wrong": true})),
        );
        runner.start_group(TESTING_GROUP);
        assert!(runner.join_group(TESTING_GROUP).await.is_err());
    }
}
