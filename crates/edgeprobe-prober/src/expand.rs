//! Range expansion: turning ranges into concrete candidate IP rows
//!
//! IPv4 ranges are enumerated exhaustively. IPv6 ranges are enumerated
//! only up to [`IPV6_SAMPLE_CAP`] addresses; above that the expander
//! draws that many uniform samples **with replacement** (duplicates are
//! tolerated and deduplicated best-effort by the store's unique index).
//!
//! Candidate rows are rewritten wholesale per provider: a full delete
//! followed by batched inserts of [`INSERT_BATCH`] rows with at most
//! [`INSERT_CONCURRENCY`] batches in flight. After each committed batch
//! an `inserting` progress event is published; the rewrite finishes with
//! a terminal `completed` event.

use edgeprobe_core::{
    ip_from_u128, ip_to_u128, Error, IpRange, IpType, ProgressBus, ProgressEvent, Result,
    PROGRESS_CHANNEL,
};
use edgeprobe_store::Store;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Hard cap on candidates generated from one IPv6 range
pub const IPV6_SAMPLE_CAP: usize = 500_000;

/// Rows per committed insert batch
pub const INSERT_BATCH: usize = 2_000;

/// Insert batches in flight at once
pub const INSERT_CONCURRENCY: usize = 10;

/// Expands ranges into stored candidate IPs
#[derive(Clone)]
pub struct RangeExpander {
    store: Store,
    bus: ProgressBus,
}

impl RangeExpander {
    pub fn new(store: Store, bus: ProgressBus) -> Self {
        Self { store, bus }
    }

    /// Expand one range into concrete addresses
    ///
    /// IPv4 yields exactly `span` addresses; IPv6 yields
    /// `min(span, IPV6_SAMPLE_CAP)`, sampled when over the cap.
    pub fn expand_range(range: &IpRange) -> Result<Vec<(IpAddr, IpType)>> {
        let ip_type = IpType::of(&range.start_ip);
        let start = ip_to_u128(range.start_ip);
        let end = ip_to_u128(range.end_ip);
        if start > end {
            return Err(Error::Validation(format!(
                "range {} - {} is inverted",
                range.start_ip, range.end_ip
            )));
        }

        let span = (end - start).saturating_add(1);
        let mut ips = Vec::new();

        match ip_type {
            IpType::Ipv4 => {
                for value in start..=end {
                    ips.push((ip_from_u128(value, ip_type)?, ip_type));
                }
            }
            IpType::Ipv6 => {
                if span <= IPV6_SAMPLE_CAP as u128 {
                    for value in start..=end {
                        ips.push((ip_from_u128(value, ip_type)?, ip_type));
                    }
                } else {
                    let mut rng = rand::thread_rng();
                    for _ in 0..IPV6_SAMPLE_CAP {
                        let value = rng.gen_range(start..=end);
                        ips.push((ip_from_u128(value, ip_type)?, ip_type));
                    }
                }
            }
        }

        Ok(ips)
    }

    /// Rewrite every candidate row of a provider from its current ranges
    ///
    /// Returns the number of candidate rows submitted for insertion
    /// (duplicates from IPv6 sampling may collapse inside the store).
    pub async fn rewrite_provider_ips(&self, provider_id: i64) -> Result<usize> {
        let ranges = self.store.ranges_for_provider(provider_id).await?;
        if ranges.is_empty() {
            info!("No ranges found for provider {}", provider_id);
            return Ok(0);
        }
        debug!(
            "Expanding {} ranges for provider {}",
            ranges.len(),
            provider_id
        );

        let mut all_ips = Vec::new();
        for range in &ranges {
            all_ips.extend(Self::expand_range(range)?);
        }
        let total = all_ips.len();

        // Old candidates are dropped before the batched reinsert
        self.store.delete_ips_by_provider(provider_id).await?;

        let semaphore = Arc::new(Semaphore::new(INSERT_CONCURRENCY));
        let processed = Arc::new(AtomicUsize::new(0));
        let mut tasks = FuturesUnordered::new();

        for chunk in all_ips.chunks(INSERT_BATCH) {
            let batch = chunk.to_vec();
            let store = self.store.clone();
            let bus = self.bus.clone();
            let semaphore = Arc::clone(&semaphore);
            let processed = Arc::clone(&processed);

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Storage(format!("Semaphore closed: {}", e)))?;

                let inserted = store.insert_ips_batch(provider_id, &batch).await?;
                let done = processed.fetch_add(inserted, Ordering::SeqCst) + inserted;

                bus.publish(
                    PROGRESS_CHANNEL,
                    ProgressEvent::inserting(done, total, "updating candidate IPs"),
                );
                Ok::<usize, Error>(inserted)
            }));
        }

        let mut failed = None;
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Candidate batch insert failed: {}", e);
                    failed = Some(e);
                }
                Err(e) => {
                    warn!("Candidate insert task panicked: {}", e);
                    failed = Some(Error::Storage(format!("insert task failed: {}", e)));
                }
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }

        let done = processed.load(Ordering::SeqCst);
        self.bus.publish(
            PROGRESS_CHANNEL,
            ProgressEvent::completed(done, total, "candidate IP update finished"),
        );
        info!(
            "Stored {} candidate IPs for provider {}",
            done, provider_id
        );
        Ok(done)
    }
}
