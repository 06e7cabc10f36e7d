//! EdgeProbe Prober Engine
//!
//! The probe pipeline: range ingestion and expansion feed candidate IPs,
//! the TCP latency prober and the bandwidth prober measure them, and the
//! monitor composes the per-provider test cycle.
//!
//! # Architecture
//!
//! - [`ingest`]: normalizes the four range input shapes (range API,
//!   CIDRs, single IPs, custom pairs) into canonical ranges
//! - [`expand`]: enumerates IPv4 exhaustively, samples IPv6 to a hard
//!   cap, and rewrites candidate rows in bounded concurrent batches
//! - [`tcping`]: serial TCP connect probe producing the latency triple
//! - [`batch`]: 20-wide probe batches with gated retention and atomic
//!   early termination
//! - [`speed`]: single-flight HTTPS download measurement with pinned
//!   host resolution and wall/stall timers
//! - [`monitor`]: per-provider enable flag and stage composition

pub mod batch;
pub mod expand;
pub mod ingest;
pub mod monitor;
pub mod speed;
pub mod tcping;

pub use batch::{BatchOutcome, GatePolicy, LatencyGates, TcpingBatchRunner, BATCH_SIZE};
pub use expand::{RangeExpander, INSERT_BATCH, INSERT_CONCURRENCY, IPV6_SAMPLE_CAP};
pub use ingest::{ApiKind, RangeIngestor};
pub use monitor::{ProviderMonitor, TestStage};
pub use speed::{DownloadProber, STALL_TIMEOUT};
pub use tcping::TcpingProber;
