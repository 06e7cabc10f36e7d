//! TCP connect latency prober
//!
//! Measures reachability and latency by completing full TCP handshakes
//! against a target, the most compatible probe available: no raw sockets
//! and no elevated privileges.
//!
//! # How It Works
//!
//! Each probe runs `count` serial connect attempts. An attempt is timed
//! from just before the dial to handshake completion; a timeout or any
//! connect error counts as a lost sample. The prober sleeps `interval`
//! between attempts. From the successful samples it derives the latency
//! triple `(avg_ms, std_ms, loss)` with the population standard
//! deviation. A probe with zero successful connects yields `None` rather
//! than an error.

use edgeprobe_core::LatencyStats;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// TCP connect prober
///
/// # Examples
///
/// ```no_run
/// use edgeprobe_prober::TcpingProber;
/// use std::net::IpAddr;
///
/// # async fn example() {
/// let prober = TcpingProber::new(443);
/// let target: IpAddr = "1.1.1.1".parse().unwrap();
/// if let Some(stats) = prober.probe(target).await {
///     println!("{}: {} ms avg, {} loss", target, stats.avg_ms, stats.loss);
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpingProber {
    port: u16,
    count: usize,
    interval: Duration,
    connect_timeout: Duration,
}

impl TcpingProber {
    /// Create a prober for `port` with the default cadence:
    /// 10 attempts, 1 s apart, 1 s connect timeout
    pub fn new(port: u16) -> Self {
        Self {
            port,
            count: 10,
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Number of connect attempts per probe
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    /// Pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Per-attempt connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Probe one target
    ///
    /// Returns the latency triple, or `None` when every attempt failed.
    /// Network errors are absorbed here; a missing result is the only
    /// signal the pipeline needs.
    pub async fn probe(&self, target: IpAddr) -> Option<LatencyStats> {
        let addr = SocketAddr::new(target, self.port);
        let mut samples = Vec::with_capacity(self.count);

        for attempt in 0..self.count {
            let start = Instant::now();
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                    trace!("Connected to {} in {:.2} ms", addr, elapsed_ms);
                    samples.push(elapsed_ms);
                    drop(stream);
                }
                Ok(Err(e)) => {
                    trace!("Connect to {} failed: {}", addr, e);
                }
                Err(_elapsed) => {
                    trace!(
                        "Connect to {} timed out (attempt {}/{})",
                        addr,
                        attempt + 1,
                        self.count
                    );
                }
            }

            if attempt + 1 < self.count {
                tokio::time::sleep(self.interval).await;
            }
        }

        let stats = LatencyStats::from_samples(&samples, self.count);
        match &stats {
            Some(stats) => debug!(
                "{}: avg {:.2} ms, std {:.4} ms, loss {:.2}",
                addr, stats.avg_ms, stats.std_ms, stats.loss
            ),
            None => debug!("{}: no successful connects", addr),
        }
        stats
    }
}
