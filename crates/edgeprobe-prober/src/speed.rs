//! Bandwidth prober: per-IP HTTPS download measurement
//!
//! Resolves the download URL's hostname to one target IP for the probe's
//! connection only (the Host header is preserved), streams the body into
//! a uniquely named scratch file and enforces two timers:
//!
//! 1. a wall-clock budget covering the whole transfer, and
//! 2. a stall timer that trips after [`STALL_TIMEOUT`] without a byte.
//!
//! Either trip cancels the transfer. A probe that wrote no bytes yields
//! `None`. Otherwise the speed is `bytes / 1 MiB / budget_secs`, rounded
//! to 2 decimals. The scratch file is removed on every exit path, and at
//! most one download is in flight at a time so measurements do not share
//! bandwidth.

use edgeprobe_core::round2;
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Transfer abort threshold without observable progress
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Serial HTTPS download prober
#[derive(Clone)]
pub struct DownloadProber {
    stall_timeout: Duration,
    scratch_dir: Option<PathBuf>,
    slot: Arc<Semaphore>,
}

impl DownloadProber {
    pub fn new() -> Self {
        Self {
            stall_timeout: STALL_TIMEOUT,
            scratch_dir: None,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Override the stall threshold
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Write scratch files under `dir` instead of the system temp dir
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    /// Download through `ip` and measure MB/s over the whole budget
    ///
    /// Returns `None` on any failure: unparsable URL, connect error,
    /// tripped timer or empty transfer. Network errors are absorbed; a
    /// missing measurement is the signal.
    pub async fn probe(
        &self,
        ip: IpAddr,
        download_url: &str,
        port: u16,
        timeout: Duration,
    ) -> Option<f64> {
        // One transfer at a time; throughput must not be shared
        let _slot = self.slot.acquire().await.ok()?;

        let url: reqwest::Url = match download_url.parse() {
            Ok(url) => url,
            Err(e) => {
                warn!("Invalid download URL {}: {}", download_url, e);
                return None;
            }
        };
        let host = url.host_str()?.to_string();

        let client = match reqwest::Client::builder()
            .resolve(&host, SocketAddr::new(ip, port))
            .connect_timeout(timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build download client: {}", e);
                return None;
            }
        };

        // Unique scratch file, removed on drop whichever way we leave
        let mut builder = tempfile::Builder::new();
        builder.prefix("edgeprobe-download-").suffix(".part");
        let scratch = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let scratch = match scratch {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!("Failed to create scratch file: {}", e);
                return None;
            }
        };
        let mut file = match scratch.reopen() {
            Ok(file) => tokio::fs::File::from_std(file),
            Err(e) => {
                warn!("Failed to reopen scratch file: {}", e);
                return None;
            }
        };

        debug!("Downloading {} via {}:{}", download_url, ip, port);
        let started = Instant::now();
        let deadline = started + timeout;

        let bytes_written = self
            .transfer(&client, url.clone(), &mut file, deadline)
            .await;
        drop(file);

        if bytes_written == 0 {
            debug!("Download via {} produced no bytes", ip);
            return None;
        }

        let speed = round2(bytes_written as f64 / 1_048_576.0 / timeout.as_secs_f64());
        info!(
            "Download via {} finished: {} bytes, {:.2} MB/s",
            ip, bytes_written, speed
        );
        Some(speed)
    }

    /// Stream the body until completion, error, wall deadline or stall
    async fn transfer(
        &self,
        client: &reqwest::Client,
        url: reqwest::Url,
        file: &mut tokio::fs::File,
        deadline: Instant,
    ) -> u64 {
        let response = tokio::select! {
            response = client.get(url).send() => match response.and_then(|r| r.error_for_status()) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Download request failed: {}", e);
                    return 0;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Download timed out before the response arrived");
                return 0;
            }
        };

        let mut stream = response.bytes_stream();
        let mut bytes_written = 0u64;

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if file.write_all(&bytes).await.is_err() {
                            warn!("Failed writing scratch file");
                            break;
                        }
                        bytes_written += bytes.len() as u64;
                    }
                    Some(Err(e)) => {
                        debug!("Download stream error: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Download hit the wall-clock budget; stopping");
                    break;
                }
                _ = tokio::time::sleep(self.stall_timeout) => {
                    info!(
                        "No download progress for {:?}; assuming the transfer stalled",
                        self.stall_timeout
                    );
                    break;
                }
            }
        }

        let _ = file.flush().await;
        bytes_written
    }
}

impl Default for DownloadProber {
    fn default() -> Self {
        Self::new()
    }
}
