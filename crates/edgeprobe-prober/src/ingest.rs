//! Range ingestion: normalizing four input shapes into canonical ranges
//!
//! Sources:
//! - **API**: fetch the provider's published range list and parse it by
//!   [`ApiKind`] (Cloudflare or CloudFront); the fetch retries 3 times
//!   with a 5 second back-off before the error propagates.
//! - **CIDRS**: each input parsed as a host/network. An input equal to
//!   its network address expands to `(network, broadcast)`; any other
//!   host address degenerates to `(ip, ip)`.
//! - **SINGLE**: each address becomes an `(ip, ip)` range.
//! - **CUSTOM**: explicit `(start, end)` pairs validated for family
//!   match and ordering.
//!
//! Every ingestion path rewrites the provider's ranges for exactly one
//! source atomically; ranges of other sources are untouched.

use edgeprobe_core::{Error, NewIpRange, RangeSource, Result};
use edgeprobe_store::Store;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fetch attempts against a range API before giving up
const FETCH_RETRIES: u32 = 3;

/// Pause between fetch attempts
const FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Recognized range-API response shapes
///
/// Dispatch is by URL substring; an unrecognized URL is an
/// [`Error::UnsupportedProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    /// `{success, result: {ipv4_cidrs, ipv6_cidrs}}`
    Cloudflare,
    /// `{prefixes: [{ip_prefix | ipv6_prefix, region, service}]}`,
    /// retained iff `region == "GLOBAL"` and `service == "CLOUDFRONT"`
    CloudFront,
}

impl ApiKind {
    pub fn from_url(url: &str) -> Result<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.contains("cloudflare") {
            Ok(ApiKind::Cloudflare)
        } else if lower.contains("cloudfront") || lower.contains("amazonaws") {
            Ok(ApiKind::CloudFront)
        } else {
            Err(Error::UnsupportedProvider(format!(
                "no known API shape for {}",
                url
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloudflareEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<CloudflareRanges>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudflareRanges {
    #[serde(default)]
    ipv4_cidrs: Vec<String>,
    #[serde(default)]
    ipv6_cidrs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CloudFrontEnvelope {
    #[serde(default)]
    prefixes: Vec<CloudFrontPrefix>,
}

#[derive(Debug, Deserialize)]
struct CloudFrontPrefix {
    #[serde(default)]
    ip_prefix: Option<String>,
    #[serde(default)]
    ipv6_prefix: Option<String>,
    #[serde(default)]
    region: String,
    #[serde(default)]
    service: String,
}

/// Normalizes range inputs and rewrites them through the store
#[derive(Clone)]
pub struct RangeIngestor {
    store: Store,
    client: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl RangeIngestor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            retries: FETCH_RETRIES,
            backoff: FETCH_BACKOFF,
        }
    }

    /// Override the pause between fetch attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetch the provider's range API and rewrite its `api` ranges
    ///
    /// The provider must carry an `api_url`. Returns the number of
    /// ranges stored.
    pub async fn ingest_from_api(&self, provider_id: i64) -> Result<usize> {
        let provider = self
            .store
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("provider {} not found", provider_id)))?;
        let api_url = provider
            .api_url
            .ok_or_else(|| Error::Validation(format!("provider {} has no api_url", provider_id)))?;

        let cidrs = self.fetch_cidrs(&api_url).await?;
        info!(
            "Fetched {} CIDRs from {} for provider {}",
            cidrs.len(),
            api_url,
            provider_id
        );

        self.rewrite_from_cidrs(provider_id, RangeSource::Api, &cidrs)
            .await
    }

    /// Rewrite the provider's user-supplied `cidrs` ranges
    pub async fn ingest_cidrs(&self, provider_id: i64, cidrs: &[String]) -> Result<usize> {
        self.rewrite_from_cidrs(provider_id, RangeSource::Cidrs, cidrs)
            .await
    }

    /// Rewrite the provider's `single` ranges, one per address
    pub async fn ingest_single_ips(&self, provider_id: i64, ips: &[IpAddr]) -> Result<usize> {
        let ranges: Vec<NewIpRange> = ips
            .iter()
            .map(|&ip| NewIpRange::new(provider_id, ip, ip, None, RangeSource::Single))
            .collect::<Result<_>>()?;

        self.store
            .replace_ranges(provider_id, RangeSource::Single, &ranges)
            .await?;
        Ok(ranges.len())
    }

    /// Rewrite the provider's `custom` ranges from explicit pairs
    pub async fn ingest_custom_ranges(
        &self,
        provider_id: i64,
        pairs: &[(IpAddr, IpAddr)],
    ) -> Result<usize> {
        let ranges: Vec<NewIpRange> = pairs
            .iter()
            .map(|&(start, end)| {
                NewIpRange::new(provider_id, start, end, None, RangeSource::Custom)
            })
            .collect::<Result<_>>()?;

        self.store
            .replace_ranges(provider_id, RangeSource::Custom, &ranges)
            .await?;
        Ok(ranges.len())
    }

    async fn rewrite_from_cidrs(
        &self,
        provider_id: i64,
        source: RangeSource,
        cidrs: &[String],
    ) -> Result<usize> {
        let ranges: Vec<NewIpRange> = cidrs
            .iter()
            .map(|cidr| {
                let (start, end) = cidr_bounds(cidr)?;
                NewIpRange::new(provider_id, start, end, Some(cidr.clone()), source)
            })
            .collect::<Result<_>>()?;

        self.store
            .replace_ranges(provider_id, source, &ranges)
            .await?;
        Ok(ranges.len())
    }

    /// Fetch and parse a range API into a flat CIDR list
    pub async fn fetch_cidrs(&self, api_url: &str) -> Result<Vec<String>> {
        let kind = ApiKind::from_url(api_url)?;
        let body = self.fetch_with_retry(api_url).await?;

        match kind {
            ApiKind::Cloudflare => {
                let envelope: CloudflareEnvelope = serde_json::from_value(body).map_err(|e| {
                    Error::UnsupportedProvider(format!("unrecognized Cloudflare response: {}", e))
                })?;
                if !envelope.success {
                    return Err(Error::UnsupportedProvider(
                        "Cloudflare API reported success=false".to_string(),
                    ));
                }
                let ranges = envelope.result.unwrap_or_default();
                let mut cidrs = ranges.ipv4_cidrs;
                cidrs.extend(ranges.ipv6_cidrs);
                Ok(cidrs)
            }
            ApiKind::CloudFront => {
                let envelope: CloudFrontEnvelope = serde_json::from_value(body).map_err(|e| {
                    Error::UnsupportedProvider(format!("unrecognized CloudFront response: {}", e))
                })?;
                let mut cidrs = Vec::new();
                for prefix in envelope.prefixes {
                    if prefix.region != "GLOBAL" || prefix.service != "CLOUDFRONT" {
                        continue;
                    }
                    if let Some(v4) = prefix.ip_prefix {
                        cidrs.push(v4);
                    }
                    if let Some(v6) = prefix.ipv6_prefix {
                        debug!("CloudFront IPv6 prefix retained: {}", v6);
                        cidrs.push(v6);
                    }
                }
                Ok(cidrs)
            }
        }
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = async {
                let response = self.client.get(url).send().await?;
                let response = response.error_for_status()?;
                response.json::<serde_json::Value>().await
            }
            .await;

            match outcome {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.retries => {
                    warn!(
                        "Range API fetch failed (attempt {}/{}): {}",
                        attempt, self.retries, e
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    return Err(Error::UpstreamFetch(format!(
                        "{} after {} attempts: {}",
                        url, attempt, e
                    )));
                }
            }
        }
    }
}

/// Bounds of a CIDR input under the network/degenerate rule
///
/// `10.0.0.0/30` → `(10.0.0.0, 10.0.0.3)`, but a host address such as
/// `10.0.0.1/30` collapses to `(10.0.0.1, 10.0.0.1)`. A bare address
/// parses as a full-length prefix and collapses likewise.
pub fn cidr_bounds(input: &str) -> Result<(IpAddr, IpAddr)> {
    let network: IpNetwork = input
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("invalid CIDR {}: {}", input, e)))?;

    if network.ip() != network.network() {
        // Host bits set: the user meant this one address
        return Ok((network.ip(), network.ip()));
    }

    match network {
        IpNetwork::V4(net) => Ok((IpAddr::V4(net.network()), IpAddr::V4(net.broadcast()))),
        IpNetwork::V6(net) => {
            let start = u128::from(net.network());
            let span = if net.prefix() == 128 {
                0
            } else {
                (!0u128) >> net.prefix()
            };
            Ok((
                IpAddr::V6(net.network()),
                IpAddr::V6(std::net::Ipv6Addr::from(start | span)),
            ))
        }
    }
}
