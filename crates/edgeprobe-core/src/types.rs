//! Core types for CDN edge-IP probing
//!
//! The four persistent entities (`Provider`, `IpRange`, `IpAddressRow`,
//! `TestResult`) mirror the relational layout of the store, while
//! `LatencyStats` is the transient latency triple produced by the TCP
//! prober. Integer IP math lives here so range expansion and sampling can
//! share one implementation for both address families.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// How an IP range was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeSource {
    /// Fetched from the provider's published range API
    Api,
    /// User-supplied CIDR list
    Cidrs,
    /// User-supplied single IPs
    Single,
    /// User-supplied explicit start/end pairs
    Custom,
}

impl RangeSource {
    /// Stable string form used as the store's source tag
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeSource::Api => "api",
            RangeSource::Cidrs => "cidrs",
            RangeSource::Single => "single",
            RangeSource::Custom => "custom",
        }
    }
}

impl fmt::Display for RangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(RangeSource::Api),
            "cidrs" => Ok(RangeSource::Cidrs),
            "single" => Ok(RangeSource::Single),
            "custom" => Ok(RangeSource::Custom),
            other => Err(Error::Validation(format!("unknown range source: {}", other))),
        }
    }
}

/// Address family tag stored beside every expanded IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpType {
    Ipv4,
    Ipv6,
}

impl IpType {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpType::Ipv4,
            IpAddr::V6(_) => IpType::Ipv6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpType::Ipv4 => "ipv4",
            IpType::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" => Ok(IpType::Ipv4),
            "ipv6" => Ok(IpType::Ipv6),
            other => Err(Error::Validation(format!("unknown ip type: {}", other))),
        }
    }
}

/// A CDN provider whose edge IP space is under test
///
/// `deleted` is a soft-delete tombstone; store queries exclude tombstoned
/// rows unless explicitly asked for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub api_url: Option<String>,
    pub logo_url: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contiguous `[start, end]` range within one address family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRange {
    pub id: i64,
    pub provider_id: i64,
    pub start_ip: IpAddr,
    pub end_ip: IpAddr,
    pub cidr: Option<String>,
    pub source: RangeSource,
}

/// A range prepared for insertion (no row id yet)
///
/// Construction validates the two range invariants: both endpoints share
/// an address family and `start_ip <= end_ip` numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIpRange {
    pub provider_id: i64,
    pub start_ip: IpAddr,
    pub end_ip: IpAddr,
    pub cidr: Option<String>,
    pub source: RangeSource,
}

impl NewIpRange {
    pub fn new(
        provider_id: i64,
        start_ip: IpAddr,
        end_ip: IpAddr,
        cidr: Option<String>,
        source: RangeSource,
    ) -> Result<Self> {
        if start_ip.is_ipv4() != end_ip.is_ipv4() {
            return Err(Error::Validation(format!(
                "mixed address families in range {} - {}",
                start_ip, end_ip
            )));
        }
        if ip_to_u128(start_ip) > ip_to_u128(end_ip) {
            return Err(Error::Validation(format!(
                "start_ip {} is above end_ip {}",
                start_ip, end_ip
            )));
        }
        Ok(Self {
            provider_id,
            start_ip,
            end_ip,
            cidr,
            source,
        })
    }

    /// Number of addresses in `[start, end]`, saturating at `u128::MAX`
    pub fn span(&self) -> u128 {
        (ip_to_u128(self.end_ip) - ip_to_u128(self.start_ip)).saturating_add(1)
    }

    pub fn ip_type(&self) -> IpType {
        IpType::of(&self.start_ip)
    }
}

/// One expanded candidate IP belonging to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAddressRow {
    pub id: i64,
    pub provider_id: i64,
    pub ip_address: IpAddr,
    pub ip_type: IpType,
}

/// Per-provider monitor row
///
/// Presence of the row marks the provider as enrolled in scheduled
/// testing; `enable` switches probing off without losing the enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub provider_id: i64,
    pub enable: bool,
}

/// Quality measurements for one probed IP
///
/// Keyed by bare `ip` in the store: when two providers publish the same
/// address, the later prober's result overwrites the earlier. Callers must
/// not assume per-provider isolation. `download_speed` of `-1.0` is the
/// explicit failed-bandwidth sentinel, distinct from "never speed-tested"
/// (`None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub ip: IpAddr,
    pub avg_latency: Option<f64>,
    pub std_deviation: Option<f64>,
    pub packet_loss: Option<f64>,
    pub download_speed: Option<f64>,
    pub is_locked: bool,
    pub is_delete: bool,
    pub test_time: DateTime<Utc>,
}

/// Sentinel recorded when a bandwidth probe fell below the speed gate
pub const SPEED_FAILED: f64 = -1.0;

/// The latency triple returned by a successful TCP probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Mean connect latency, milliseconds, 2 decimals
    pub avg_ms: f64,
    /// Population standard deviation, milliseconds, 4 decimals
    pub std_ms: f64,
    /// Lost fraction in `[0, 1]`, 2 decimals
    pub loss: f64,
}

impl LatencyStats {
    /// Compute the triple from successful samples out of `attempted` tries
    ///
    /// Returns `None` when no attempt succeeded. Uses the population
    /// variance (divide by `n`, not `n - 1`).
    pub fn from_samples(samples: &[f64], attempted: usize) -> Option<Self> {
        if samples.is_empty() || attempted == 0 {
            return None;
        }
        let n = samples.len() as f64;
        let avg = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n;
        let loss = (attempted - samples.len()) as f64 / attempted as f64;
        Some(Self {
            avg_ms: round2(avg),
            std_ms: round4(variance.sqrt()),
            loss: round2(loss),
        })
    }
}

/// Round to 2 decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to 4 decimal places
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Numeric value of an address; IPv4 maps into the low 32 bits
pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Rebuild an address of the given family from its numeric value
///
/// Fails when an IPv4 value does not fit in 32 bits.
pub fn ip_from_u128(value: u128, ip_type: IpType) -> Result<IpAddr> {
    match ip_type {
        IpType::Ipv4 => {
            let v4: u32 = value
                .try_into()
                .map_err(|_| Error::Parse(format!("value {} out of IPv4 range", value)))?;
            Ok(IpAddr::V4(Ipv4Addr::from(v4)))
        }
        IpType::Ipv6 => Ok(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_source_round_trip() {
        for source in [
            RangeSource::Api,
            RangeSource::Cidrs,
            RangeSource::Single,
            RangeSource::Custom,
        ] {
            assert_eq!(source.as_str().parse::<RangeSource>().unwrap(), source);
        }
        assert!("dns".parse::<RangeSource>().is_err());
    }

    #[test]
    fn test_ip_type_of() {
        assert_eq!(IpType::of(&"1.2.3.4".parse().unwrap()), IpType::Ipv4);
        assert_eq!(IpType::of(&"2606:4700::1".parse().unwrap()), IpType::Ipv6);
    }

    #[test]
    fn test_new_range_valid() {
        let range = NewIpRange::new(
            1,
            "10.0.0.0".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
            Some("10.0.0.0/30".to_string()),
            RangeSource::Cidrs,
        )
        .unwrap();
        assert_eq!(range.span(), 4);
        assert_eq!(range.ip_type(), IpType::Ipv4);
    }

    #[test]
    fn test_new_range_rejects_mixed_families() {
        let result = NewIpRange::new(
            1,
            "10.0.0.0".parse().unwrap(),
            "2606:4700::1".parse().unwrap(),
            None,
            RangeSource::Custom,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_new_range_rejects_inverted_order() {
        let result = NewIpRange::new(
            1,
            "10.0.0.9".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            None,
            RangeSource::Custom,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_single_address_span() {
        let range = NewIpRange::new(
            1,
            "1.1.1.1".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
            None,
            RangeSource::Single,
        )
        .unwrap();
        assert_eq!(range.span(), 1);
    }

    #[test]
    fn test_ipv6_span() {
        let range = NewIpRange::new(
            1,
            "2606:4700::".parse().unwrap(),
            "2606:4700::ffff".parse().unwrap(),
            None,
            RangeSource::Custom,
        )
        .unwrap();
        assert_eq!(range.span(), 0x1_0000);
    }

    #[test]
    fn test_ip_int_round_trip_v4() {
        let ip: IpAddr = "192.168.1.7".parse().unwrap();
        let back = ip_from_u128(ip_to_u128(ip), IpType::Ipv4).unwrap();
        assert_eq!(back, ip);
    }

    #[test]
    fn test_ip_int_round_trip_v6() {
        let ip: IpAddr = "2606:4700::abcd".parse().unwrap();
        let back = ip_from_u128(ip_to_u128(ip), IpType::Ipv6).unwrap();
        assert_eq!(back, ip);
    }

    #[test]
    fn test_ip_from_u128_v4_overflow() {
        assert!(ip_from_u128(u128::from(u64::MAX), IpType::Ipv4).is_err());
    }

    #[test]
    fn test_latency_stats_all_success() {
        let stats = LatencyStats::from_samples(&[10.0, 20.0, 30.0], 3).unwrap();
        assert_eq!(stats.avg_ms, 20.0);
        // population std of [10, 20, 30] = sqrt(200/3)
        assert_eq!(stats.std_ms, round4((200.0f64 / 3.0).sqrt()));
        assert_eq!(stats.loss, 0.0);
    }

    #[test]
    fn test_latency_stats_partial_loss() {
        let stats = LatencyStats::from_samples(&[12.5, 17.5], 10).unwrap();
        assert_eq!(stats.avg_ms, 15.0);
        assert_eq!(stats.loss, 0.8);
    }

    #[test]
    fn test_latency_stats_no_success() {
        assert!(LatencyStats::from_samples(&[], 10).is_none());
    }

    #[test]
    fn test_latency_stats_shape_bounds() {
        // loss in [0, 1], std >= 0, avg >= 0 for any sample set
        let stats = LatencyStats::from_samples(&[0.9, 1.4, 300.2, 2.0], 10).unwrap();
        assert!(stats.loss >= 0.0 && stats.loss <= 1.0);
        assert!(stats.std_ms >= 0.0);
        assert!(stats.avg_ms >= 0.0);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round2(1.006), 1.01);
        assert_eq!(round2(12.344), 12.34);
        assert_eq!(round4(0.123_456), 0.1235);
    }
}
