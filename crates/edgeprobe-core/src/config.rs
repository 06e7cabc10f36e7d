//! Configuration for EdgeProbe
//!
//! Two layers live here:
//!
//! 1. **Process settings** read from the environment at startup:
//!    [`DatabaseSettings`] and [`BrokerSettings`], using the variable
//!    names of the deployment (`DATABASE_*`/`POSTGRES_*` and `REDIS_*`).
//! 2. **Per-provider probe settings** stored as JSON blobs in the
//!    `config` table: [`TcpingConfig`], [`CurlConfig`] and
//!    [`MonitorConfig`], bundled as [`ProviderConfig`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Relational store settings
///
/// Pool bounds are fixed: writers never serialize themselves, the pool
/// does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "netguard".to_string(),
            user: None,
            password: None,
            pool_min: 15,
            pool_max: 30,
        }
    }
}

impl DatabaseSettings {
    /// Read settings from `DATABASE_HOST`, `DATABASE_PORT`, `POSTGRES_DB`,
    /// `POSTGRES_USER` and `POSTGRES_PASSWORD`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("DATABASE_HOST", &defaults.host),
            port: env_parse("DATABASE_PORT", defaults.port)?,
            database: env_or("POSTGRES_DB", &defaults.database),
            user: env::var("POSTGRES_USER").ok(),
            password: env::var("POSTGRES_PASSWORD").ok(),
            pool_min: defaults.pool_min,
            pool_max: defaults.pool_max,
        })
    }

    /// On-disk database file derived from the configured database name
    pub fn database_file(&self) -> String {
        format!("{}.db", self.database)
    }
}

/// Queue broker settings (`REDIS_*` variables; auth optional)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    pub ssl: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            ssl: false,
        }
    }
}

impl BrokerSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("REDIS_HOST", &defaults.host),
            port: env_parse("REDIS_PORT", defaults.port)?,
            db: env_parse("REDIS_DB", defaults.db)?,
            password: env::var("REDIS_PASSWORD").ok(),
            ssl: env_parse("REDIS_SSL", defaults.ssl)?,
        })
    }
}

/// Everything the process reads from the environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
}

impl AppSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseSettings::from_env()?,
            broker: BrokerSettings::from_env()?,
        })
    }
}

/// TCP latency probe settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpingConfig {
    pub port: u16,
    pub enable: bool,
    /// Per-attempt connect timeout, seconds
    pub time_out: u64,
    /// Retention gate: maximum acceptable mean latency, milliseconds
    pub avg_latency: f64,
    /// Retention gate: maximum acceptable loss ratio in `[0, 1]`
    pub packet_loss: f64,
    /// Informational bound carried in the blob; not gated on
    pub std_deviation: f64,
    pub ip_v4_enable: bool,
    pub ip_v6_enable: bool,
    /// Target number of retained IPs per run
    pub count: usize,
}

impl Default for TcpingConfig {
    fn default() -> Self {
        Self {
            port: 443,
            enable: true,
            time_out: 1,
            avg_latency: 200.0,
            packet_loss: 0.2,
            std_deviation: 100.0,
            ip_v4_enable: true,
            ip_v6_enable: false,
            count: 30,
        }
    }
}

impl TcpingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.time_out == 0 {
            return Err(Error::Config("tcping time_out must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.packet_loss) {
            return Err(Error::Config(
                "tcping packet_loss must be within [0, 1]".to_string(),
            ));
        }
        if self.avg_latency <= 0.0 {
            return Err(Error::Config(
                "tcping avg_latency must be positive".to_string(),
            ));
        }
        if self.count == 0 {
            return Err(Error::Config("tcping count must be positive".to_string()));
        }
        Ok(())
    }
}

/// Bandwidth probe settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurlConfig {
    pub port: u16,
    /// Retention gate: minimum acceptable download speed, MB/s
    pub speed: f64,
    pub enable: bool,
    /// Download wall-clock budget, seconds
    pub time_out: u64,
    pub download_url: Option<String>,
    pub ip_v4_enable: bool,
    pub ip_v6_enable: bool,
    /// How many top-ranked IPs to speed-test
    pub count: usize,
}

impl Default for CurlConfig {
    fn default() -> Self {
        Self {
            port: 443,
            speed: 5.0,
            enable: true,
            time_out: 10,
            download_url: None,
            ip_v4_enable: true,
            ip_v6_enable: false,
            count: 5,
        }
    }
}

impl CurlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.time_out == 0 {
            return Err(Error::Config("curl time_out must be positive".to_string()));
        }
        if self.speed < 0.0 {
            return Err(Error::Config("curl speed must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Best-set maintenance settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Size of the maintained best-IP set
    pub count: usize,
    pub auto_fill: bool,
    /// Refill threshold for the best set
    pub min_count: usize,
    /// Providers enrolled in scheduled monitoring
    pub providers: Vec<i64>,
    pub auto_delete: bool,
    /// How many best IPs get a bandwidth test each cycle
    pub download_test_number: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            count: 30,
            auto_fill: false,
            min_count: 10,
            providers: Vec::new(),
            auto_delete: false,
            download_test_number: 5,
        }
    }
}

/// The JSON blob persisted per provider in the `config` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub tcping: TcpingConfig,
    #[serde(default)]
    pub curl: CurlConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl ProviderConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ProviderConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.tcping.validate()?;
        self.curl.validate()?;
        Ok(())
    }
}
