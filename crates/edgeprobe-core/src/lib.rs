//! EdgeProbe Core Library
//!
//! Shared foundation for the EdgeProbe CDN edge-IP probing service:
//! the persistent entity types, the error taxonomy, environment and
//! per-provider configuration, and the in-process progress bus.
//!
//! # Examples
//!
//! ```
//! use edgeprobe_core::{NewIpRange, RangeSource, ProviderConfig};
//!
//! let range = NewIpRange::new(
//!     1,
//!     "10.0.0.0".parse().unwrap(),
//!     "10.0.0.3".parse().unwrap(),
//!     Some("10.0.0.0/30".into()),
//!     RangeSource::Cidrs,
//! ).unwrap();
//! assert_eq!(range.span(), 4);
//!
//! let config = ProviderConfig::default();
//! assert!(config.validate().is_ok());
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod progress;
pub mod types;

// Re-export commonly used types
pub use bus::{ProgressBus, PROGRESS_CHANNEL};
pub use config::{
    AppSettings, BrokerSettings, CurlConfig, DatabaseSettings, MonitorConfig, ProviderConfig,
    TcpingConfig,
};
pub use error::{Error, Result};
pub use progress::{ProgressEvent, ProgressStatus};
pub use types::{
    ip_from_u128, ip_to_u128, round2, round4, IpAddressRow, IpRange, IpType, LatencyStats, Monitor,
    NewIpRange, Provider, RangeSource, TestResult, SPEED_FAILED,
};
