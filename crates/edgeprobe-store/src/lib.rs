//! EdgeProbe Storage
//!
//! Async SQLite persistence for the probing pipeline:
//!
//! - [`store`]: providers, IP ranges, candidate IPs, monitors and
//!   per-provider config blobs
//! - [`results`]: the quality-gated [`results::ResultStore`] over probe
//!   measurements
//!
//! # Example
//!
//! ```no_run
//! use edgeprobe_store::Store;
//!
//! # async fn example() -> edgeprobe_core::Result<()> {
//! let store = Store::open("edgeprobe.db").await?;
//! let results = store.results();
//! let best = results.best().await?;
//! println!("best ip: {:?}", best.map(|r| r.ip));
//! # Ok(())
//! # }
//! ```

pub mod results;
pub mod store;

pub use results::ResultStore;
pub use store::Store;
