//! SQLite-backed store for providers, ranges and candidate IPs
//!
//! Provides async storage over the four persistent entities with:
//! - Transaction-based batch inserts with multi-row VALUES
//! - WAL mode for concurrent access
//! - Automatic schema initialization
//! - Soft-deleted providers excluded from default queries
//!
//! # Write discipline
//!
//! All writes go through the connection pool; callers never serialize
//! themselves. Range rewrites are atomic per `(provider, source)`:
//! delete-by-source then insert, in one transaction. Candidate IP rows
//! are rewritten wholesale per provider: `delete_ips_by_provider`
//! followed by batched `insert_ips_batch` calls driven by the expander.

use chrono::{DateTime, Utc};
use edgeprobe_core::{
    DatabaseSettings, Error, IpRange, IpType, Monitor, NewIpRange, Provider, ProviderConfig,
    RangeSource, Result,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Rows per multi-row INSERT; SQLite's parameter limit is 999 and the
/// widest statement here binds 5 columns per row
const ROWS_PER_QUERY: usize = 150;

/// Store over the relational schema
///
/// Cheap to clone; all clones share one connection pool.
///
/// # Examples
///
/// ```no_run
/// use edgeprobe_store::Store;
///
/// # async fn example() -> edgeprobe_core::Result<()> {
/// let store = Store::open("edgeprobe.db").await?;
/// let provider = store.create_provider("cloudflare", None, None).await?;
/// assert!(!provider.deleted);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path`
    ///
    /// The pool keeps between 15 and 30 connections; WAL mode is enabled
    /// so readers and writers do not block each other.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_pool(path, 15, 30).await
    }

    /// Open using the environment-derived settings
    pub async fn from_settings(settings: &DatabaseSettings) -> Result<Self> {
        Self::open_with_pool(
            settings.database_file(),
            settings.pool_min,
            settings.pool_max,
        )
        .await
    }

    async fn open_with_pool<P: AsRef<Path>>(path: P, min: u32, max: u32) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| Error::Storage(format!("Invalid database path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .connect_with(options)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to database: {}", e)))?;

        info!("Connected to database: {}", path_str);

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Shared pool handle for sibling stores
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        debug!("Initializing database schema");

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await
            .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_url TEXT,
                logo_url TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create providers table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_ranges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL,
                start_ip TEXT NOT NULL,
                end_ip TEXT NOT NULL,
                cidr TEXT,
                source TEXT NOT NULL,
                FOREIGN KEY (provider_id) REFERENCES providers(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create ip_ranges table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL,
                ip_address TEXT NOT NULL,
                ip_type TEXT NOT NULL,
                FOREIGN KEY (provider_id) REFERENCES providers(id) ON DELETE CASCADE,
                UNIQUE (provider_id, ip_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create ip_addresses table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS test_results (
                ip TEXT PRIMARY KEY,
                avg_latency REAL,
                std_deviation REAL,
                packet_loss REAL,
                download_speed REAL,
                is_locked INTEGER NOT NULL DEFAULT 0,
                is_delete INTEGER NOT NULL DEFAULT 0,
                test_time TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create test_results table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL UNIQUE,
                enable INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (provider_id) REFERENCES providers(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create monitors table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS configs (
                provider_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                FOREIGN KEY (provider_id) REFERENCES providers(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create configs table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ranges_provider ON ip_ranges(provider_id)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ips_provider ON ip_addresses(provider_id)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_results_latency ON test_results(avg_latency, packet_loss)",
        )
        .execute(&self.pool)
        .await
        .ok();

        debug!("Database schema initialized");
        Ok(())
    }

    // ---- providers ----

    /// Create a provider; `name` must be non-empty
    pub async fn create_provider(
        &self,
        name: &str,
        api_url: Option<&str>,
        logo_url: Option<&str>,
    ) -> Result<Provider> {
        if name.trim().is_empty() {
            return Err(Error::Validation("provider name must not be empty".into()));
        }

        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO providers (name, api_url, logo_url, deleted, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(api_url)
        .bind(logo_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create provider: {}", e)))?;

        let id: i64 = row.get(0);
        debug!("Created provider {} ({})", name, id);

        Ok(Provider {
            id,
            name: name.to_string(),
            api_url: api_url.map(String::from),
            logo_url: logo_url.map(String::from),
            deleted: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Update name and/or logo URL; absent fields are left untouched
    pub async fn update_provider(
        &self,
        id: i64,
        name: Option<&str>,
        logo_url: Option<&str>,
    ) -> Result<Provider> {
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(Error::Validation("provider name must not be empty".into()));
            }
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE providers
            SET name = COALESCE(?, name),
                logo_url = COALESCE(?, logo_url),
                updated_at = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(name)
        .bind(logo_url)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to update provider: {}", e)))?;

        self.get_provider(id)
            .await?
            .ok_or_else(|| Error::Validation(format!("provider {} not found", id)))
    }

    /// Fetch a live (non-tombstoned) provider
    pub async fn get_provider(&self, id: i64) -> Result<Option<Provider>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, api_url, logo_url, deleted, created_at, updated_at
            FROM providers
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch provider: {}", e)))?;

        row.map(provider_from_row).transpose()
    }

    /// All live providers
    pub async fn list_providers(&self) -> Result<Vec<Provider>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, api_url, logo_url, deleted, created_at, updated_at
            FROM providers
            WHERE deleted = 0
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to list providers: {}", e)))?;

        rows.into_iter().map(provider_from_row).collect()
    }

    /// Mark a provider as deleted without dropping its rows
    pub async fn soft_delete_provider(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE providers SET deleted = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to soft-delete provider: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("provider {} not found", id)));
        }
        Ok(())
    }

    // ---- ip ranges ----

    /// Replace the provider's ranges for one source atomically
    ///
    /// Ranges of other sources are untouched. All new ranges must belong
    /// to `provider_id` and carry `source`.
    pub async fn replace_ranges(
        &self,
        provider_id: i64,
        source: RangeSource,
        ranges: &[NewIpRange],
    ) -> Result<()> {
        for range in ranges {
            if range.provider_id != provider_id || range.source != source {
                return Err(Error::Validation(
                    "range batch does not match provider/source".into(),
                ));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query("DELETE FROM ip_ranges WHERE provider_id = ? AND source = ?")
            .bind(provider_id)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete old ranges: {}", e)))?;

        for chunk in ranges.chunks(ROWS_PER_QUERY) {
            let placeholders: Vec<&str> = (0..chunk.len()).map(|_| "(?, ?, ?, ?, ?)").collect();
            let query_str = format!(
                "INSERT INTO ip_ranges (provider_id, start_ip, end_ip, cidr, source) VALUES {}",
                placeholders.join(", ")
            );

            let mut query = sqlx::query(&query_str);
            for range in chunk {
                query = query
                    .bind(range.provider_id)
                    .bind(range.start_ip.to_string())
                    .bind(range.end_ip.to_string())
                    .bind(&range.cidr)
                    .bind(range.source.as_str());
            }

            query
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(format!("Failed to insert range batch: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit transaction: {}", e)))?;

        debug!(
            "Replaced {} ranges for provider {} source {}",
            ranges.len(),
            provider_id,
            source
        );
        Ok(())
    }

    /// All ranges of a provider, every source
    pub async fn ranges_for_provider(&self, provider_id: i64) -> Result<Vec<IpRange>> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider_id, start_ip, end_ip, cidr, source
            FROM ip_ranges
            WHERE provider_id = ?
            ORDER BY id
            "#,
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch ranges: {}", e)))?;

        rows.into_iter().map(range_from_row).collect()
    }

    // ---- candidate ip addresses ----

    /// Drop every candidate IP row of a provider (pre-rewrite cascade)
    pub async fn delete_ips_by_provider(&self, provider_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ip_addresses WHERE provider_id = ?")
            .bind(provider_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete candidate IPs: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Insert one batch of candidate IPs
    ///
    /// Duplicates within the provider are silently dropped by the unique
    /// index (IPv6 sampling tolerates duplicates upstream). Returns the
    /// number of rows the caller attempted to insert.
    pub async fn insert_ips_batch(
        &self,
        provider_id: i64,
        ips: &[(IpAddr, IpType)],
    ) -> Result<usize> {
        if ips.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        for chunk in ips.chunks(ROWS_PER_QUERY) {
            let placeholders: Vec<&str> = (0..chunk.len()).map(|_| "(?, ?, ?)").collect();
            let query_str = format!(
                "INSERT INTO ip_addresses (provider_id, ip_address, ip_type) VALUES {} \
                 ON CONFLICT (provider_id, ip_address) DO NOTHING",
                placeholders.join(", ")
            );

            let mut query = sqlx::query(&query_str);
            for (ip, ip_type) in chunk {
                query = query
                    .bind(provider_id)
                    .bind(ip.to_string())
                    .bind(ip_type.as_str());
            }

            query
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(format!("Failed to insert IP batch: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit transaction: {}", e)))?;

        Ok(ips.len())
    }

    /// Stored candidate count for a provider
    pub async fn count_ips(&self, provider_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM ip_addresses WHERE provider_id = ?")
            .bind(provider_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to count candidate IPs: {}", e)))?;
        Ok(row.get(0))
    }

    /// Candidate IPs of one family, optionally shuffled and capped
    pub async fn candidate_ips(
        &self,
        provider_id: i64,
        ip_type: IpType,
        limit: Option<usize>,
        randomize: bool,
    ) -> Result<Vec<IpAddr>> {
        let order = if randomize { "RANDOM()" } else { "id" };
        let query_str = format!(
            "SELECT ip_address FROM ip_addresses \
             WHERE provider_id = ? AND ip_type = ? ORDER BY {} LIMIT ?",
            order
        );

        let rows = sqlx::query(&query_str)
            .bind(provider_id)
            .bind(ip_type.as_str())
            .bind(limit.map(|n| n as i64).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch candidate IPs: {}", e)))?;

        let mut ips = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get(0);
            ips.push(
                raw.parse()
                    .map_err(|e| Error::Parse(format!("Invalid IP in database: {}", e)))?,
            );
        }
        Ok(ips)
    }

    // ---- monitors ----

    /// The provider's monitor row, if enrolled
    pub async fn monitor_for_provider(&self, provider_id: i64) -> Result<Option<Monitor>> {
        let row = sqlx::query("SELECT id, provider_id, enable FROM monitors WHERE provider_id = ?")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch monitor: {}", e)))?;

        Ok(row.map(|row| Monitor {
            id: row.get(0),
            provider_id: row.get(1),
            enable: row.get::<i64, _>(2) != 0,
        }))
    }

    /// Enroll a provider (no-op when already enrolled)
    pub async fn create_monitor(&self, provider_id: i64, enable: bool) -> Result<Monitor> {
        sqlx::query(
            "INSERT INTO monitors (provider_id, enable) VALUES (?, ?) \
             ON CONFLICT (provider_id) DO NOTHING",
        )
        .bind(provider_id)
        .bind(enable)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create monitor: {}", e)))?;

        self.monitor_for_provider(provider_id)
            .await?
            .ok_or_else(|| Error::Storage("monitor row missing after insert".into()))
    }

    /// Providers currently enrolled with monitoring switched on
    pub async fn enabled_monitor_providers(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT provider_id FROM monitors WHERE enable = 1 ORDER BY provider_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to list monitored providers: {}", e)))?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Flip the enable flag
    pub async fn set_monitor_enabled(&self, provider_id: i64, enable: bool) -> Result<()> {
        let result = sqlx::query("UPDATE monitors SET enable = ? WHERE provider_id = ?")
            .bind(enable)
            .bind(provider_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to update monitor: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!(
                "provider {} has no monitor row",
                provider_id
            )));
        }
        Ok(())
    }

    // ---- per-provider config blobs ----

    /// The provider's probe configuration; defaults when never written
    pub async fn provider_config(&self, provider_id: i64) -> Result<ProviderConfig> {
        let row = sqlx::query("SELECT data FROM configs WHERE provider_id = ?")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch config: {}", e)))?;

        match row {
            Some(row) => {
                let raw: String = row.get(0);
                ProviderConfig::from_json(&raw)
            }
            None => Ok(ProviderConfig::default()),
        }
    }

    /// Persist the provider's probe configuration blob
    pub async fn put_provider_config(
        &self,
        provider_id: i64,
        config: &ProviderConfig,
    ) -> Result<()> {
        config.validate()?;
        let raw = config.to_json()?;

        sqlx::query(
            "INSERT INTO configs (provider_id, data) VALUES (?, ?) \
             ON CONFLICT (provider_id) DO UPDATE SET data = excluded.data",
        )
        .bind(provider_id)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to store config: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn provider_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Provider> {
    Ok(Provider {
        id: row.get(0),
        name: row.get(1),
        api_url: row.get(2),
        logo_url: row.get(3),
        deleted: row.get::<i64, _>(4) != 0,
        created_at: row.get::<DateTime<Utc>, _>(5),
        updated_at: row.get::<DateTime<Utc>, _>(6),
    })
}

fn range_from_row(row: sqlx::sqlite::SqliteRow) -> Result<IpRange> {
    let start_raw: String = row.get(2);
    let end_raw: String = row.get(3);
    let source_raw: String = row.get(5);

    Ok(IpRange {
        id: row.get(0),
        provider_id: row.get(1),
        start_ip: start_raw
            .parse()
            .map_err(|e| Error::Parse(format!("Invalid start_ip in database: {}", e)))?,
        end_ip: end_raw
            .parse()
            .map_err(|e| Error::Parse(format!("Invalid end_ip in database: {}", e)))?,
        cidr: row.get(4),
        source: source_raw.parse()?,
    })
}
