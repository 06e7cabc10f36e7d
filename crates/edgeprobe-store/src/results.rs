//! Quality-gated result store
//!
//! Write-through layer over the `test_results` table. Rows are keyed by
//! bare IP: a later probe of an address shared between providers
//! overwrites the earlier result. Latency upserts replace the latency
//! triple only; bandwidth is an independent update with `-1.0` as the
//! explicit failed-download sentinel.
//!
//! Ranking is deterministic: `top_n` orders by `(avg_latency ASC,
//! packet_loss DESC)` with ties broken by `ip ASC`; `best` prefers any
//! speed-tested row, then the smallest standard deviation.

use crate::store::Store;
use chrono::{DateTime, Utc};
use edgeprobe_core::{Error, LatencyStats, Result, TestResult, SPEED_FAILED};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::net::IpAddr;
use tracing::debug;

/// Store for probe results with gated retention
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl Store {
    /// Result store sharing this store's connection pool
    pub fn results(&self) -> ResultStore {
        ResultStore {
            pool: self.pool().clone(),
        }
    }
}

impl ResultStore {
    /// Insert or refresh the latency triple for an IP
    ///
    /// On conflict only the latency fields and `test_time` are replaced;
    /// an earlier `download_speed` survives until its own update.
    pub async fn upsert_latency(&self, ip: IpAddr, stats: &LatencyStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_results
                (ip, avg_latency, std_deviation, packet_loss, is_locked, is_delete, test_time)
            VALUES (?, ?, ?, ?, 0, 0, ?)
            ON CONFLICT (ip) DO UPDATE SET
                avg_latency = excluded.avg_latency,
                std_deviation = excluded.std_deviation,
                packet_loss = excluded.packet_loss,
                test_time = excluded.test_time
            "#,
        )
        .bind(ip.to_string())
        .bind(stats.avg_ms)
        .bind(stats.std_ms)
        .bind(stats.loss)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to upsert latency result: {}", e)))?;

        Ok(())
    }

    /// Set the measured download speed; `-1.0` marks a failed download
    ///
    /// Returns `false` when no result row exists for the IP.
    pub async fn update_speed(&self, ip: IpAddr, speed: f64) -> Result<bool> {
        let result = sqlx::query("UPDATE test_results SET download_speed = ? WHERE ip = ?")
            .bind(speed)
            .bind(ip.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to update download speed: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one result row
    pub async fn get(&self, ip: IpAddr) -> Result<Option<TestResult>> {
        let row = sqlx::query(
            r#"
            SELECT ip, avg_latency, std_deviation, packet_loss, download_speed,
                   is_locked, is_delete, test_time
            FROM test_results
            WHERE ip = ?
            "#,
        )
        .bind(ip.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch result: {}", e)))?;

        row.map(result_from_row).transpose()
    }

    /// The `n` best rows by `(avg_latency ASC, packet_loss DESC, ip ASC)`
    pub async fn top_n(&self, n: usize) -> Result<Vec<TestResult>> {
        let rows = sqlx::query(
            r#"
            SELECT ip, avg_latency, std_deviation, packet_loss, download_speed,
                   is_locked, is_delete, test_time
            FROM test_results
            WHERE is_delete = 0
            ORDER BY avg_latency ASC, packet_loss DESC, ip ASC
            LIMIT ?
            "#,
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch top results: {}", e)))?;

        rows.into_iter().map(result_from_row).collect()
    }

    /// Just the addresses of [`ResultStore::top_n`]
    pub async fn better_ips(&self, n: usize) -> Result<Vec<IpAddr>> {
        Ok(self.top_n(n).await?.into_iter().map(|r| r.ip).collect())
    }

    /// The single best row: speed-tested rows first, then smallest
    /// standard deviation
    pub async fn best(&self) -> Result<Option<TestResult>> {
        let row = sqlx::query(
            r#"
            SELECT ip, avg_latency, std_deviation, packet_loss, download_speed,
                   is_locked, is_delete, test_time
            FROM test_results
            WHERE is_delete = 0
            ORDER BY (download_speed IS NOT NULL) DESC, std_deviation ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch best result: {}", e)))?;

        row.map(result_from_row).transpose()
    }

    /// Hard-delete rows outside the latency gates; idempotent
    pub async fn prune_by_latency_gate(&self, max_avg: f64, max_loss: f64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM test_results WHERE avg_latency > ? OR packet_loss > ?")
                .bind(max_avg)
                .bind(max_loss)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Storage(format!("Failed to prune by latency gate: {}", e)))?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(
                "Pruned {} results over gates (avg > {} or loss > {})",
                pruned, max_avg, max_loss
            );
        }
        Ok(pruned)
    }

    /// Hard-delete rows carrying the failed-download sentinel
    pub async fn prune_speed_failures(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM test_results WHERE download_speed = ?")
            .bind(SPEED_FAILED)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to prune speed failures: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Any row speed-tested yet?
    pub async fn has_speed_value(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM test_results WHERE download_speed IS NOT NULL)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to check speed values: {}", e)))?;
        Ok(row.get::<i64, _>(0) != 0)
    }

    /// Remove one row
    pub async fn delete(&self, ip: IpAddr) -> Result<()> {
        sqlx::query("DELETE FROM test_results WHERE ip = ?")
            .bind(ip.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete result: {}", e)))?;
        Ok(())
    }

    /// Tombstone one row without removing it
    pub async fn soft_delete(&self, ip: IpAddr) -> Result<()> {
        sqlx::query("UPDATE test_results SET is_delete = 1 WHERE ip = ?")
            .bind(ip.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to soft-delete result: {}", e)))?;
        Ok(())
    }

    /// Set the advisory freeze flag (reserved; probers do not consult it)
    pub async fn lock(&self, ip: IpAddr) -> Result<()> {
        self.set_locked(ip, true).await
    }

    /// Clear the advisory freeze flag
    pub async fn unlock(&self, ip: IpAddr) -> Result<()> {
        self.set_locked(ip, false).await
    }

    async fn set_locked(&self, ip: IpAddr, locked: bool) -> Result<()> {
        sqlx::query("UPDATE test_results SET is_locked = ? WHERE ip = ?")
            .bind(locked)
            .bind(ip.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to set lock flag: {}", e)))?;
        Ok(())
    }

    /// Live row count (tombstoned rows excluded)
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM test_results WHERE is_delete = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to count results: {}", e)))?;
        Ok(row.get(0))
    }
}

fn result_from_row(row: SqliteRow) -> Result<TestResult> {
    let ip_raw: String = row.get(0);
    Ok(TestResult {
        ip: ip_raw
            .parse()
            .map_err(|e| Error::Parse(format!("Invalid IP in database: {}", e)))?,
        avg_latency: row.get(1),
        std_deviation: row.get(2),
        packet_loss: row.get(3),
        download_speed: row.get(4),
        is_locked: row.get::<i64, _>(5) != 0,
        is_delete: row.get::<i64, _>(6) != 0,
        test_time: row.get::<DateTime<Utc>, _>(7),
    })
}
