//! Database module

mod schema;
mod stats;
mod write_buffer;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::collections::HashSet;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::StoreError;

pub use stats::{
    AccessStat, ActivityStat, BrowserStat, ErrorStat, ReferrerStat, SiteStat, StatRow, StatRows,
    StatTable, VisitorStat,
};
pub use write_buffer::{RecordBuffer, DEFAULT_BATCH_SIZE};

/// One accepted line of a W3C access log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogRecord {
    pub file_name: String,
    pub date: NaiveDate,
    pub time: String,
    pub server_ip: String,
    pub method: String,
    pub uri_stem: String,
    pub uri_query: String,
    pub port: i32,
    pub username: String,
    pub client_ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub status_code: i32,
    pub sub_status_code: i32,
    pub win32_status: i64,
    pub time_taken: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

impl LogRecord {
    /// Bytes moved in both directions
    pub fn bandwidth(&self) -> i64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

/// Restricts a scan to records served by or requested from the given hosts.
///
/// An empty filter lets every record through.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    hosts: HashSet<String>,
}

impl HostFilter {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(Into::<String>::into)
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.is_empty()
            || self.hosts.contains(&record.server_ip)
            || self.hosts.contains(&record.client_ip)
    }
}

/// Storage the pipeline reads from and writes to.
///
/// Every write method runs inside a single transaction, so callers bound
/// transaction size by bounding the batch they pass in.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Source files that already have at least one stored record
    async fn list_distinct_source_files(&self) -> Result<HashSet<String>, StoreError>;

    async fn insert_records(&self, batch: &[LogRecord]) -> Result<u64, StoreError>;

    fn scan_records(&self, filter: &HostFilter) -> BoxStream<'_, Result<LogRecord, StoreError>>;

    /// Delete up to `limit` log records, returning how many went
    async fn delete_record_batch(&self, limit: usize) -> Result<u64, StoreError>;

    /// Delete up to `limit` records that came from one source file
    async fn delete_source_file_batch(
        &self,
        file_name: &str,
        limit: usize,
    ) -> Result<u64, StoreError>;

    /// Delete up to `limit` rows of one statistic table, returning how many went
    async fn delete_stat_batch(&self, table: StatTable, limit: usize) -> Result<u64, StoreError>;

    async fn insert_stat_batch(&self, rows: StatRows<'_>) -> Result<u64, StoreError>;
}

const SELECT_RECORDS: &str = r#"
SELECT file_name, date, time, server_ip, method, uri_stem, uri_query, port, username, client_ip,
       user_agent, referrer, status_code, sub_status_code, win32_status, time_taken, bytes_sent, bytes_received
FROM log_entries
ORDER BY id
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO log_entries (file_name, date, time, server_ip, method, uri_stem, uri_query, port, username, client_ip,
                         user_agent, referrer, status_code, sub_status_code, win32_status, time_taken, bytes_sent, bytes_received)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        // WAL keeps readers off the writer's back during long rebuilds
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn get_total_count(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM log_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    #[cfg(test)]
    pub async fn get_stat_count(&self, table: StatTable) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(row.0)
    }
}

#[async_trait]
impl RecordStore for Database {
    async fn list_distinct_source_files(&self) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT file_name FROM log_entries")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn insert_records(&self, batch: &[LogRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in batch {
            sqlx::query(INSERT_RECORD)
                .bind(&record.file_name)
                .bind(record.date)
                .bind(&record.time)
                .bind(&record.server_ip)
                .bind(&record.method)
                .bind(&record.uri_stem)
                .bind(&record.uri_query)
                .bind(record.port)
                .bind(&record.username)
                .bind(&record.client_ip)
                .bind(&record.user_agent)
                .bind(&record.referrer)
                .bind(record.status_code)
                .bind(record.sub_status_code)
                .bind(record.win32_status)
                .bind(record.time_taken)
                .bind(record.bytes_sent)
                .bind(record.bytes_received)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(count = batch.len(), "Inserted log records");
        Ok(batch.len() as u64)
    }

    fn scan_records(&self, filter: &HostFilter) -> BoxStream<'_, Result<LogRecord, StoreError>> {
        let filter = filter.clone();
        sqlx::query_as::<_, LogRecord>(SELECT_RECORDS)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .try_filter(move |record| futures::future::ready(filter.matches(record)))
            .boxed()
    }

    async fn delete_record_batch(&self, limit: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM log_entries WHERE id IN (SELECT id FROM log_entries LIMIT ?)",
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_source_file_batch(
        &self,
        file_name: &str,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM log_entries WHERE id IN (SELECT id FROM log_entries WHERE file_name = ? LIMIT ?)",
        )
        .bind(file_name)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_stat_batch(&self, table: StatTable, limit: usize) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {t} WHERE id IN (SELECT id FROM {t} LIMIT ?)",
            t = table.name()
        );
        let result = sqlx::query(&sql)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_stat_batch(&self, rows: StatRows<'_>) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = rows.table();
        let mut tx = self.pool.begin().await?;
        let count = stats::insert_rows(&mut tx, rows).await?;
        tx.commit().await?;

        debug!(%table, count, "Inserted statistic rows");
        Ok(count)
    }
}
