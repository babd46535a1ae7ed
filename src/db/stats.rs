//! Statistic tables: row types, batched writes and read-time queries

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Sqlite, Transaction};

use super::Database;
use crate::error::StoreError;

/// The six derived tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatTable {
    Activity,
    Access,
    Visitor,
    Referrer,
    Browser,
    Error,
}

impl StatTable {
    pub const ALL: [StatTable; 6] = [
        StatTable::Activity,
        StatTable::Access,
        StatTable::Visitor,
        StatTable::Referrer,
        StatTable::Browser,
        StatTable::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatTable::Activity => "stat_activity",
            StatTable::Access => "stat_access",
            StatTable::Visitor => "stat_visitor",
            StatTable::Referrer => "stat_referrer",
            StatTable::Browser => "stat_browser",
            StatTable::Error => "stat_error",
        }
    }
}

impl std::fmt::Display for StatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Traffic for one hour of one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ActivityStat {
    pub date: NaiveDate,
    pub hour: i32,
    pub day_of_week: String,
    pub week: i32,
    pub month: i32,
    pub hits: i64,
    pub page_views: i64,
    pub visitors: i64,
    pub bandwidth: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct AccessStat {
    pub page: String,
    pub directory: String,
    pub file_type: String,
    pub virtual_domain: String,
    pub hits: i64,
    pub bandwidth: i64,
    pub last_access: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct VisitorStat {
    pub host: String,
    pub top_level_domain: String,
    /// Always empty: no geo lookup is performed
    pub country: String,
    pub authenticated_user: String,
    pub hits: i64,
    pub bandwidth: i64,
    pub last_visit: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ReferrerStat {
    pub site: String,
    pub url: String,
    pub search_engine: String,
    pub search_phrase: String,
    pub hits: i64,
    pub last_referral: NaiveDate,
}

/// Hits per raw user-agent string. Version, OS and device are not resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct BrowserStat {
    pub browser_type: String,
    pub version: String,
    pub operating_system: String,
    pub device_type: String,
    pub is_spider: bool,
    pub hits: i64,
    pub last_access: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ErrorStat {
    pub status_code: i32,
    pub sub_status_code: i32,
    pub win32_status: i64,
    pub page: String,
    pub count: i64,
    pub last_occurrence: NaiveDate,
}

/// A borrowed batch of rows for exactly one table
#[derive(Debug, Clone, Copy)]
pub enum StatRows<'a> {
    Activity(&'a [ActivityStat]),
    Access(&'a [AccessStat]),
    Visitor(&'a [VisitorStat]),
    Referrer(&'a [ReferrerStat]),
    Browser(&'a [BrowserStat]),
    Error(&'a [ErrorStat]),
}

impl StatRows<'_> {
    pub fn table(&self) -> StatTable {
        match self {
            StatRows::Activity(_) => StatTable::Activity,
            StatRows::Access(_) => StatTable::Access,
            StatRows::Visitor(_) => StatTable::Visitor,
            StatRows::Referrer(_) => StatTable::Referrer,
            StatRows::Browser(_) => StatTable::Browser,
            StatRows::Error(_) => StatTable::Error,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StatRows::Activity(rows) => rows.len(),
            StatRows::Access(rows) => rows.len(),
            StatRows::Visitor(rows) => rows.len(),
            StatRows::Referrer(rows) => rows.len(),
            StatRows::Browser(rows) => rows.len(),
            StatRows::Error(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A row type that belongs to one statistic table
pub trait StatRow: Send + Sync + Unpin + Sized + for<'r> FromRow<'r, SqliteRow> {
    const TABLE: StatTable;
    /// Column list, in bind order
    const COLUMNS: &'static [&'static str];

    fn batch(rows: &[Self]) -> StatRows<'_>;

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

impl StatRow for ActivityStat {
    const TABLE: StatTable = StatTable::Activity;
    const COLUMNS: &'static [&'static str] = &[
        "date",
        "hour",
        "day_of_week",
        "week",
        "month",
        "hits",
        "page_views",
        "visitors",
        "bandwidth",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Activity(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.date)
            .bind(self.hour)
            .bind(&self.day_of_week)
            .bind(self.week)
            .bind(self.month)
            .bind(self.hits)
            .bind(self.page_views)
            .bind(self.visitors)
            .bind(self.bandwidth)
    }
}

impl StatRow for AccessStat {
    const TABLE: StatTable = StatTable::Access;
    const COLUMNS: &'static [&'static str] = &[
        "page",
        "directory",
        "file_type",
        "virtual_domain",
        "hits",
        "bandwidth",
        "last_access",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Access(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.page)
            .bind(&self.directory)
            .bind(&self.file_type)
            .bind(&self.virtual_domain)
            .bind(self.hits)
            .bind(self.bandwidth)
            .bind(self.last_access)
    }
}

impl StatRow for VisitorStat {
    const TABLE: StatTable = StatTable::Visitor;
    const COLUMNS: &'static [&'static str] = &[
        "host",
        "top_level_domain",
        "country",
        "authenticated_user",
        "hits",
        "bandwidth",
        "last_visit",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Visitor(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.host)
            .bind(&self.top_level_domain)
            .bind(&self.country)
            .bind(&self.authenticated_user)
            .bind(self.hits)
            .bind(self.bandwidth)
            .bind(self.last_visit)
    }
}

impl StatRow for ReferrerStat {
    const TABLE: StatTable = StatTable::Referrer;
    const COLUMNS: &'static [&'static str] = &[
        "site",
        "url",
        "search_engine",
        "search_phrase",
        "hits",
        "last_referral",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Referrer(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.site)
            .bind(&self.url)
            .bind(&self.search_engine)
            .bind(&self.search_phrase)
            .bind(self.hits)
            .bind(self.last_referral)
    }
}

impl StatRow for BrowserStat {
    const TABLE: StatTable = StatTable::Browser;
    const COLUMNS: &'static [&'static str] = &[
        "browser_type",
        "version",
        "operating_system",
        "device_type",
        "is_spider",
        "hits",
        "last_access",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Browser(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.browser_type)
            .bind(&self.version)
            .bind(&self.operating_system)
            .bind(&self.device_type)
            .bind(self.is_spider)
            .bind(self.hits)
            .bind(self.last_access)
    }
}

impl StatRow for ErrorStat {
    const TABLE: StatTable = StatTable::Error;
    const COLUMNS: &'static [&'static str] = &[
        "status_code",
        "sub_status_code",
        "win32_status",
        "page",
        "count",
        "last_occurrence",
    ];

    fn batch(rows: &[Self]) -> StatRows<'_> {
        StatRows::Error(rows)
    }

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.status_code)
            .bind(self.sub_status_code)
            .bind(self.win32_status)
            .bind(&self.page)
            .bind(self.count)
            .bind(self.last_occurrence)
    }
}

fn insert_sql<T: StatRow>() -> String {
    let placeholders = vec!["?"; T::COLUMNS.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        T::TABLE.name(),
        T::COLUMNS.join(", "),
        placeholders
    )
}

async fn insert_typed<T: StatRow>(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[T],
) -> Result<u64, StoreError> {
    let sql = insert_sql::<T>();
    for row in rows {
        row.bind(sqlx::query(&sql)).execute(&mut **tx).await?;
    }
    Ok(rows.len() as u64)
}

pub(super) async fn insert_rows(
    tx: &mut Transaction<'_, Sqlite>,
    rows: StatRows<'_>,
) -> Result<u64, StoreError> {
    match rows {
        StatRows::Activity(rows) => insert_typed(tx, rows).await,
        StatRows::Access(rows) => insert_typed(tx, rows).await,
        StatRows::Visitor(rows) => insert_typed(tx, rows).await,
        StatRows::Referrer(rows) => insert_typed(tx, rows).await,
        StatRows::Browser(rows) => insert_typed(tx, rows).await,
        StatRows::Error(rows) => insert_typed(tx, rows).await,
    }
}

/// Hits per referring site, summed over every referrer URL on that site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteStat {
    pub site: String,
    pub hits: i64,
}

impl Database {
    /// Every row of one table, in insertion order
    #[cfg(test)]
    pub async fn get_stat_rows<T: StatRow>(&self) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id",
            T::COLUMNS.join(", "),
            T::TABLE.name()
        );
        Ok(sqlx::query_as::<_, T>(&sql).fetch_all(&self.pool).await?)
    }

    pub async fn get_top_pages(&self, limit: i32) -> Result<Vec<AccessStat>, StoreError> {
        self.get_top::<AccessStat>("hits DESC, page ASC", limit).await
    }

    pub async fn get_top_visitors(&self, limit: i32) -> Result<Vec<VisitorStat>, StoreError> {
        self.get_top::<VisitorStat>("hits DESC, host ASC", limit).await
    }

    pub async fn get_top_browsers(&self, limit: i32) -> Result<Vec<BrowserStat>, StoreError> {
        self.get_top::<BrowserStat>("hits DESC, browser_type ASC", limit)
            .await
    }

    pub async fn get_top_errors(&self, limit: i32) -> Result<Vec<ErrorStat>, StoreError> {
        self.get_top::<ErrorStat>(
            "count DESC, status_code ASC, sub_status_code ASC, win32_status ASC, page ASC",
            limit,
        )
        .await
    }

    pub async fn get_top_referrer_sites(&self, limit: i32) -> Result<Vec<SiteStat>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT site, SUM(hits) as hits
            FROM stat_referrer
            GROUP BY site
            ORDER BY hits DESC, site ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(site, hits)| SiteStat { site, hits })
            .collect())
    }

    /// Most recent hourly buckets, returned oldest first
    pub async fn get_recent_activity(&self, limit: i32) -> Result<Vec<ActivityStat>, StoreError> {
        let mut rows = self
            .get_top::<ActivityStat>("date DESC, hour DESC", limit)
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn get_top<T: StatRow>(&self, order_by: &str, limit: i32) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT ?",
            T::COLUMNS.join(", "),
            T::TABLE.name(),
            order_by
        );
        Ok(sqlx::query_as::<_, T>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::scratch_db;
    use crate::db::RecordStore;

    fn access(page: &str, hits: i64) -> AccessStat {
        AccessStat {
            page: page.to_string(),
            directory: "/".to_string(),
            file_type: String::new(),
            virtual_domain: String::new(),
            hits,
            bandwidth: hits * 100,
            last_access: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    #[test]
    fn insert_statement_lists_every_column() {
        assert_eq!(
            insert_sql::<ErrorStat>(),
            "INSERT INTO stat_error (status_code, sub_status_code, win32_status, page, count, last_occurrence) VALUES (?, ?, ?, ?, ?, ?)"
        );
    }

    #[tokio::test]
    async fn stat_rows_round_trip_through_the_table() {
        let (_dir, db) = scratch_db().await;
        let rows = vec![access("/a", 3), access("/b", 5)];

        let written = db.insert_stat_batch(AccessStat::batch(&rows)).await.unwrap();

        assert_eq!(written, 2);
        assert_eq!(db.get_stat_rows::<AccessStat>().await.unwrap(), rows);
    }

    #[tokio::test]
    async fn top_queries_sort_at_read_time() {
        let (_dir, db) = scratch_db().await;
        let rows = vec![access("/c", 2), access("/a", 9), access("/b", 2)];
        db.insert_stat_batch(AccessStat::batch(&rows)).await.unwrap();

        let top: Vec<String> = db
            .get_top_pages(2)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.page)
            .collect();

        assert_eq!(top, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn stat_deletes_are_bounded() {
        let (_dir, db) = scratch_db().await;
        let rows: Vec<AccessStat> = (0..5).map(|i| access(&format!("/{i}"), i)).collect();
        db.insert_stat_batch(AccessStat::batch(&rows)).await.unwrap();

        assert_eq!(db.delete_stat_batch(StatTable::Access, 3).await.unwrap(), 3);
        assert_eq!(db.get_stat_count(StatTable::Access).await.unwrap(), 2);
        assert_eq!(db.get_stat_count(StatTable::Visitor).await.unwrap(), 0);
    }
}
