//! Read-side summary over stored records and statistic tables

use futures::TryStreamExt;
use serde::Serialize;
use std::collections::HashSet;

use crate::db::{
    AccessStat, ActivityStat, BrowserStat, Database, ErrorStat, HostFilter, RecordStore, SiteStat,
    VisitorStat,
};
use crate::error::StoreError;

const TOP_LIMIT: i32 = 10;
const ACTIVITY_LIMIT: i32 = 30;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GeneralStats {
    pub total_hits: u64,
    pub unique_visitors: u64,
    pub total_bandwidth: i64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub general: GeneralStats,
    pub recent_activity: Vec<ActivityStat>,
    pub top_pages: Vec<AccessStat>,
    pub top_visitors: Vec<VisitorStat>,
    pub top_referrers: Vec<SiteStat>,
    pub top_browsers: Vec<BrowserStat>,
    pub top_errors: Vec<ErrorStat>,
}

/// Totals over the records passing `filter`
pub async fn general_stats<S>(store: &S, filter: &HostFilter) -> Result<GeneralStats, StoreError>
where
    S: RecordStore + ?Sized,
{
    let mut stats = GeneralStats::default();
    let mut visitors = HashSet::new();

    let mut records = store.scan_records(filter);
    while let Some(record) = records.try_next().await? {
        stats.total_hits += 1;
        stats.total_bandwidth = stats.total_bandwidth.saturating_add(record.bandwidth());
        if record.status_code >= 400 {
            stats.error_count += 1;
        }
        visitors.insert(record.client_ip);
    }

    stats.unique_visitors = visitors.len() as u64;
    Ok(stats)
}

pub async fn build(db: &Database, filter: &HostFilter) -> Result<Summary, StoreError> {
    let (general, recent_activity, top_pages, top_visitors, top_referrers, top_browsers, top_errors) = tokio::try_join!(
        general_stats(db, filter),
        db.get_recent_activity(ACTIVITY_LIMIT),
        db.get_top_pages(TOP_LIMIT),
        db.get_top_visitors(TOP_LIMIT),
        db.get_top_referrer_sites(TOP_LIMIT),
        db.get_top_browsers(TOP_LIMIT),
        db.get_top_errors(TOP_LIMIT)
    )?;

    Ok(Summary {
        general,
        recent_activity,
        top_pages,
        top_visitors,
        top_referrers,
        top_browsers,
        top_errors,
    })
}
