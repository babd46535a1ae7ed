//! Statistics rebuild
//!
//! One streaming scan feeds all six accumulators, then each table is
//! emptied and refilled in bounded batches. A store failure stops the pass
//! at once; the table being rebuilt keeps either its old rows (delete phase
//! not started) or is left short (delete done, insert incomplete).

mod kinds;

use futures::TryStreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::db::{HostFilter, RecordStore, StatRow, StatTable};
use crate::error::StoreError;

pub use kinds::{Accumulators, StatSet};

/// Callback receiving `(table, processed, total)` after every inserted batch
pub type ProgressFn<'a> = Box<dyn Fn(StatTable, usize, usize) + Send + Sync + 'a>;

/// Outcome of one aggregation pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct AggregateReport {
    pub records_scanned: u64,
    /// Rows written per table
    pub rows: BTreeMap<StatTable, usize>,
}

pub struct Aggregator<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    batch_size: usize,
    progress: Option<ProgressFn<'a>>,
}

impl<'a, S: RecordStore + ?Sized> Aggregator<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(StatTable, usize, usize) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Recompute every statistic table from the records passing `filter`
    pub async fn aggregate(&self, filter: &HostFilter) -> Result<AggregateReport, StoreError> {
        info!(filtered = !filter.is_empty(), "Calculating statistics...");

        let (stats, scanned) = self.compute(filter).await?;
        let mut report = AggregateReport {
            records_scanned: scanned,
            ..Default::default()
        };

        report.rows.insert(StatTable::Activity, self.rebuild(&stats.activity).await?);
        report.rows.insert(StatTable::Access, self.rebuild(&stats.access).await?);
        report.rows.insert(StatTable::Visitor, self.rebuild(&stats.visitor).await?);
        report.rows.insert(StatTable::Referrer, self.rebuild(&stats.referrer).await?);
        report.rows.insert(StatTable::Browser, self.rebuild(&stats.browser).await?);
        report.rows.insert(StatTable::Error, self.rebuild(&stats.error).await?);

        info!(records = scanned, "Statistics rebuilt");
        Ok(report)
    }

    /// Fold the filtered records into fresh rows without touching any table
    pub async fn compute(&self, filter: &HostFilter) -> Result<(StatSet, u64), StoreError> {
        let mut acc = Accumulators::default();
        let mut scanned = 0u64;

        let mut records = self.store.scan_records(filter);
        while let Some(record) = records.try_next().await? {
            acc.add(&record);
            scanned += 1;
        }

        Ok((acc.finish(), scanned))
    }

    /// Replace the contents of one table: delete in batches, then insert in batches
    async fn rebuild<T: StatRow>(&self, rows: &[T]) -> Result<usize, StoreError> {
        let table = T::TABLE;

        let mut deleted = 0;
        loop {
            let n = self.store.delete_stat_batch(table, self.batch_size).await?;
            if n == 0 {
                break;
            }
            deleted += n;
        }
        debug!(%table, deleted, "Cleared statistic table");

        let total = rows.len();
        let mut processed = 0;
        for chunk in rows.chunks(self.batch_size) {
            self.store.insert_stat_batch(T::batch(chunk)).await?;
            processed += chunk.len();
            debug!(%table, processed, total, "Statistic rows written");
            if let Some(progress) = &self.progress {
                progress(table, processed, total);
            }
        }

        info!(%table, rows = total, "Rebuilt statistic table");
        Ok(total)
    }
}
