//! Write buffer for batched record inserts
//!
//! Records are collected in memory and written in fixed-size batches, one
//! transaction per batch. A flushed batch is durable; whatever is still
//! buffered when a run dies is simply re-read on the next run.

use tracing::debug;

use super::{LogRecord, RecordStore};
use crate::error::StoreError;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

pub struct RecordBuffer {
    buffer: Vec<LogRecord>,
    batch_size: usize,
    flushed: u64,
}

impl RecordBuffer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flushed: 0,
        }
    }

    /// Queue a record, flushing immediately if the batch is full
    pub async fn push<S>(&mut self, store: &S, record: LogRecord) -> Result<(), StoreError>
    where
        S: RecordStore + ?Sized,
    {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush(store).await?;
        }
        Ok(())
    }

    /// Write whatever is buffered in a single transaction.
    ///
    /// On failure the buffered records are dropped: they belong to a file
    /// that will be retried as a whole.
    pub async fn flush<S>(&mut self, store: &S) -> Result<(), StoreError>
    where
        S: RecordStore + ?Sized,
    {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let count = self.buffer.len();
        debug!("Flushing {} records to database", count);

        let result = store.insert_records(&self.buffer).await;
        self.buffer.clear();
        self.flushed += result?;
        Ok(())
    }

    /// Records written so far
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{record, scratch_db};

    #[tokio::test]
    async fn flushes_when_batch_fills() {
        let (_dir, db) = scratch_db().await;
        let mut buffer = RecordBuffer::new(3);

        for i in 0..7 {
            let r = record("a.log", "2024-01-01", &format!("10.0.0.{i}"), "/");
            buffer.push(&db, r).await.unwrap();
        }

        assert_eq!(buffer.flushed(), 6);
        assert_eq!(buffer.pending(), 1);
        assert_eq!(db.get_total_count().await.unwrap(), 6);

        buffer.flush(&db).await.unwrap();
        assert_eq!(buffer.flushed(), 7);
        assert_eq!(db.get_total_count().await.unwrap(), 7);
    }
}
