//! Incremental ingestion of log directories into the record store

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::db::{RecordBuffer, RecordStore, StatTable};
use crate::error::{LineRejection, PipelineError, StoreError};
use crate::parser::{self, Directive, FieldMap};

/// An input that was abandoned, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub cause: String,
}

/// Outcome of one ingestion run
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub files_discovered: usize,
    pub files_skipped: usize,
    pub files_ingested: usize,
    pub records_inserted: u64,
    pub lines_before_directive: u64,
    /// Rejected lines, keyed by reason
    pub lines_rejected: BTreeMap<&'static str, u64>,
    pub failures: Vec<FileFailure>,
}

impl IngestReport {
    pub fn total_rejected(&self) -> u64 {
        self.lines_rejected.values().sum()
    }

    fn fail(&mut self, path: &Path, err: &PipelineError) {
        warn!("Abandoning {}: {}", path.display(), err);
        self.failures.push(FileFailure {
            path: path.display().to_string(),
            cause: err.to_string(),
        });
    }
}

/// Per-file line tallies
#[derive(Debug, Default)]
struct FileTally {
    records: u64,
    before_directive: u64,
    rejected: BTreeMap<&'static str, u64>,
}

pub struct Ingestor<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    batch_size: usize,
}

impl<'a, S: RecordStore + ?Sized> Ingestor<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Ingest every matching file under `directories`.
    ///
    /// Files that already have stored records are skipped unless
    /// `force_reload` is set. Unreadable inputs are reported and skipped;
    /// only a store failure ends the run early.
    pub async fn ingest(
        &self,
        directories: &[PathBuf],
        extensions: &[String],
        force_reload: bool,
    ) -> Result<IngestReport, PipelineError> {
        let processed = if force_reload {
            HashSet::new()
        } else {
            self.store.list_distinct_source_files().await?
        };

        let mut report = IngestReport::default();
        info!(
            directories = directories.len(),
            already_ingested = processed.len(),
            force_reload,
            "Starting ingestion"
        );

        for directory in directories {
            let files = match discover(directory, extensions) {
                Ok(files) => files,
                Err(e) => {
                    report.fail(directory, &e);
                    continue;
                }
            };
            report.files_discovered += files.len();

            for path in files {
                let source = source_identity(&path);
                if processed.contains(&source) {
                    debug!("Skipping already ingested {}", source);
                    report.files_skipped += 1;
                    continue;
                }

                match self.ingest_file(&path, &source).await {
                    Ok(tally) => {
                        report.files_ingested += 1;
                        report.records_inserted += tally.records;
                        report.lines_before_directive += tally.before_directive;
                        for (kind, count) in tally.rejected {
                            *report.lines_rejected.entry(kind).or_default() += count;
                        }
                    }
                    Err(PipelineError::Store(e)) => {
                        if let Err(cleanup) = self.discard_partial(&source).await {
                            warn!("Could not discard partial records of {}: {}", source, cleanup);
                        }
                        return Err(e.into());
                    }
                    Err(e) => {
                        report.fail(&path, &e);
                        self.discard_partial(&source).await?;
                    }
                }
            }
        }

        info!(
            files_ingested = report.files_ingested,
            files_skipped = report.files_skipped,
            records = report.records_inserted,
            rejected = report.total_rejected(),
            failed = report.failures.len(),
            "Ingestion complete"
        );
        Ok(report)
    }

    /// Stream one file through the parser, flushing in fixed-size batches
    async fn ingest_file(&self, path: &Path, source: &str) -> Result<FileTally, PipelineError> {
        info!("Processing {}...", source);

        let file = File::open(path)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        let mut segments = BufReader::new(file).split(b'\n');

        let mut fields: Option<FieldMap> = None;
        let mut buffer = RecordBuffer::new(self.batch_size);
        let mut tally = FileTally::default();

        while let Some(segment) = segments
            .next_segment()
            .await
            .map_err(|e| PipelineError::io(path, e))?
        {
            let raw = String::from_utf8_lossy(&segment);
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            match parser::classify(line) {
                Some(Directive::Fields(map)) => {
                    debug!(columns = map.width(), "Field directive in {}", source);
                    fields = Some(map);
                    continue;
                }
                Some(Directive::Comment) => continue,
                None => {}
            }

            match parser::parse_line(fields.as_ref(), line, source) {
                Ok(record) => buffer.push(self.store, record).await?,
                Err(LineRejection::NoDirective) => {
                    if tally.before_directive == 0 {
                        warn!("Data before any #Fields directive in {}; skipping those lines", source);
                    }
                    tally.before_directive += 1;
                }
                Err(rejection) => {
                    debug!("Rejected line in {}: {}", source, rejection);
                    *tally.rejected.entry(rejection.kind()).or_default() += 1;
                }
            }
        }

        buffer.flush(self.store).await?;
        tally.records = buffer.flushed();
        Ok(tally)
    }

    /// Drop whatever an abandoned file managed to flush, so the next run
    /// sees it as new and reads it from the top
    async fn discard_partial(&self, source: &str) -> Result<(), StoreError> {
        let mut removed = 0;
        loop {
            let deleted = self
                .store
                .delete_source_file_batch(source, self.batch_size)
                .await?;
            if deleted == 0 {
                break;
            }
            removed += deleted;
        }
        if removed > 0 {
            debug!(removed, "Discarded partial records of {}", source);
        }
        Ok(())
    }

    /// Delete every stored record and statistic row, in bounded batches
    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        loop {
            let deleted = self.store.delete_record_batch(self.batch_size).await?;
            if deleted == 0 {
                break;
            }
            removed += deleted;
        }
        for table in StatTable::ALL {
            while self.store.delete_stat_batch(table, self.batch_size).await? > 0 {}
        }
        info!(removed, "Cleared stored records and statistics");
        Ok(removed)
    }
}

/// Identity used to recognise a file on later runs
pub fn source_identity(path: &Path) -> String {
    path.display().to_string()
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)))
}

/// Every matching file below `root`, sorted by path.
///
/// Symlinked files and directories are followed. An entry that cannot be
/// read is logged and skipped without abandoning its siblings.
fn discover(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::MissingDirectory(root.to_path_buf()));
    }

    let pattern = Path::new(&glob::Pattern::escape(&root.to_string_lossy()))
        .join("**")
        .join("*")
        .to_string_lossy()
        .into_owned();
    let entries = glob::glob(&pattern).map_err(|e| PipelineError::Glob {
        pattern: pattern.clone(),
        source: e,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable entry {}: {}", e.path().display(), e.error());
                None
            }
        })
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{scratch_db, FailingStore};
    use crate::db::{Database, HostFilter, LogRecord};
    use futures::TryStreamExt;
    use std::io::Write;

    const DIRECTIVE: &str = "#Fields: date time c-ip cs-method cs-uri-stem sc-status sc-bytes";

    fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    async fn stored(db: &Database) -> Vec<LogRecord> {
        db.scan_records(&HostFilter::default())
            .try_collect()
            .await
            .unwrap()
    }

    fn exts() -> Vec<String> {
        vec![".log".to_string()]
    }

    #[tokio::test]
    async fn ingests_example_line() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        let path = write_log(
            logs.path(),
            "u_ex240301.log",
            &[
                "#Software: Microsoft Internet Information Services 10.0",
                DIRECTIVE,
                "2024-03-01 08:15:22 10.0.0.5 GET /index.html 200 512",
            ],
        );

        let report = Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.records_inserted, 1);

        let records = stored(&db).await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.file_name, source_identity(&path));
        assert_eq!(record.date.to_string(), "2024-03-01");
        assert_eq!(record.client_ip, "10.0.0.5");
        assert_eq!(record.method, "GET");
        assert_eq!(record.uri_stem, "/index.html");
        assert_eq!(record.status_code, 200);
        assert_eq!(record.bytes_sent, 512);
    }

    #[tokio::test]
    async fn second_run_without_force_ingests_nothing() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        write_log(logs.path(), "nested/b.log", &[DIRECTIVE, "2024-03-02 08:15:22 10.0.0.6 GET / 200 1"]);
        let dirs = [logs.path().to_path_buf()];
        let ingestor = Ingestor::new(&db, 1000);

        let first = ingestor.ingest(&dirs, &exts(), false).await.unwrap();
        let second = ingestor.ingest(&dirs, &exts(), false).await.unwrap();

        assert_eq!(first.records_inserted, 2);
        assert_eq!(second.records_inserted, 0);
        assert_eq!(second.files_skipped, 2);
        assert_eq!(db.get_total_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn new_files_are_picked_up_incrementally() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        let dirs = [logs.path().to_path_buf()];
        let ingestor = Ingestor::new(&db, 1000);

        write_log(logs.path(), "a.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        ingestor.ingest(&dirs, &exts(), false).await.unwrap();

        write_log(logs.path(), "b.log", &[DIRECTIVE, "2024-03-02 08:15:22 10.0.0.6 GET / 200 1"]);
        let report = ingestor.ingest(&dirs, &exts(), false).await.unwrap();

        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.files_ingested, 1);
        assert_eq!(db.get_total_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn force_reload_reingests_everything() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        let dirs = [logs.path().to_path_buf()];
        let ingestor = Ingestor::new(&db, 1000);

        ingestor.ingest(&dirs, &exts(), false).await.unwrap();
        let forced = ingestor.ingest(&dirs, &exts(), true).await.unwrap();

        assert_eq!(forced.files_skipped, 0);
        assert_eq!(forced.records_inserted, 1);
        assert_eq!(db.get_total_count().await.unwrap(), 2);

        // Clearing first gives full-rebuild semantics
        ingestor.clear_all().await.unwrap();
        ingestor.ingest(&dirs, &exts(), true).await.unwrap();
        assert_eq!(db.get_total_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_lines_are_counted_not_fatal() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(
            logs.path(),
            "a.log",
            &[
                "2024-03-01 08:00:00 10.0.0.1 GET / 200 1",
                "",
                DIRECTIVE,
                "2024-03-01 08:15:22 10.0.0.5 GET / 200 1",
                "2024-03-01 08:15:23 10.0.0.5 GET /",
                "2024-03-01 08:15:24 10.0.0.5 GET / 200 huge",
                "# a stray comment",
                "2024-03-01 08:15:25 10.0.0.5 GET /next 200 2",
            ],
        );

        let report = Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        assert_eq!(report.records_inserted, 2);
        assert_eq!(report.lines_before_directive, 1);
        assert_eq!(report.lines_rejected.get("column_count"), Some(&1));
        assert_eq!(report.lines_rejected.get("invalid_number"), Some(&1));
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn schema_changes_mid_file_are_followed() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(
            logs.path(),
            "a.log",
            &[
                DIRECTIVE,
                "2024-03-01 08:15:22 10.0.0.5 GET /one 200 1",
                "#Fields: date time cs-uri-stem c-ip sc-status",
                "2024-03-01 09:00:00 /two 10.0.0.6 404",
            ],
        );

        Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        let records = stored(&db).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].uri_stem, "/two");
        assert_eq!(records[1].client_ip, "10.0.0.6");
        assert_eq!(records[1].status_code, 404);
    }

    #[tokio::test]
    async fn large_files_flush_in_batches() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        big_log(logs.path(), "big.log", 2500);

        let report = Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        assert_eq!(report.records_inserted, 2500);
        assert_eq!(db.get_total_count().await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn only_allowed_extensions_are_read() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.LOG", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        write_log(logs.path(), "b.txt", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        write_log(logs.path(), "c.gz", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);

        let report = Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &[".log".to_string(), ".txt".to_string()], false)
            .await
            .unwrap();

        assert_eq!(report.files_discovered, 2);
        assert_eq!(report.records_inserted, 2);
    }

    #[tokio::test]
    async fn missing_directory_is_reported_not_fatal() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        let missing = logs.path().join("nope");

        let report = Ingestor::new(&db, 1000)
            .ingest(&[missing.clone(), logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        assert_eq!(report.records_inserted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, missing.display().to_string());
        assert!(report.failures[0].cause.contains("not found"));
    }

    fn big_log(dir: &Path, name: &str, count: usize) -> PathBuf {
        let data: Vec<String> = (0..count)
            .map(|i| format!("2024-03-01 08:15:22 10.0.{}.{} GET /p{} 200 {}", i / 256, i % 256, i, i))
            .collect();
        let mut lines = vec![DIRECTIVE];
        lines.extend(data.iter().map(String::as_str));
        write_log(dir, name, &lines)
    }

    #[tokio::test]
    async fn store_failure_mid_file_purges_and_retries() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        big_log(logs.path(), "big.log", 2500);
        let dirs = [logs.path().to_path_buf()];

        let flaky = FailingStore::on_insert(&db, 2);
        let failed = Ingestor::new(&flaky, 1000).ingest(&dirs, &exts(), false).await;

        assert!(matches!(failed, Err(PipelineError::Store(_))));
        assert_eq!(db.get_total_count().await.unwrap(), 0);

        let retry = Ingestor::new(&db, 1000)
            .ingest(&dirs, &exts(), false)
            .await
            .unwrap();

        assert_eq!(retry.files_skipped, 0);
        assert_eq!(retry.files_ingested, 1);
        assert_eq!(retry.records_inserted, 2500);
        assert_eq!(db.get_total_count().await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn failure_leaves_earlier_files_in_place() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.5 GET / 200 1"]);
        big_log(logs.path(), "b.log", 1500);
        let dirs = [logs.path().to_path_buf()];

        // a.log is the first insert, b.log's second batch the third
        let flaky = FailingStore::on_insert(&db, 3);
        assert!(Ingestor::new(&flaky, 1000).ingest(&dirs, &exts(), false).await.is_err());
        assert_eq!(db.get_total_count().await.unwrap(), 1);

        let retry = Ingestor::new(&db, 1000)
            .ingest(&dirs, &exts(), false)
            .await
            .unwrap();
        assert_eq!(retry.files_skipped, 1);
        assert_eq!(retry.records_inserted, 1500);
        assert_eq!(db.get_total_count().await.unwrap(), 1501);
    }

    #[test]
    fn dangling_entries_do_not_hide_siblings() {
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "a.log", &[DIRECTIVE]);
        write_log(logs.path(), "deep/er/b.log", &[DIRECTIVE]);
        #[cfg(unix)]
        std::os::unix::fs::symlink(logs.path().join("gone.log"), logs.path().join("dangling.log")).unwrap();

        let files = discover(logs.path(), &exts()).unwrap();

        assert_eq!(
            files,
            vec![logs.path().join("a.log"), logs.path().join("deep/er/b.log")]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_files_and_directories_are_followed() {
        let (_db_dir, db) = scratch_db().await;
        let logs = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        write_log(elsewhere.path(), "linked/c.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.7 GET / 200 1"]);
        write_log(elsewhere.path(), "d.log", &[DIRECTIVE, "2024-03-01 08:15:22 10.0.0.8 GET / 200 1"]);
        std::os::unix::fs::symlink(elsewhere.path().join("linked"), logs.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(elsewhere.path().join("d.log"), logs.path().join("d.log")).unwrap();

        let report = Ingestor::new(&db, 1000)
            .ingest(&[logs.path().to_path_buf()], &exts(), false)
            .await
            .unwrap();

        assert_eq!(report.files_discovered, 2);
        assert_eq!(report.records_inserted, 2);
    }
}
