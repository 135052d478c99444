//! Ingestion Engine
//!
//! Reads a file batch by batch, inserts records not yet in the store and
//! writes one statistics row per batch that contributed new records. Every
//! batch of a file runs on one session and is committed together at the end.

use chrono::{Local, NaiveDateTime};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    pipeline::{batch_reader::BatchReader, PipelineMetrics},
    store::{StoreConnector, StoreSession},
    types::{Batch, BatchOutcome, FileReport},
};

/// Batch ingestion engine
pub struct IngestionEngine {
    connector: Arc<dyn StoreConnector>,
    batch_size: usize,
    metrics: Arc<parking_lot::Mutex<PipelineMetrics>>,
}

impl std::fmt::Debug for IngestionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionEngine")
            .field("store", &self.connector.name())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl IngestionEngine {
    /// Create an engine writing to `connector`
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>, config: &PipelineConfig) -> Self {
        Self {
            connector,
            batch_size: config.batch_size,
            metrics: Arc::new(parking_lot::Mutex::new(PipelineMetrics::default())),
        }
    }

    /// Ingest one CSV file
    ///
    /// Nothing from the file is committed if any batch fails.
    ///
    /// # Errors
    ///
    /// Returns parse errors for unreadable or malformed input and store errors
    /// for connection, insert or commit failures
    pub async fn process_file(&self, path: &Path) -> PipelineResult<FileReport> {
        let start = Instant::now();
        let result = self.ingest(path).await;
        self.update_metrics(result.as_ref().ok(), start.elapsed());

        if let Ok(report) = &result {
            tracing::info!(
                file = %report.file_name,
                batches = report.batches.len(),
                rows = report.rows_read(),
                new_records = report.new_records(),
                "File processed"
            );
        }
        result
    }

    async fn ingest(&self, path: &Path) -> PipelineResult<FileReport> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::parse(path.display().to_string(), "path has no file name"))?;

        let reader = BatchReader::open(path, self.batch_size)?;
        let mut session = self.connector.connect().await?;

        match self.ingest_batches(&file_name, reader, session.as_mut()).await {
            Ok(batches) => {
                session.commit().await?;
                Ok(FileReport { file_name, batches })
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    tracing::warn!(file = %file_name, "Rollback failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    async fn ingest_batches(
        &self,
        file_name: &str,
        reader: BatchReader,
        session: &mut dyn StoreSession,
    ) -> PipelineResult<Vec<BatchOutcome>> {
        let mut outcomes = Vec::new();
        for batch in reader {
            let outcome = self
                .ingest_batch(file_name, &batch?, session, Local::now().naive_local())
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn ingest_batch(
        &self,
        file_name: &str,
        batch: &Batch,
        session: &mut dyn StoreSession,
        load_date: NaiveDateTime,
    ) -> PipelineResult<BatchOutcome> {
        let missing_values = batch.missing_values();
        if missing_values > 0 {
            tracing::warn!(
                file = %file_name,
                batch = batch.number,
                missing_values,
                "Missing values found in batch {} of file {}",
                batch.number,
                file_name
            );
        }

        let new_records = session
            .insert_transactions(&batch.records, load_date)
            .await?;

        let mut outcome = BatchOutcome {
            batch_number: batch.number,
            total_rows: batch.len(),
            missing_values,
            new_records,
            stats: None,
            stats_written: false,
        };

        if new_records == 0 {
            tracing::info!(
                file = %file_name,
                batch = batch.number,
                "No new records found for batch {}",
                batch.number
            );
            return Ok(outcome);
        }

        let stats = batch.statistics(file_name, load_date);
        outcome.stats_written = session.insert_batch_stats(&stats).await?;
        if !outcome.stats_written {
            tracing::debug!(file = %file_name, batch = batch.number, "Stats row already present");
        }

        tracing::info!(
            file = %file_name,
            batch = stats.batch_number,
            total_rows = stats.total_rows,
            avg_price = ?stats.avg_price,
            min_price = ?stats.min_price,
            max_price = ?stats.max_price,
            new_records,
            "Statistics processed for batch {}",
            stats.batch_number
        );

        outcome.stats = Some(stats);
        Ok(outcome)
    }

    /// Update ingestion metrics
    fn update_metrics(&self, report: Option<&FileReport>, duration: Duration) {
        let mut metrics = self.metrics.lock();
        let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        metrics.total_processing_time_us += duration_us;

        match report {
            Some(report) => {
                metrics.files_processed += 1;
                metrics.batches_processed += report.batches.len() as u64;
                metrics.rows_read += report.rows_read() as u64;
                metrics.rows_inserted += report.new_records();
                metrics.stats_written += report.stats_written() as u64;
            }
            None => metrics.files_failed += 1,
        }

        let files = metrics.files_processed + metrics.files_failed;
        metrics.avg_processing_time_us = metrics.total_processing_time_us / files.max(1);
    }

    /// Snapshot of ingestion counters
    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockStoreConnector, MockStoreSession};
    use std::io::Write;

    fn engine(store: &MemoryStore, batch_size: usize) -> IngestionEngine {
        let config = PipelineConfig {
            batch_size,
            ..PipelineConfig::default()
        };
        IngestionEngine::new(Arc::new(store.clone()), &config)
    }

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap_or_else(|e| panic!("create: {e}"));
        file.write_all(contents.as_bytes())
            .unwrap_or_else(|e| panic!("write: {e}"));
        path
    }

    const SIX_ROWS: &str = "timestamp,price,user_id\n\
        2024-01-01 10:00:00,10,1\n\
        2024-01-01 11:00:00,20,2\n\
        2024-01-01 12:00:00,30,3\n\
        2024-01-01 13:00:00,40,4\n\
        2024-01-01 14:00:00,50,5\n\
        2024-01-01 15:00:00,60,6\n";

    #[tokio::test]
    async fn test_six_rows_two_batches() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(&dir, "main.csv", SIX_ROWS);
        let store = MemoryStore::new();

        let report = engine(&store, 5).process_file(&path).await?;
        assert_eq!(report.file_name, "main.csv");
        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.new_records(), 6);

        let stats = store.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].key(), ("main.csv", 1));
        assert_eq!(stats[0].total_rows, 5);
        assert_eq!(stats[0].avg_price, Some(30.0));
        assert_eq!(stats[0].min_price, Some(10.0));
        assert_eq!(stats[0].max_price, Some(50.0));
        assert_eq!(stats[1].key(), ("main.csv", 2));
        assert_eq!(stats[1].total_rows, 1);
        assert_eq!(stats[1].avg_price, Some(60.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_process_file_is_idempotent() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(&dir, "main.csv", SIX_ROWS);
        let store = MemoryStore::new();
        let engine = engine(&store, 5);

        engine.process_file(&path).await?;
        let transactions = store.transactions().len();
        let stats = store.stats();

        let second = engine.process_file(&path).await?;
        assert_eq!(second.new_records(), 0);
        assert!(second.batches.iter().all(|b| b.stats.is_none()));
        assert_eq!(store.transactions().len(), transactions);
        assert_eq!(store.stats(), stats);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_cover_duplicates_in_batch() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let seed = write_csv(
            &dir,
            "seed.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,100,1\n",
        );
        let mixed = write_csv(
            &dir,
            "mixed.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,100,1\n2024-01-01 11:00:00,20,2\n",
        );
        let store = MemoryStore::new();
        let engine = engine(&store, 5);

        engine.process_file(&seed).await?;
        let report = engine.process_file(&mixed).await?;

        let outcome = &report.batches[0];
        assert_eq!(outcome.new_records, 1);
        let stats = outcome
            .stats
            .as_ref()
            .unwrap_or_else(|| panic!("stats expected"));
        assert_eq!(stats.total_rows, 2);
        assert_eq!(stats.avg_price, Some(60.0));
        assert_eq!(stats.max_price, Some(100.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_new_rows_writes_no_stats() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let first = write_csv(&dir, "a.csv", SIX_ROWS);
        let copy = write_csv(&dir, "b.csv", SIX_ROWS);
        let store = MemoryStore::new();
        let engine = engine(&store, 5);

        engine.process_file(&first).await?;
        let report = engine.process_file(&copy).await?;

        assert_eq!(report.new_records(), 0);
        assert_eq!(report.stats_written(), 0);
        assert!(store.stats().iter().all(|s| s.file_name == "a.csv"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_price_tolerated() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(
            &dir,
            "gaps.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,10,1\n2024-01-01 11:00:00,,2\n2024-01-01 12:00:00,30,3\n",
        );
        let store = MemoryStore::new();

        let report = engine(&store, 5).process_file(&path).await?;
        let outcome = &report.batches[0];
        assert_eq!(outcome.missing_values, 1);
        assert_eq!(outcome.new_records, 3);

        let stats = &store.stats()[0];
        assert_eq!(stats.total_rows, 3);
        assert_eq!(stats.avg_price, Some(20.0));
        assert_eq!(stats.min_price, Some(10.0));
        assert_eq!(stats.max_price, Some(30.0));
        Ok(())
    }

    /// Shared buffer for formatted log output
    #[derive(Clone, Default)]
    struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_values_warning_is_logged() -> PipelineResult<()> {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir()?;
        let path = write_csv(
            &dir,
            "gaps.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,NA,1\n2024-01-01 11:00:00,20\n",
        );
        let store = MemoryStore::new();

        let report = engine(&store, 5).process_file(&path).await?;
        assert_eq!(report.batches[0].missing_values, 2);
        assert_eq!(store.transactions().len(), 2);

        let logs = capture.contents();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("Missing values found in batch 1 of file gaps.csv"));
        assert!(logs.contains("missing_values=2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_file_commits_nothing() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let mut contents = SIX_ROWS.to_string();
        contents.push_str("2024-01-01 16:00:00,not-a-price,7\n");
        let path = write_csv(&dir, "broken.csv", &contents);
        let store = MemoryStore::new();
        let engine = engine(&store, 5);

        let result = engine.process_file(&path).await;
        assert!(matches!(result, Err(PipelineError::Parse { .. })));
        assert!(store.transactions().is_empty());
        assert!(store.stats().is_empty());
        assert_eq!(engine.metrics().files_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_failure_reported() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(&dir, "main.csv", SIX_ROWS);

        let mut connector = MockStoreConnector::new();
        connector
            .expect_connect()
            .returning(|| Err(PipelineError::connection("connection refused")));
        connector.expect_name().return_const("mock");

        let engine = IngestionEngine::new(Arc::new(connector), &PipelineConfig::default());
        let result = engine.process_file(&path).await;
        assert!(matches!(result, Err(PipelineError::Connection { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(&dir, "main.csv", SIX_ROWS);

        let mut connector = MockStoreConnector::new();
        connector.expect_connect().times(1).returning(|| {
            let mut session = MockStoreSession::new();
            session
                .expect_insert_transactions()
                .returning(|records, _| Ok(records.len() as u64));
            session
                .expect_insert_batch_stats()
                .returning(|_| Err(PipelineError::query("insert_stats", "disk full")));
            session.expect_rollback().times(1).returning(|| Ok(()));
            session.expect_commit().never();
            Ok(Box::new(session) as Box<dyn StoreSession>)
        });
        connector.expect_name().return_const("mock");

        let engine = IngestionEngine::new(Arc::new(connector), &PipelineConfig::default());
        let result = engine.process_file(&path).await;
        assert!(matches!(result, Err(PipelineError::Query { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_ingestion_metrics() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        let path = write_csv(&dir, "main.csv", SIX_ROWS);
        let store = MemoryStore::new();
        let engine = engine(&store, 5);

        engine.process_file(&path).await?;
        engine.process_file(&path).await?;

        let metrics = engine.metrics();
        assert_eq!(metrics.files_processed, 2);
        assert_eq!(metrics.files_failed, 0);
        assert_eq!(metrics.batches_processed, 4);
        assert_eq!(metrics.rows_read, 12);
        assert_eq!(metrics.rows_inserted, 6);
        assert_eq!(metrics.stats_written, 2);
        assert_eq!(
            metrics.avg_processing_time_us,
            metrics.total_processing_time_us / 2
        );
        Ok(())
    }
}
