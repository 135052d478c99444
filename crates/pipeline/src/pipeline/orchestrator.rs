//! Pipeline Orchestrator
//!
//! Runs the main files in name order, reports global statistics, then runs
//! the validation file and reports again. A failed file or query is logged
//! and the run carries on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    pipeline::{aggregation::AggregationQuery, ingestion::IngestionEngine, PipelineMetrics},
    store::StoreConnector,
    types::{FileReport, GlobalStats},
};

/// Outcome of one file
#[derive(Debug)]
pub struct FileOutcome {
    /// Input path
    pub path: PathBuf,
    /// Report, or the error that stopped the file
    pub result: PipelineResult<FileReport>,
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct RunReport {
    /// Main files in processing order
    pub main_files: Vec<FileOutcome>,
    /// Global statistics after the main files (`None` if the query failed)
    pub main_stats: Option<GlobalStats>,
    /// Validation file outcome
    pub validation: Option<FileOutcome>,
    /// Global statistics after the validation file (`None` if the query failed)
    pub validation_stats: Option<GlobalStats>,
    /// Ingestion counters at the end of the run
    pub metrics: Option<PipelineMetrics>,
}

impl RunReport {
    /// Number of files that failed
    #[must_use]
    pub fn failed_files(&self) -> usize {
        self.main_files
            .iter()
            .chain(self.validation.iter())
            .filter(|f| f.result.is_err())
            .count()
    }
}

/// Drives ingestion and aggregation over a data directory
#[derive(Debug)]
pub struct PipelineOrchestrator {
    engine: IngestionEngine,
    aggregation: AggregationQuery,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    /// Create an orchestrator over `connector`
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>, config: PipelineConfig) -> Self {
        Self {
            engine: IngestionEngine::new(Arc::clone(&connector), &config),
            aggregation: AggregationQuery::new(connector),
            config,
        }
    }

    /// Ingestion engine used by this orchestrator
    #[must_use]
    pub const fn engine(&self) -> &IngestionEngine {
        &self.engine
    }

    /// CSV files in the data directory except the validation file, sorted by name
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be listed
    pub fn main_files(&self) -> PipelineResult<Vec<PathBuf>> {
        let dir = &self.config.data_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            PipelineError::configuration(format!(
                "cannot list data directory {}: {e}",
                dir.display()
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_csv = path.extension().is_some_and(|ext| ext == "csv");
            let is_validation = path
                .file_name()
                .is_some_and(|name| *name == *self.config.validation_file);
            if path.is_file() && is_csv && !is_validation {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Run the whole pipeline
    ///
    /// # Errors
    ///
    /// Returns error only if the data directory cannot be listed
    pub async fn run(&self) -> PipelineResult<RunReport> {
        let files = self.main_files()?;
        let mut report = RunReport::default();

        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            files = files.len(),
            "Processing main files"
        );
        for path in files {
            report.main_files.push(self.process(path).await);
        }

        tracing::info!("Global statistics after processing the main files");
        report.main_stats = self.report_stats().await;

        tracing::info!("Processing validation file");
        let validation_path = self.config.data_dir.join(&self.config.validation_file);
        report.validation = Some(self.process(validation_path).await);

        tracing::info!("Global statistics after processing {}", self.config.validation_file);
        report.validation_stats = self.report_stats().await;

        report.metrics = Some(self.engine.metrics());
        Ok(report)
    }

    async fn process(&self, path: PathBuf) -> FileOutcome {
        tracing::info!(file = %display_name(&path), "Processing file");
        let result = self.engine.process_file(&path).await;
        if let Err(e) = &result {
            tracing::error!(
                file = %path.display(),
                kind = e.kind(),
                "Error processing file {}: {e}",
                path.display()
            );
        }
        FileOutcome { path, result }
    }

    async fn report_stats(&self) -> Option<GlobalStats> {
        match self.aggregation.query_stats().await {
            Ok(stats) => {
                tracing::info!(
                    total_rows = ?stats.total_rows,
                    avg_price = ?stats.avg_price,
                    min_price = ?stats.min_price,
                    max_price = ?stats.max_price,
                    "{stats}"
                );
                Some(stats)
            }
            Err(e) => {
                tracing::error!(kind = e.kind(), "Error querying statistics: {e}");
                None
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockStoreConnector};

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap_or_else(|e| panic!("write {name}: {e}"));
    }

    fn orchestrator(store: Arc<dyn StoreConnector>, dir: &Path) -> PipelineOrchestrator {
        let config = PipelineConfig {
            data_dir: dir.to_path_buf(),
            ..PipelineConfig::default()
        };
        PipelineOrchestrator::new(store, config)
    }

    #[test]
    fn test_main_files_sorted_without_validation() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        for name in ["b.csv", "validation.csv", "a.csv", "notes.txt", "c.csv"] {
            write(dir.path(), name, "timestamp,price,user_id\n");
        }
        std::fs::create_dir(dir.path().join("nested.csv"))?;

        let files = orchestrator(Arc::new(MemoryStore::new()), dir.path()).main_files()?;
        let names: Vec<_> = files.iter().map(|p| display_name(p)).collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "c.csv"]);
        Ok(())
    }

    #[test]
    fn test_missing_data_dir_is_error() {
        let orchestrator = orchestrator(
            Arc::new(MemoryStore::new()),
            Path::new("/nonexistent/pricebatch-data"),
        );
        assert!(orchestrator.main_files().is_err());
    }

    #[tokio::test]
    async fn test_validation_processed_after_first_checkpoint() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        write(
            dir.path(),
            "2024-01.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,10,1\n2024-01-01 11:00:00,20,2\n",
        );
        write(
            dir.path(),
            "validation.csv",
            "timestamp,price,user_id\n2024-02-01 10:00:00,90,3\n",
        );
        let store = MemoryStore::new();

        let report = orchestrator(Arc::new(store.clone()), dir.path()).run().await?;

        assert_eq!(report.main_files.len(), 1);
        let main = report.main_stats.unwrap_or_else(|| panic!("main stats"));
        assert_eq!(main.total_rows, Some(2));
        assert_eq!(main.max_price, Some(20.0));

        let validation = report.validation_stats.unwrap_or_else(|| panic!("validation stats"));
        assert_eq!(validation.total_rows, Some(3));
        assert_eq!(validation.avg_price, Some(52.5));
        assert_eq!(validation.max_price, Some(90.0));

        assert_eq!(store.stats().last().map(|s| s.file_name.as_str()), Some("validation.csv"));
        assert_eq!(report.failed_files(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_run() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path(), "a.csv", "timestamp,user_id\n2024-01-01 10:00:00,1\n");
        write(
            dir.path(),
            "b.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,10,1\n",
        );
        let store = MemoryStore::new();

        let report = orchestrator(Arc::new(store.clone()), dir.path()).run().await?;

        assert!(report.main_files[0].result.is_err());
        assert!(report.main_files[1].result.is_ok());
        // validation.csv is absent
        assert!(report.validation.as_ref().is_some_and(|v| v.result.is_err()));
        assert_eq!(report.failed_files(), 2);
        assert_eq!(store.transactions().len(), 1);
        assert!(report.validation_stats.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_store_is_logged_not_fatal() -> PipelineResult<()> {
        let dir = tempfile::tempdir()?;
        write(
            dir.path(),
            "a.csv",
            "timestamp,price,user_id\n2024-01-01 10:00:00,10,1\n",
        );

        let mut connector = MockStoreConnector::new();
        connector
            .expect_connect()
            .returning(|| Err(PipelineError::connection("connection refused")));
        connector.expect_name().return_const("mock");

        let report = orchestrator(Arc::new(connector), dir.path()).run().await?;
        assert_eq!(report.failed_files(), 2);
        assert!(report.main_stats.is_none());
        assert!(report.validation_stats.is_none());
        Ok(())
    }
}
