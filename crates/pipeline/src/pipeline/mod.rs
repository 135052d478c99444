//! Pipeline Processing Module
//!
//! Batch reading, ingestion, aggregation and the orchestrator that drives
//! them over a data directory.

pub mod aggregation;
pub mod batch_reader;
pub mod ingestion;
pub mod orchestrator;

pub use aggregation::AggregationQuery;
pub use batch_reader::BatchReader;
pub use ingestion::IngestionEngine;
pub use orchestrator::{FileOutcome, PipelineOrchestrator, RunReport};

/// Pipeline metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Files ingested and committed
    pub files_processed: u64,

    /// Files abandoned on error
    pub files_failed: u64,

    /// Batches read from committed files
    pub batches_processed: u64,

    /// Records read from committed files
    pub rows_read: u64,

    /// Records newly inserted
    pub rows_inserted: u64,

    /// Stats rows written
    pub stats_written: u64,

    /// Average processing time per file in microseconds
    pub avg_processing_time_us: u64,

    /// Total processing time in microseconds
    pub total_processing_time_us: u64,
}
