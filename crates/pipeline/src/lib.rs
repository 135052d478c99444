//! Pricebatch Pipeline - Batch CSV Ingestion with Price Statistics
//!
//! Reads CSV files of `timestamp,price,user_id` rows in fixed-size batches,
//! inserts the rows a store has not seen yet and keeps one statistics row per
//! `(file, batch)` that contributed new data.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                 PipelineOrchestrator                  │
//! ├───────────────────────────┬───────────────────────────┤
//! │      IngestionEngine      │     AggregationQuery      │
//! │  (BatchReader → inserts   │  (SUM / AVG / MIN / MAX   │
//! │   → per-batch stats)      │   over the stats table)   │
//! ├───────────────────────────┴───────────────────────────┤
//! │   StoreConnector: PostgresStore | MemoryStore         │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pricebatch_pipeline::{AppConfig, MemoryStore, Pipeline};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::default();
//!     let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), &config);
//!
//!     let stats = pipeline.query_stats().await?;
//!     assert!(stats.is_empty());
//!     Ok(())
//! }
//! ```

#![allow(clippy::cast_precision_loss)] // Row counts are far below 2^52
#![allow(clippy::cast_possible_truncation)] // Checked before converting user ids
#![allow(clippy::missing_errors_doc)] // Error documentation is handled at module level
#![allow(clippy::module_name_repetitions)]

use std::path::Path;
use std::sync::Arc;

// Public exports
pub use config::*;
pub use error::*;
pub use types::*;

// Internal modules
pub mod config;
pub mod error;
pub mod types;

// Store implementations
pub mod store;

// Pipeline processing
pub mod pipeline;

// Re-exports for convenience
pub use pipeline::{
    AggregationQuery, BatchReader, IngestionEngine, PipelineMetrics, PipelineOrchestrator,
    RunReport,
};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use store::{MemoryStore, StoreConnector, StoreSession};

/// Main pipeline interface
///
/// Bundles a store with the orchestrator configured for it.
pub struct Pipeline {
    connector: Arc<dyn StoreConnector>,
    orchestrator: PipelineOrchestrator,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.connector.name())
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl Pipeline {
    /// Create a pipeline over any store
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>, config: &AppConfig) -> Self {
        let orchestrator = PipelineOrchestrator::new(Arc::clone(&connector), config.pipeline.clone());
        Self {
            connector,
            orchestrator,
        }
    }

    /// Create a pipeline over PostgreSQL
    ///
    /// # Errors
    ///
    /// Returns error if the connection pool cannot be configured
    #[cfg(feature = "postgres")]
    pub fn with_postgres(config: &AppConfig) -> PipelineResult<Self> {
        let store = PostgresStore::new(&config.database)?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Create the tables if they do not exist
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the migration fails
    pub async fn ensure_schema(&self) -> PipelineResult<()> {
        self.connector.ensure_schema().await
    }

    /// Ingest a single file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be parsed or the store fails
    pub async fn process_file(&self, path: &Path) -> PipelineResult<FileReport> {
        self.orchestrator.engine().process_file(path).await
    }

    /// Query the global statistics
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the query fails
    pub async fn query_stats(&self) -> PipelineResult<GlobalStats> {
        AggregationQuery::new(Arc::clone(&self.connector))
            .query_stats()
            .await
    }

    /// Run main files, the validation file and both statistics checkpoints
    ///
    /// # Errors
    ///
    /// Returns error only if the data directory cannot be listed
    pub async fn run(&self) -> PipelineResult<RunReport> {
        self.orchestrator.run().await
    }

    /// Ingestion counters so far
    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        self.orchestrator.engine().metrics()
    }

    /// Name of the backing store
    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.connector.name()
    }
}
