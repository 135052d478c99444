//! Relational store abstraction
//!
//! The ingestion engine and aggregation query only talk to a store through
//! [`StoreConnector`] and the sessions it hands out. A session is one
//! connection and at most one open transaction; dropping it releases the
//! connection and discards uncommitted work.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::{
    error::PipelineResult,
    types::{BatchStats, GlobalStats, TransactionRecord},
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Hands out store sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Acquire a session (one connection)
    async fn connect(&self) -> PipelineResult<Box<dyn StoreSession>>;

    /// Create the `transactions` and `stats` tables if they are missing
    async fn ensure_schema(&self) -> PipelineResult<()>;

    /// Store name for logs
    fn name(&self) -> &'static str;
}

/// One connection to the store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreSession: Send {
    /// Insert records in order, skipping any whose identity triple already
    /// exists. Returns how many rows were newly inserted.
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
        load_date: NaiveDateTime,
    ) -> PipelineResult<u64>;

    /// Insert a stats row unless its `(file_name, batch_number)` key exists.
    /// Returns whether the row was written.
    async fn insert_batch_stats(&mut self, stats: &BatchStats) -> PipelineResult<bool>;

    /// `SUM(total_rows), AVG(avg_price), MIN(min_price), MAX(max_price)` over `stats`
    async fn query_global_stats(&mut self) -> PipelineResult<GlobalStats>;

    /// Make every change since the last commit durable
    async fn commit(&mut self) -> PipelineResult<()>;

    /// Discard every change since the last commit
    async fn rollback(&mut self) -> PipelineResult<()>;
}
