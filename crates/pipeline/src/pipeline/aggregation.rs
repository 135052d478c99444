//! Aggregation Query
//!
//! Global summary over every persisted stats row. The average is the mean of
//! the per-batch averages: a batch of one row weighs as much as a full one.

use std::sync::Arc;

use crate::{error::PipelineResult, store::StoreConnector, types::GlobalStats};

/// Reads and combines all per-batch statistics
pub struct AggregationQuery {
    connector: Arc<dyn StoreConnector>,
}

impl std::fmt::Debug for AggregationQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationQuery")
            .field("store", &self.connector.name())
            .finish()
    }
}

impl AggregationQuery {
    /// Create a query against `connector`
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self { connector }
    }

    /// Total rows, mean of batch averages, global min and max
    ///
    /// An empty stats table yields all-`None` fields rather than an error.
    ///
    /// # Errors
    ///
    /// Returns connection or query errors from the store
    pub async fn query_stats(&self) -> PipelineResult<GlobalStats> {
        let mut session = self.connector.connect().await?;
        let stats = session.query_global_stats().await?;
        tracing::debug!(?stats, "Global statistics queried");
        Ok(stats)
    }
}
