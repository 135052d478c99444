//! In-memory store
//!
//! Mirrors the PostgreSQL schema's uniqueness constraints and transaction
//! boundaries: sessions stage their writes and only publish them on commit.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    error::PipelineResult,
    store::{StoreConnector, StoreSession},
    types::{BatchStats, GlobalStats, IdentityKey, TransactionRecord},
};

/// A persisted transaction row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTransaction {
    /// Parsed record
    pub record: TransactionRecord,
    /// Insert time
    pub load_date: NaiveDateTime,
}

#[derive(Debug, Default)]
struct Tables {
    transactions: Vec<StoredTransaction>,
    transaction_keys: HashSet<IdentityKey>,
    stats: Vec<BatchStats>,
    stats_keys: HashSet<(String, u32)>,
}

impl Tables {
    fn has_transaction(&self, key: &IdentityKey) -> bool {
        self.transaction_keys.contains(key)
    }

    fn has_stats(&self, key: &(String, u32)) -> bool {
        self.stats_keys.contains(key)
    }

    fn insert_transaction(&mut self, row: StoredTransaction) {
        if let Some(key) = row.record.identity() {
            self.transaction_keys.insert(key);
        }
        self.transactions.push(row);
    }

    fn insert_stats(&mut self, stats: BatchStats) {
        self.stats_keys
            .insert((stats.file_name.clone(), stats.batch_number));
        self.stats.push(stats);
    }
}

/// In-process store with the same constraints as the SQL schema
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed transaction rows in insert order
    #[must_use]
    pub fn transactions(&self) -> Vec<StoredTransaction> {
        self.committed.lock().transactions.clone()
    }

    /// Committed stats rows in insert order
    #[must_use]
    pub fn stats(&self) -> Vec<BatchStats> {
        self.committed.lock().stats.clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> PipelineResult<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            committed: Arc::clone(&self.committed),
            staged: Tables::default(),
        }))
    }

    async fn ensure_schema(&self) -> PipelineResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Session over a [`MemoryStore`]; uncommitted writes vanish on drop
#[derive(Debug)]
struct MemorySession {
    committed: Arc<Mutex<Tables>>,
    staged: Tables,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
        load_date: NaiveDateTime,
    ) -> PipelineResult<u64> {
        let committed = self.committed.lock();
        let mut inserted = 0_u64;

        for record in records {
            let conflict = record
                .identity()
                .is_some_and(|key| committed.has_transaction(&key) || self.staged.has_transaction(&key));
            if conflict {
                continue;
            }
            self.staged.insert_transaction(StoredTransaction {
                record: *record,
                load_date,
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn insert_batch_stats(&mut self, stats: &BatchStats) -> PipelineResult<bool> {
        let key = (stats.file_name.clone(), stats.batch_number);
        let conflict = self.committed.lock().has_stats(&key) || self.staged.has_stats(&key);
        if conflict {
            return Ok(false);
        }
        self.staged.insert_stats(stats.clone());
        Ok(true)
    }

    async fn query_global_stats(&mut self) -> PipelineResult<GlobalStats> {
        let committed = self.committed.lock();
        Ok(GlobalStats::from_batches(
            committed.stats.iter().chain(self.staged.stats.iter()),
        ))
    }

    async fn commit(&mut self) -> PipelineResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut committed = self.committed.lock();
        for row in staged.transactions {
            committed.insert_transaction(row);
        }
        for stats in staged.stats {
            committed.insert_stats(stats);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> PipelineResult<()> {
        self.staged = Tables::default();
        Ok(())
    }
}
