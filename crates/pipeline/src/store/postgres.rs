//! PostgreSQL store using `tokio-postgres` behind a `deadpool-postgres` pool
//!
//! Inserts go through prepared `ON CONFLICT DO NOTHING` statements, executed
//! one row at a time in batch order so the affected-row count tells which
//! records were new. A session opens its transaction lazily on the first
//! write; read-only sessions never start one.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::{
    config::DatabaseConfig,
    error::{classify_postgres_error, PipelineError, PipelineResult},
    store::{StoreConnector, StoreSession},
    types::{BatchStats, GlobalStats, TransactionRecord},
};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const INSERT_TRANSACTION: &str = "INSERT INTO transactions (timestamp, price, user_id, load_date) \
     VALUES ($1, $2::float8, $3, $4) \
     ON CONFLICT (timestamp, price, user_id) DO NOTHING";

const INSERT_STATS: &str = "INSERT INTO stats \
     (file_name, batch_number, total_rows, avg_price, min_price, max_price, load_date) \
     VALUES ($1, $2, $3, $4::float8, $5::float8, $6::float8, $7) \
     ON CONFLICT (file_name, batch_number) DO NOTHING";

const SELECT_GLOBAL_STATS: &str = "SELECT SUM(total_rows)::bigint, AVG(avg_price)::float8, \
     MIN(min_price)::float8, MAX(max_price)::float8 FROM stats";

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Create the connection pool
    ///
    /// No connection is opened until the first session is requested.
    ///
    /// # Errors
    ///
    /// Returns error if the pool configuration is rejected
    pub fn new(config: &DatabaseConfig) -> PipelineResult<Self> {
        let mut pg_config = Config::new();
        pg_config.dbname = Some(config.dbname.clone());
        pg_config.user = Some(config.user.clone());
        pg_config.password = Some(config.password.clone());
        pg_config.host = Some(config.host.clone());
        pg_config.port = Some(config.port);
        pg_config.connect_timeout = Some(config.connect_timeout());
        pg_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg_config.pool = Some(PoolConfig::new(config.max_connections as usize));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| PipelineError::configuration(format!("PostgreSQL pool setup failed: {e}")))?;

        tracing::debug!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            "PostgreSQL pool created"
        );

        Ok(Self { pool })
    }

    async fn checkout(&self) -> PipelineResult<Object> {
        self.pool.get().await.map_err(|e| {
            tracing::error!("PostgreSQL connection failed: {e}");
            PipelineError::connection(format!("Failed to get connection: {e}"))
        })
    }
}

#[async_trait]
impl StoreConnector for PostgresStore {
    async fn connect(&self) -> PipelineResult<Box<dyn StoreSession>> {
        let client = self.checkout().await?;
        Ok(Box::new(PostgresSession {
            client: Some(client),
            in_transaction: false,
        }))
    }

    async fn ensure_schema(&self) -> PipelineResult<()> {
        let mut client = self.checkout().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| PipelineError::migration(e.to_string()))?;

        tracing::info!(
            applied = report.applied_migrations().len(),
            "Tables 'transactions' and 'stats' are ready"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// One pooled connection with an optional open transaction
struct PostgresSession {
    client: Option<Object>,
    in_transaction: bool,
}

impl PostgresSession {
    fn client(&self) -> PipelineResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| PipelineError::connection("session already released"))
    }

    async fn begin(&mut self) -> PipelineResult<()> {
        if !self.in_transaction {
            self.client()?
                .batch_execute("BEGIN")
                .await
                .map_err(|e| classify_postgres_error("begin", &e))?;
            self.in_transaction = true;
        }
        Ok(())
    }

    async fn finish(&mut self, statement: &'static str) -> PipelineResult<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client()?
                .batch_execute(statement)
                .await
                .map_err(|e| classify_postgres_error(statement, &e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreSession for PostgresSession {
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
        load_date: NaiveDateTime,
    ) -> PipelineResult<u64> {
        self.begin().await?;
        let client = self.client()?;
        let stmt = client
            .prepare_cached(INSERT_TRANSACTION)
            .await
            .map_err(|e| classify_postgres_error("prepare_insert_transaction", &e))?;

        let mut inserted = 0_u64;
        for record in records {
            inserted += client
                .execute(
                    &stmt,
                    &[
                        &record.timestamp,
                        &record.price,
                        &record.user_id,
                        &load_date,
                    ],
                )
                .await
                .map_err(|e| classify_postgres_error("insert_transaction", &e))?;
        }

        tracing::debug!(rows = records.len(), inserted, "Transactions inserted");
        Ok(inserted)
    }

    async fn insert_batch_stats(&mut self, stats: &BatchStats) -> PipelineResult<bool> {
        let batch_number = i32::try_from(stats.batch_number)
            .map_err(|e| PipelineError::query("batch_number_conversion", e.to_string()))?;
        let total_rows = i64::try_from(stats.total_rows)
            .map_err(|e| PipelineError::query("total_rows_conversion", e.to_string()))?;

        self.begin().await?;
        let client = self.client()?;
        let stmt = client
            .prepare_cached(INSERT_STATS)
            .await
            .map_err(|e| classify_postgres_error("prepare_insert_stats", &e))?;

        let written = client
            .execute(
                &stmt,
                &[
                    &stats.file_name,
                    &batch_number,
                    &total_rows,
                    &stats.avg_price,
                    &stats.min_price,
                    &stats.max_price,
                    &stats.load_date,
                ],
            )
            .await
            .map_err(|e| classify_postgres_error("insert_stats", &e))?;

        Ok(written == 1)
    }

    async fn query_global_stats(&mut self) -> PipelineResult<GlobalStats> {
        let row = self
            .client()?
            .query_one(SELECT_GLOBAL_STATS, &[])
            .await
            .map_err(|e| classify_postgres_error("query_global_stats", &e))?;

        let column = |e: tokio_postgres::Error| PipelineError::query("read_global_stats", e.to_string());
        Ok(GlobalStats {
            total_rows: row.try_get(0).map_err(column)?,
            avg_price: row.try_get(1).map_err(column)?,
            min_price: row.try_get(2).map_err(column)?,
            max_price: row.try_get(3).map_err(column)?,
        })
    }

    async fn commit(&mut self) -> PipelineResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> PipelineResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.in_transaction {
                // Closing the connection makes the server roll the open transaction back
                tracing::warn!("Session dropped mid-transaction; discarding connection");
                drop(Object::take(client));
            }
        }
    }
}
