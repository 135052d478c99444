//! Pricebatch Pipeline Types
//!
//! Core records flowing from the CSV reader through the ingestion engine
//! into the store, plus the statistics computed over them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One parsed CSV row
///
/// Empty cells are kept as `None`; they are counted and reported, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Event time
    pub timestamp: Option<NaiveDateTime>,

    /// Price
    pub price: Option<f64>,

    /// User identifier
    pub user_id: Option<i32>,
}

/// Fully populated identity of a transaction
///
/// Rows with a null component have no identity: like SQL `NULL`s in a unique
/// constraint they never conflict with anything. Prices are compared at the
/// 15 significant digits a `float8` keeps when cast to `NUMERIC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    timestamp: NaiveDateTime,
    price_bits: u64,
    user_id: i32,
}

impl TransactionRecord {
    /// Create a record with every cell present
    #[must_use]
    pub const fn new(timestamp: NaiveDateTime, price: f64, user_id: i32) -> Self {
        Self {
            timestamp: Some(timestamp),
            price: Some(price),
            user_id: Some(user_id),
        }
    }

    /// Number of null cells in this record
    #[must_use]
    pub fn missing_cells(&self) -> usize {
        usize::from(self.timestamp.is_none())
            + usize::from(self.price.is_none())
            + usize::from(self.user_id.is_none())
    }

    /// Deduplication key `(timestamp, price, user_id)`
    #[must_use]
    pub fn identity(&self) -> Option<IdentityKey> {
        let price = numeric_price(self.price?);
        Some(IdentityKey {
            timestamp: self.timestamp?,
            price_bits: price.to_bits(),
            user_id: self.user_id?,
        })
    }
}

/// Price as stored in a `NUMERIC` column
fn numeric_price(price: f64) -> f64 {
    let rounded = format!("{price:.14e}").parse::<f64>().unwrap_or(price);
    // -0.0 and 0.0 compare equal as NUMERIC
    if rounded == 0.0_f64 {
        0.0_f64
    } else {
        rounded
    }
}

/// Ordered slice of a file's records processed as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// 1-based position of the batch within its file
    pub number: u32,

    /// Records in file order
    pub records: Vec<TransactionRecord>,
}

impl Batch {
    /// Number of records in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Null cells across every field of every record
    #[must_use]
    pub fn missing_values(&self) -> usize {
        self.records.iter().map(TransactionRecord::missing_cells).sum()
    }

    /// Statistics over the whole batch, duplicates included
    ///
    /// `total_rows` counts every record; null prices are skipped by the
    /// average, minimum and maximum.
    #[must_use]
    pub fn statistics(&self, file_name: &str, load_date: NaiveDateTime) -> BatchStats {
        let summary = PriceSummary::from_prices(self.records.iter().filter_map(|r| r.price));

        BatchStats {
            file_name: file_name.to_string(),
            batch_number: self.number,
            total_rows: self.len() as u64,
            avg_price: summary.mean(),
            min_price: summary.min,
            max_price: summary.max,
            load_date,
        }
    }
}

/// Running mean/min/max over a price column, skipping nulls
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PriceSummary {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl PriceSummary {
    fn from_prices(prices: impl IntoIterator<Item = f64>) -> Self {
        prices.into_iter().fold(Self::default(), |mut acc, price| {
            acc.count += 1;
            acc.sum += price;
            acc.min = Some(acc.min.map_or(price, |m| m.min(price)));
            acc.max = Some(acc.max.map_or(price, |m| m.max(price)));
            acc
        })
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Persisted per-batch statistics, keyed by `(file_name, batch_number)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Source file name (no directory)
    pub file_name: String,

    /// 1-based batch index within the file
    pub batch_number: u32,

    /// Records in the batch, including rows that were already stored
    pub total_rows: u64,

    /// Mean price over the batch
    pub avg_price: Option<f64>,

    /// Minimum price over the batch
    pub min_price: Option<f64>,

    /// Maximum price over the batch
    pub max_price: Option<f64>,

    /// When the row was produced
    pub load_date: NaiveDateTime,
}

impl BatchStats {
    /// Stats key `(file_name, batch_number)`
    #[must_use]
    pub fn key(&self) -> (&str, u32) {
        (&self.file_name, self.batch_number)
    }
}

/// Summary across every persisted stats row
///
/// `avg_price` is the plain mean of the per-batch averages, not weighted by
/// row count. All fields are `None` when no stats rows exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    /// Sum of `total_rows`
    pub total_rows: Option<i64>,

    /// Mean of `avg_price`
    pub avg_price: Option<f64>,

    /// Minimum of `min_price`
    pub min_price: Option<f64>,

    /// Maximum of `max_price`
    pub max_price: Option<f64>,
}

impl GlobalStats {
    /// Combine stats rows the way `SUM/AVG/MIN/MAX` over the stats table do
    #[must_use]
    pub fn from_batches<'a>(rows: impl IntoIterator<Item = &'a BatchStats>) -> Self {
        let mut total_rows: Option<i64> = None;
        let mut averages = PriceSummary::default();
        let mut min_price: Option<f64> = None;
        let mut max_price: Option<f64> = None;

        for row in rows {
            let rows_in_batch = i64::try_from(row.total_rows).unwrap_or(i64::MAX);
            total_rows = Some(total_rows.unwrap_or(0).saturating_add(rows_in_batch));

            if let Some(avg) = row.avg_price {
                averages.count += 1;
                averages.sum += avg;
            }
            if let Some(min) = row.min_price {
                min_price = Some(min_price.map_or(min, |m| m.min(min)));
            }
            if let Some(max) = row.max_price {
                max_price = Some(max_price.map_or(max, |m| m.max(max)));
            }
        }

        Self {
            total_rows,
            avg_price: averages.mean(),
            min_price,
            max_price,
        }
    }

    /// Whether any stats row contributed
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_rows.is_none()
    }
}

fn fmt_optional(value: Option<f64>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{v:.2}"),
        None => f.write_str("n/a"),
    }
}

impl fmt::Display for GlobalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total_rows {
            Some(rows) => write!(f, "total rows: {rows}, ")?,
            None => f.write_str("total rows: n/a, ")?,
        }
        f.write_str("average price: ")?;
        fmt_optional(self.avg_price, f)?;
        f.write_str(", min price: ")?;
        fmt_optional(self.min_price, f)?;
        f.write_str(", max price: ")?;
        fmt_optional(self.max_price, f)
    }
}

/// What happened to one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// 1-based batch index
    pub batch_number: u32,

    /// Records in the batch
    pub total_rows: usize,

    /// Null cells found in the batch
    pub missing_values: usize,

    /// Records not previously present in the store
    pub new_records: u64,

    /// Statistics, computed only when `new_records > 0`
    pub stats: Option<BatchStats>,

    /// Whether the stats row was written (false if it already existed)
    pub stats_written: bool,
}

/// Result of processing one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    /// File name without directory
    pub file_name: String,

    /// Per-batch outcomes in file order
    pub batches: Vec<BatchOutcome>,
}

impl FileReport {
    /// Total records read from the file
    #[must_use]
    pub fn rows_read(&self) -> usize {
        self.batches.iter().map(|b| b.total_rows).sum()
    }

    /// Total records newly inserted
    #[must_use]
    pub fn new_records(&self) -> u64 {
        self.batches.iter().map(|b| b.new_records).sum()
    }

    /// Stats rows written for this file
    #[must_use]
    pub fn stats_written(&self) -> usize {
        self.batches.iter().filter(|b| b.stats_written).count()
    }
}
