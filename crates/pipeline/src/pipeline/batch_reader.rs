//! CSV Batch Reader
//!
//! Splits a CSV file into fixed-size batches of parsed records, lazily and in
//! file order. Empty cells, absent trailing cells and the usual null tokens
//! (`NA`, `null`, ...) become `None`; cells that are present but cannot be
//! coerced to their column type fail the read.

use chrono::{NaiveDate, NaiveDateTime};
use std::fs::File;
use std::path::Path;

use crate::{
    error::{PipelineError, PipelineResult},
    types::{Batch, TransactionRecord},
};

/// Required header names
pub const REQUIRED_COLUMNS: [&str; 3] = ["timestamp", "price", "user_id"];

/// Cell contents read as a missing value
const NULL_TOKENS: [&str; 12] = [
    "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "NaT", "None", "#N/A", "<NA>", "-NaN",
];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Column positions of the required fields
#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    timestamp: usize,
    price: usize,
    user_id: usize,
}

/// Forward-only iterator over a file's batches
#[derive(Debug)]
pub struct BatchReader {
    source_name: String,
    reader: csv::Reader<File>,
    columns: ColumnIndex,
    width: usize,
    batch_size: usize,
    next_batch: u32,
    record: csv::StringRecord,
    finished: bool,
}

impl BatchReader {
    /// Open a CSV file and validate its header
    ///
    /// # Errors
    ///
    /// Returns a parse error if the file cannot be read, a required column is
    /// missing, or `batch_size` is zero
    pub fn open(path: &Path, batch_size: usize) -> PipelineResult<Self> {
        let source_name = path.display().to_string();
        if batch_size == 0 {
            return Err(PipelineError::configuration("batch size must be at least 1"));
        }

        let file = File::open(path)
            .map_err(|e| PipelineError::parse(&source_name, format!("cannot open file: {e}")))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);

        let headers = reader
            .headers()
            .map_err(|e| PipelineError::parse(&source_name, format!("cannot read header: {e}")))?;

        let width = headers.len();
        let position = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                PipelineError::parse(&source_name, format!("missing required column '{name}'"))
            })
        };
        let columns = ColumnIndex {
            timestamp: position(REQUIRED_COLUMNS[0])?,
            price: position(REQUIRED_COLUMNS[1])?,
            user_id: position(REQUIRED_COLUMNS[2])?,
        };

        Ok(Self {
            source_name,
            reader,
            columns,
            width,
            batch_size,
            next_batch: 1,
            record: csv::StringRecord::new(),
            finished: false,
        })
    }

    fn read_batch(&mut self) -> PipelineResult<Option<Batch>> {
        let mut records = Vec::with_capacity(self.batch_size);

        while records.len() < self.batch_size {
            let more = self
                .reader
                .read_record(&mut self.record)
                .map_err(|e| PipelineError::parse(&self.source_name, e.to_string()))?;
            if !more {
                break;
            }
            records.push(self.parse_record()?);
        }

        if records.is_empty() {
            return Ok(None);
        }

        let batch = Batch {
            number: self.next_batch,
            records,
        };
        self.next_batch += 1;
        Ok(Some(batch))
    }

    fn parse_record(&self) -> PipelineResult<TransactionRecord> {
        let line = self.record.position().map_or(0, csv::Position::line);
        // Short rows are padded with nulls, long ones are malformed
        if self.record.len() > self.width {
            return Err(PipelineError::parse(
                &self.source_name,
                format!(
                    "line {line}: found {} fields, header has {}",
                    self.record.len(),
                    self.width
                ),
            ));
        }

        Ok(TransactionRecord {
            timestamp: self
                .cell(self.columns.timestamp)
                .map(parse_timestamp)
                .transpose()
                .map_err(|reason| self.cell_error(line, "timestamp", &reason))?,
            price: self
                .cell(self.columns.price)
                .map(|raw| raw.parse::<f64>().map_err(|e| format!("'{raw}': {e}")))
                .transpose()
                .map_err(|reason| self.cell_error(line, "price", &reason))?
                .filter(|price| !price.is_nan()),
            user_id: self
                .cell(self.columns.user_id)
                .map(parse_user_id)
                .transpose()
                .map_err(|reason| self.cell_error(line, "user_id", &reason))?,
        })
    }

    /// Cell content, `None` for empty, absent or null-token cells
    fn cell(&self, index: usize) -> Option<&str> {
        self.record
            .get(index)
            .filter(|raw| !raw.is_empty() && !NULL_TOKENS.contains(raw))
    }

    fn cell_error(&self, line: u64, column: &str, reason: &str) -> PipelineError {
        PipelineError::parse(
            &self.source_name,
            format!("line {line}, column '{column}': {reason}"),
        )
    }
}

impl Iterator for BatchReader {
    type Item = PipelineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse a date-time cell; a bare date means midnight
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("'{raw}' is not a date-time"))
}

/// Parse a user id; integral floats such as `7.0` are accepted
fn parse_user_id(raw: &str) -> Result<i32, String> {
    if let Ok(id) = raw.parse::<i32>() {
        return Ok(id);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.fract() == 0.0_f64 && v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX) => {
            Ok(v as i32)
        }
        _ => Err(format!("'{raw}' is not an integer")),
    }
}
