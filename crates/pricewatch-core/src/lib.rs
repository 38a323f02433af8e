//! Core domain model and price normalization for pricewatch.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Layout used for every timestamp written to the sheets and for batch stamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Stamps are written in the host's local wall-clock time.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One row of the work list: an opaque index plus the page to visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: String,
    pub locator: String,
}

impl WorkItem {
    pub fn new(index: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            locator: locator.into(),
        }
    }
}

/// Raw field values captured from one rendered product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub index: String,
    pub captured_at: DateTime<Local>,
    pub raw_price: String,
    pub seller: String,
}

impl ExtractedRecord {
    pub fn normalize(self) -> Result<NormalizedRecord, NormalizationError> {
        NormalizedRecord::try_from(self)
    }
}

/// An extracted record whose price text parsed into an integer amount.
///
/// Only constructible through [`TryFrom<ExtractedRecord>`], so `numeric_price`
/// always agrees with `raw_price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRecord {
    record: ExtractedRecord,
    numeric_price: u64,
}

impl NormalizedRecord {
    pub fn index(&self) -> &str {
        &self.record.index
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.record.captured_at
    }

    pub fn raw_price(&self) -> &str {
        &self.record.raw_price
    }

    pub fn seller(&self) -> &str {
        &self.record.seller
    }

    pub fn numeric_price(&self) -> u64 {
        self.numeric_price
    }

    pub fn row_update(&self) -> RowUpdate {
        RowUpdate {
            timestamp: format_timestamp(self.record.captured_at),
            seller: self.record.seller.clone(),
            numeric_price: self.numeric_price,
        }
    }

    pub fn history_row(&self) -> HistoryRow {
        HistoryRow {
            timestamp: format_timestamp(self.record.captured_at),
            seller: self.record.seller.clone(),
            raw_price: self.record.raw_price.clone(),
        }
    }
}

impl TryFrom<ExtractedRecord> for NormalizedRecord {
    type Error = NormalizationError;

    fn try_from(record: ExtractedRecord) -> Result<Self, Self::Error> {
        let numeric_price = normalize_price(&record.raw_price)?;
        Ok(Self {
            record,
            numeric_price,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("malformed price {raw:?}: {reason}")]
    MalformedPrice { raw: String, reason: &'static str },
}

/// Convert `"<label> <digits with '.' separators>"` into an integer amount.
///
/// `"COP 1.234.567"` becomes `1234567`. Anything after the second token is
/// ignored; the second token must be ASCII digits once the separators are gone.
pub fn normalize_price(raw: &str) -> Result<u64, NormalizationError> {
    let malformed = |reason| NormalizationError::MalformedPrice {
        raw: raw.to_string(),
        reason,
    };

    let mut tokens = raw.split_whitespace();
    let _label = tokens.next().ok_or_else(|| malformed("empty price text"))?;
    let amount = tokens
        .next()
        .ok_or_else(|| malformed("missing numeric token after currency label"))?;

    let digits = amount.replace('.', "");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("numeric token is not a base-10 integer"));
    }
    digits
        .parse::<u64>()
        .map_err(|_| malformed("numeric token overflows u64"))
}

/// Values written over the fixed timestamp/seller/price columns of a current-state row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub timestamp: String,
    pub seller: String,
    pub numeric_price: u64,
}

/// One appended line of the historical log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: String,
    pub seller: String,
    pub raw_price: String,
}

impl HistoryRow {
    pub const HEADER: [&'static str; 3] = ["Timestamp", "Seller", "Price"];

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.seller.clone(),
            self.raw_price.clone(),
        ]
    }
}

/// Records buffered during one pass, in capture order.
#[derive(Debug, Clone, Serialize)]
pub struct RunBatch {
    pub run_id: Uuid,
    pub stamp: String,
    records: Vec<NormalizedRecord>,
}

impl RunBatch {
    pub fn new(run_id: Uuid, started_at: DateTime<Local>) -> Self {
        Self {
            run_id,
            stamp: format_timestamp(started_at),
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: NormalizedRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn history_rows(&self) -> Vec<HistoryRow> {
        self.records.iter().map(NormalizedRecord::history_row).collect()
    }
}
