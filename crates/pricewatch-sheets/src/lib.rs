//! Spreadsheet-backed record stores: current-state sheet + historical log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pricewatch_core::RowUpdate;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "pricewatch-sheets";

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Header-keyed cells of one data row.
pub type SheetRecord = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the backend rejected the call for rate/quota reasons.
    pub fn is_quota(&self) -> bool {
        match self {
            StoreError::Quota(_) => true,
            StoreError::HttpStatus { status, .. } if *status == 429 => true,
            other => other.to_string().to_ascii_lowercase().contains("quota"),
        }
    }
}

pub fn classify_failure(status: StatusCode, url: &str, body: String) -> StoreError {
    if status == StatusCode::TOO_MANY_REQUESTS || body.to_ascii_lowercase().contains("quota") {
        StoreError::Quota(format!("http status {} for {url}: {body}", status.as_u16()))
    } else {
        StoreError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        }
    }
}

/// 1-based column positions of the current-state sheet. Changing them breaks
/// every existing spreadsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub index_col: usize,
    pub timestamp_col: usize,
    pub price_col: usize,
    pub seller_col: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            index_col: 1,
            timestamp_col: 6,
            price_col: 7,
            seller_col: 8,
        }
    }
}

/// Keyed, externally provisioned rows holding the latest observation per index.
#[async_trait]
pub trait CurrentStateStore: Send + Sync {
    /// Every data row in sheet order, keyed by the header row.
    async fn all_records(&self) -> Result<Vec<SheetRecord>, StoreError>;

    /// 1-based sheet row whose index cell equals `index`.
    async fn find_row(&self, index: &str) -> Result<Option<usize>, StoreError>;

    async fn update_row(&self, row: usize, update: &RowUpdate) -> Result<(), StoreError>;
}

/// Append-only sheet of observations.
#[async_trait]
pub trait HistoricalLog: Send + Sync {
    /// Occupied rows, header included.
    async fn row_count(&self) -> Result<usize, StoreError>;

    /// Write `rows` as a contiguous block starting at 1-based `start_row`.
    async fn write_rows(&self, start_row: usize, rows: &[Vec<String>]) -> Result<(), StoreError>;
}

/// Map a header row + data rows into keyed records. Blank rows are dropped and
/// short rows are padded with empty cells.
pub fn records_from_values(values: &[Vec<String>]) -> Vec<SheetRecord> {
    let Some((header, rows)) = values.split_first() else {
        return Vec::new();
    };
    rows.iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            header
                .iter()
                .enumerate()
                .map(|(i, name)| (name.trim().to_string(), row.get(i).cloned().unwrap_or_default()))
                .collect()
        })
        .collect()
}

/// `1 -> A`, `26 -> Z`, `27 -> AA`.
pub fn column_letter(col: usize) -> String {
    let mut n = col.max(1);
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

fn quoted_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

pub fn a1_cell(title: &str, col: usize, row: usize) -> String {
    format!("{}!{}{}", quoted_title(title), column_letter(col), row)
}

pub fn a1_block(title: &str, start_row: usize, end_row: usize, width: usize) -> String {
    format!(
        "{}!A{}:{}{}",
        quoted_title(title),
        start_row,
        column_letter(width),
        end_row
    )
}

pub fn a1_column(title: &str, col: usize) -> String {
    let letter = column_letter(col);
    format!("{}!{letter}:{letter}", quoted_title(title))
}

/// Single-cell writes for one current-state row, timestamp then seller then price.
pub fn row_update_cells(
    title: &str,
    layout: &ColumnLayout,
    row: usize,
    update: &RowUpdate,
) -> Vec<(String, JsonValue)> {
    vec![
        (a1_cell(title, layout.timestamp_col, row), json!(update.timestamp)),
        (a1_cell(title, layout.seller_col, row), json!(update.seller)),
        (a1_cell(title, layout.price_col, row), json!(update.numeric_price)),
    ]
}

/// Range covering `rows` written from `start_row` down; `None` for an empty block.
pub fn block_range(title: &str, start_row: usize, rows: &[Vec<String>]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(1);
    Some(a1_block(title, start_row, start_row + rows.len() - 1, width))
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// OAuth bearer token obtained out of process.
    pub access_token: String,
    pub api_base: String,
    pub timeout: Duration,
    /// Honour `HTTP(S)_PROXY` from the environment.
    pub system_proxy: bool,
}

impl SheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            system_proxy: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Authorized handle to one spreadsheet over the Sheets v4 REST API.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    http: reqwest::Client,
    spreadsheet_url: Url,
    access_token: String,
}

impl SheetsClient {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build().context("building reqwest client")?;
        let mut spreadsheet_url =
            Url::parse(&config.api_base).with_context(|| format!("parsing {}", config.api_base))?;
        spreadsheet_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("api base {} cannot carry a path", config.api_base))?
            .pop_if_empty()
            .push(&config.spreadsheet_id);
        Ok(Self {
            http,
            spreadsheet_url,
            access_token: config.access_token,
        })
    }

    pub fn worksheet(&self, title: impl Into<String>, layout: ColumnLayout) -> Worksheet {
        Worksheet {
            client: self.clone(),
            title: title.into(),
            layout,
        }
    }

    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.spreadsheet_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<JsonValue, StoreError> {
        let resp = request.bearer_auth(&self.access_token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<JsonValue>()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, url.as_str(), body))
    }

    pub async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let mut url = self.endpoint(&["values", range]);
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "FORMATTED_VALUE");
        let body = self.send(self.http.get(url.clone()), &url).await?;
        let parsed: ValueRange =
            serde_json::from_value(body).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(parsed
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    pub async fn put_values(&self, range: &str, values: JsonValue) -> Result<(), StoreError> {
        let mut url = self.endpoint(&["values", range]);
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        let payload = json!({ "range": range, "majorDimension": "ROWS", "values": values });
        self.send(self.http.put(url.clone()).json(&payload), &url).await?;
        Ok(())
    }

    /// Write several single-cell ranges in one request.
    pub async fn batch_update(&self, cells: Vec<(String, JsonValue)>) -> Result<(), StoreError> {
        let url = self.endpoint(&["values:batchUpdate"]);
        let data = cells
            .into_iter()
            .map(|(range, value)| json!({ "range": range, "values": [[value]] }))
            .collect::<Vec<_>>();
        let payload = json!({ "valueInputOption": "USER_ENTERED", "data": data });
        self.send(self.http.post(url.clone()).json(&payload), &url).await?;
        Ok(())
    }
}

/// One tab of the spreadsheet. Serves as either store role.
#[derive(Debug, Clone)]
pub struct Worksheet {
    client: SheetsClient,
    title: String,
    layout: ColumnLayout,
}

impl Worksheet {
    pub fn title(&self) -> &str {
        &self.title
    }
}

#[async_trait]
impl CurrentStateStore for Worksheet {
    async fn all_records(&self) -> Result<Vec<SheetRecord>, StoreError> {
        let values = self
            .client
            .get_values(&quoted_title(&self.title))
            .instrument(info_span!("sheet_read", sheet = %self.title))
            .await?;
        Ok(records_from_values(&values))
    }

    async fn find_row(&self, index: &str) -> Result<Option<usize>, StoreError> {
        let column = self
            .client
            .get_values(&a1_column(&self.title, self.layout.index_col))
            .await?;
        Ok(column
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, cells)| cells.first().map(|c| c.trim()) == Some(index))
            .map(|(i, _)| i + 1))
    }

    async fn update_row(&self, row: usize, update: &RowUpdate) -> Result<(), StoreError> {
        debug!(sheet = %self.title, row, "updating current-state row");
        self.client
            .batch_update(row_update_cells(&self.title, &self.layout, row, update))
            .await
    }
}

#[async_trait]
impl HistoricalLog for Worksheet {
    async fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.client.get_values(&a1_column(&self.title, 1)).await?.len())
    }

    async fn write_rows(&self, start_row: usize, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let Some(range) = block_range(&self.title, start_row, rows) else {
            return Ok(());
        };
        self.client.put_values(&range, json!(rows)).await
    }
}

/// Process-local sheet used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySheet {
    layout: ColumnLayout,
    rows: Mutex<Vec<Vec<String>>>,
    update_failures: Mutex<HashMap<usize, String>>,
    write_failure: Mutex<Option<String>>,
    read_failure: Mutex<Option<String>>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    pub fn with_layout(mut self, layout: ColumnLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        lock(&self.rows).clone()
    }

    /// 1-based cell lookup.
    pub fn cell(&self, row: usize, col: usize) -> Option<String> {
        lock(&self.rows)
            .get(row.checked_sub(1)?)
            .and_then(|r| r.get(col.checked_sub(1)?))
            .cloned()
    }

    pub fn fail_update_of_row(&self, row: usize, message: impl Into<String>) {
        lock(&self.update_failures).insert(row, message.into());
    }

    pub fn fail_writes(&self, message: impl Into<String>) {
        *lock(&self.write_failure) = Some(message.into());
    }

    pub fn fail_reads(&self, message: impl Into<String>) {
        *lock(&self.read_failure) = Some(message.into());
    }

    fn check_read(&self) -> Result<(), StoreError> {
        match lock(&self.read_failure).as_ref() {
            Some(msg) => Err(StoreError::Backend(msg.clone())),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_cell(row: &mut Vec<String>, col: usize, value: String) {
    if row.len() < col {
        row.resize(col, String::new());
    }
    row[col - 1] = value;
}

#[async_trait]
impl CurrentStateStore for MemorySheet {
    async fn all_records(&self) -> Result<Vec<SheetRecord>, StoreError> {
        self.check_read()?;
        Ok(records_from_values(&lock(&self.rows)))
    }

    async fn find_row(&self, index: &str) -> Result<Option<usize>, StoreError> {
        self.check_read()?;
        let col = self.layout.index_col;
        Ok(lock(&self.rows)
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, row)| row.get(col - 1).map(|c| c.trim()) == Some(index))
            .map(|(i, _)| i + 1))
    }

    async fn update_row(&self, row: usize, update: &RowUpdate) -> Result<(), StoreError> {
        if let Some(msg) = lock(&self.update_failures).get(&row) {
            return Err(StoreError::Backend(msg.clone()));
        }
        let mut rows = lock(&self.rows);
        let target = row
            .checked_sub(1)
            .and_then(|i| rows.get_mut(i))
            .ok_or_else(|| StoreError::Backend(format!("row {row} out of range")))?;
        set_cell(target, self.layout.timestamp_col, update.timestamp.clone());
        set_cell(target, self.layout.seller_col, update.seller.clone());
        set_cell(target, self.layout.price_col, update.numeric_price.to_string());
        Ok(())
    }
}

#[async_trait]
impl HistoricalLog for MemorySheet {
    async fn row_count(&self) -> Result<usize, StoreError> {
        self.check_read()?;
        Ok(lock(&self.rows).len())
    }

    async fn write_rows(&self, start_row: usize, new_rows: &[Vec<String>]) -> Result<(), StoreError> {
        if let Some(msg) = lock(&self.write_failure).as_ref() {
            return Err(StoreError::Backend(msg.clone()));
        }
        if start_row == 0 {
            return Err(StoreError::Backend("rows are 1-based".to_string()));
        }
        let mut rows = lock(&self.rows);
        let needed = start_row - 1 + new_rows.len();
        if rows.len() < needed {
            rows.resize(needed, Vec::new());
        }
        for (offset, row) in new_rows.iter().enumerate() {
            rows[start_row - 1 + offset] = row.clone();
        }
        Ok(())
    }
}
