//! Scrape-extract-reconcile run orchestration.

pub mod observability;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use pricewatch_core::{format_timestamp, HistoryRow, NormalizationError, NormalizedRecord, RunBatch, WorkItem};
use pricewatch_extract::{ExtractionError, ExtractorConfig, FieldExtractor};
use pricewatch_render::{Renderer, RendererSession, SessionConfig, SessionError, SettleDelay, WebDriverRenderer};
use pricewatch_sheets::{ColumnLayout, CurrentStateStore, HistoricalLog, SheetsClient, SheetsConfig, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub use observability::{LogConfig, Observability};

pub const CRATE_NAME: &str = "pricewatch-sync";

pub const INDEX_HEADER: &str = "Index";
pub const LOCATOR_HEADER: &str = "URL";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub webdriver_url: String,
    pub headless: bool,
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
    pub extract_timeout_secs: u64,
    pub spreadsheet_id: Option<String>,
    pub access_token: Option<String>,
    pub products_sheet: String,
    pub history_sheet: String,
    pub log_backups: usize,
    pub log_max_bytes: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            webdriver_url: non_empty("PRICEWATCH_WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:9515".to_string()),
            headless: flag("PRICEWATCH_HEADLESS", true),
            settle_min_ms: number("PRICEWATCH_SETTLE_MIN_MS", 1_500),
            settle_max_ms: number("PRICEWATCH_SETTLE_MAX_MS", 3_000),
            extract_timeout_secs: number("PRICEWATCH_EXTRACT_TIMEOUT_SECS", 10),
            spreadsheet_id: non_empty("PRICEWATCH_SPREADSHEET_ID"),
            access_token: non_empty("PRICEWATCH_ACCESS_TOKEN"),
            products_sheet: non_empty("PRICEWATCH_PRODUCTS_SHEET").unwrap_or_else(|| "Sheet1".to_string()),
            history_sheet: non_empty("PRICEWATCH_HISTORY_SHEET").unwrap_or_else(|| "History".to_string()),
            log_backups: number("PRICEWATCH_LOG_BACKUPS", 5) as usize,
            log_max_bytes: number("PRICEWATCH_LOG_MAX_BYTES", observability::DEFAULT_MAX_BYTES),
            scheduler_enabled: flag("PRICEWATCH_SCHEDULER_ENABLED", false),
            sync_cron: non_empty("PRICEWATCH_SYNC_CRON").unwrap_or_else(|| "0 0 6,18 * * *".to_string()),
            workspace_root: non_empty("PRICEWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn settle_delay(&self) -> SettleDelay {
        SettleDelay::new(
            Duration::from_millis(self.settle_min_ms),
            Duration::from_millis(self.settle_max_ms),
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            headless: self.headless,
            ..Default::default()
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            timeout: Duration::from_secs(self.extract_timeout_secs),
            ..Default::default()
        }
    }

    pub fn sheets_config(&self) -> Result<SheetsConfig> {
        let spreadsheet_id = self
            .spreadsheet_id
            .clone()
            .context("PRICEWATCH_SPREADSHEET_ID is not set")?;
        let access_token = self
            .access_token
            .clone()
            .context("PRICEWATCH_ACCESS_TOKEN is not set")?;
        Ok(SheetsConfig::new(spreadsheet_id, access_token))
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            root: self.workspace_root.clone(),
            backups: self.log_backups,
            max_bytes: self.log_max_bytes,
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.workspace_root.join(observability::ERRORS_DIR).join("pages")
    }
}

/// Every failure category a run can log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SessionStartFailure,
    SourceUnavailable,
    NavigationFailure,
    ElementNotFound,
    ExtractionTimeout,
    MalformedPrice,
    RowNotFound,
    QuotaExceeded,
    StoreFailure,
    Unclassified,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SessionStartFailure => "session_start_failure",
            FailureKind::SourceUnavailable => "source_unavailable",
            FailureKind::NavigationFailure => "navigation_failure",
            FailureKind::ElementNotFound => "element_not_found",
            FailureKind::ExtractionTimeout => "extraction_timeout",
            FailureKind::MalformedPrice => "malformed_price",
            FailureKind::RowNotFound => "row_not_found",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::StoreFailure => "store_failure",
            FailureKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_store_error(err: &StoreError) -> FailureKind {
    if err.is_quota() {
        FailureKind::QuotaExceeded
    } else {
        FailureKind::StoreFailure
    }
}

/// Faults that abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("renderer session could not start: {0}")]
    SessionStart(#[source] SessionError),
    #[error("work source unavailable: {0}")]
    SourceUnavailable(#[source] StoreError),
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::SessionStart(_) => FailureKind::SessionStartFailure,
            RunError::SourceUnavailable(_) => FailureKind::SourceUnavailable,
        }
    }
}

/// Why a single work item was skipped.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error(transparent)]
    Navigation(SessionError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error("item processing panicked: {0}")]
    Panicked(String),
}

impl ItemFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ItemFailure::Navigation(_) => FailureKind::NavigationFailure,
            ItemFailure::Extraction(ExtractionError::ElementNotFound { .. }) => FailureKind::ElementNotFound,
            ItemFailure::Extraction(ExtractionError::ExtractionTimeout { .. }) => FailureKind::ExtractionTimeout,
            ItemFailure::Extraction(_) => FailureKind::Unclassified,
            ItemFailure::Normalization(_) => FailureKind::MalformedPrice,
            ItemFailure::Panicked(_) => FailureKind::Unclassified,
        }
    }
}

/// Snapshot of the input table: one item per row with both an index and a locator.
pub struct WorkSource<'a> {
    store: &'a dyn CurrentStateStore,
}

impl<'a> WorkSource<'a> {
    pub fn new(store: &'a dyn CurrentStateStore) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<WorkItem>, StoreError> {
        let records = self.store.all_records().await?;
        let mut items = Vec::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            let index = record.get(INDEX_HEADER).map(|s| s.trim()).unwrap_or_default();
            let locator = record.get(LOCATOR_HEADER).map(|s| s.trim()).unwrap_or_default();
            if index.is_empty() || locator.is_empty() {
                warn!(position, index, locator, "skipping input row without index or URL");
                continue;
            }
            items.push(WorkItem::new(index, locator));
        }
        Ok(items)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated { row: usize },
    RowNotFound,
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub index: String,
    pub outcome: UpdateOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryOutcome {
    Skipped,
    Appended { start_row: usize, rows: usize },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub records: Vec<RecordOutcome>,
    pub history: HistoryOutcome,
}

impl ReconcileReport {
    pub fn updated(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, UpdateOutcome::Updated { .. }))
            .count()
    }

    pub fn not_found(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.outcome == UpdateOutcome::RowNotFound)
            .map(|r| r.index.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, FailureKind)> {
        self.records
            .iter()
            .filter_map(|r| match &r.outcome {
                UpdateOutcome::Failed { kind, .. } => Some((r.index.as_str(), *kind)),
                _ => None,
            })
            .collect()
    }
}

/// Writes a batch into the current-state store and appends it to the log.
pub struct Reconciler<'a> {
    current: &'a dyn CurrentStateStore,
    history: &'a dyn HistoricalLog,
}

impl<'a> Reconciler<'a> {
    pub fn new(current: &'a dyn CurrentStateStore, history: &'a dyn HistoricalLog) -> Self {
        Self { current, history }
    }

    /// Never fails as a whole: each record's update and the history append are
    /// attempted independently and their outcomes reported.
    pub async fn apply(&self, batch: &RunBatch) -> ReconcileReport {
        let mut records = Vec::with_capacity(batch.len());
        for record in batch.records() {
            let outcome = self.update_current(record).await;
            records.push(RecordOutcome {
                index: record.index().to_string(),
                outcome,
            });
        }
        let history = self.append_history(&batch.history_rows()).await;
        ReconcileReport { records, history }
    }

    async fn update_current(&self, record: &NormalizedRecord) -> UpdateOutcome {
        let index = record.index();
        let row = match self.current.find_row(index).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(kind = %FailureKind::RowNotFound, index, "no current-state row for index");
                return UpdateOutcome::RowNotFound;
            }
            Err(err) => return store_failure(index, "lookup", err),
        };
        match self.current.update_row(row, &record.row_update()).await {
            Ok(()) => {
                info!(
                    index,
                    row,
                    price = record.numeric_price(),
                    seller = %record.seller(),
                    "current-state row updated"
                );
                UpdateOutcome::Updated { row }
            }
            Err(err) => store_failure(index, "update", err),
        }
    }

    /// First append writes the header row too; later ones start right after
    /// the last occupied row.
    pub async fn append_history(&self, rows: &[HistoryRow]) -> HistoryOutcome {
        if rows.is_empty() {
            return HistoryOutcome::Skipped;
        }
        let existing = match self.history.row_count().await {
            Ok(n) => n,
            Err(err) => return history_failure(err),
        };

        let mut block: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
        let start_row = if existing == 0 {
            block.push(HistoryRow::HEADER.iter().map(|h| h.to_string()).collect());
            1
        } else {
            existing + 1
        };
        block.extend(rows.iter().map(HistoryRow::to_cells));

        match self.history.write_rows(start_row, &block).await {
            Ok(()) => {
                info!(start_row, rows = rows.len(), "history appended");
                HistoryOutcome::Appended {
                    start_row,
                    rows: rows.len(),
                }
            }
            Err(err) => history_failure(err),
        }
    }
}

fn store_failure(index: &str, op: &str, err: StoreError) -> UpdateOutcome {
    let kind = classify_store_error(&err);
    if kind == FailureKind::QuotaExceeded {
        warn!(%kind, index, op, error = %err, "store quota hit; retry on a later run");
    } else {
        error!(%kind, index, op, error = %err, "current-state store failure");
    }
    UpdateOutcome::Failed {
        kind,
        message: err.to_string(),
    }
}

fn history_failure(err: StoreError) -> HistoryOutcome {
    let kind = classify_store_error(&err);
    error!(%kind, error = %err, "history append failed; current-state updates kept");
    HistoryOutcome::Failed {
        kind,
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub index: String,
    pub locator: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub batch_stamp: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub items_seen: usize,
    pub buffered: usize,
    pub skipped: Vec<SkippedItem>,
    pub reconcile: ReconcileReport,
}

impl RunReport {
    pub fn skipped_by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.skipped {
            *counts.entry(item.kind).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Hash-addressed copies of pages whose extraction failed.
#[derive(Debug, Clone)]
pub struct PageSnapshotStore {
    root: PathBuf,
}

impl PageSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn snapshot_relative_path(captured_at: DateTime<Local>, index: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(format_timestamp(captured_at))
            .join(path_slug(index))
            .join(format!("{content_hash}.html"))
    }

    /// Write via temp file + rename so a partial snapshot is never visible.
    pub async fn store_page(
        &self,
        captured_at: DateTime<Local>,
        index: &str,
        html: &str,
    ) -> Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(html.as_bytes());
        let relative_path = Self::snapshot_relative_path(captured_at, index, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let snapshot = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(html.as_bytes())
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming snapshot into place at {}", absolute_path.display())
            });
        }
        Ok(snapshot(false))
    }
}

fn path_slug(input: &str) -> String {
    let slug = input
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Owns the run loop and the renderer session for its duration.
pub struct RunController {
    renderer: Arc<dyn Renderer>,
    current: Arc<dyn CurrentStateStore>,
    history: Arc<dyn HistoricalLog>,
    extractor: FieldExtractor,
    session_config: SessionConfig,
    settle: SettleDelay,
    snapshots: Option<PageSnapshotStore>,
}

impl RunController {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        current: Arc<dyn CurrentStateStore>,
        history: Arc<dyn HistoricalLog>,
        extractor: FieldExtractor,
    ) -> Self {
        Self {
            renderer,
            current,
            history,
            extractor,
            session_config: SessionConfig::default(),
            settle: SettleDelay::default(),
            snapshots: None,
        }
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_settle_delay(mut self, settle: SettleDelay) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_failure_snapshots(mut self, store: PageSnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// One full pass. The session is closed exactly once on every path that
    /// opened it, including a fatal work-source failure, a panic, or the run
    /// future being dropped.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        let span = info_span!("run", %run_id, batch = %format_timestamp(started_at));

        async move {
            let session = self
                .renderer
                .open(&self.session_config)
                .await
                .map_err(|err| {
                    error!(kind = %FailureKind::SessionStartFailure, error = %err, "aborting run");
                    RunError::SessionStart(err)
                })?;

            let mut guard = SessionGuard::new(session);
            let outcome = self.drive(guard.session(), run_id, started_at).await;
            guard.close().await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &mut dyn RendererSession,
        run_id: Uuid,
        started_at: DateTime<Local>,
    ) -> Result<RunReport, RunError> {
        let items = WorkSource::new(self.current.as_ref())
            .list()
            .await
            .map_err(|err| {
                error!(kind = %FailureKind::SourceUnavailable, error = %err, "aborting run");
                RunError::SourceUnavailable(err)
            })?;
        info!(items = items.len(), "work list loaded");

        let mut batch = RunBatch::new(run_id, started_at);
        let mut skipped = Vec::new();

        for item in &items {
            let span = info_span!("item", index = %item.index, locator = %item.locator);
            let attempt = AssertUnwindSafe(self.process_item(session, item))
                .catch_unwind()
                .instrument(span.clone())
                .await;
            let outcome = attempt
                .unwrap_or_else(|payload| Err(ItemFailure::Panicked(panic_message(&*payload))));
            match outcome {
                Ok(record) => {
                    info!(
                        parent: &span,
                        raw_price = %record.raw_price(),
                        price = record.numeric_price(),
                        seller = %record.seller(),
                        "item captured"
                    );
                    batch.push(record);
                }
                Err(failure) => {
                    let kind = failure.kind();
                    warn!(parent: &span, %kind, error = %failure, "item skipped");
                    if matches!(failure, ItemFailure::Extraction(_)) {
                        self.snapshot_page(session, item).instrument(span).await;
                    }
                    skipped.push(SkippedItem {
                        index: item.index.clone(),
                        locator: item.locator.clone(),
                        kind,
                        reason: failure.to_string(),
                    });
                }
            }
        }

        let buffered = batch.len();
        let reconcile = Reconciler::new(self.current.as_ref(), self.history.as_ref())
            .apply(&batch)
            .await;

        let report = RunReport {
            run_id,
            batch_stamp: batch.stamp.clone(),
            started_at,
            finished_at: Local::now(),
            items_seen: items.len(),
            buffered,
            skipped,
            reconcile,
        };
        info!(
            items = report.items_seen,
            buffered = report.buffered,
            skipped = report.skipped.len(),
            updated = report.reconcile.updated(),
            not_found = report.reconcile.not_found().len(),
            "run finished"
        );
        match serde_json::to_string(&report) {
            Ok(json) => debug!(report = %json, "run report"),
            Err(err) => debug!(error = %err, "run report not serializable"),
        }
        Ok(report)
    }

    async fn process_item(
        &self,
        session: &mut dyn RendererSession,
        item: &WorkItem,
    ) -> Result<NormalizedRecord, ItemFailure> {
        let settle = self.settle.sample();
        debug!(settle_ms = settle.as_millis() as u64, "accessing url");
        session
            .navigate(&item.locator, settle)
            .await
            .map_err(ItemFailure::Navigation)?;
        let extracted = self.extractor.extract(session, &item.index).await?;
        Ok(extracted.normalize()?)
    }

    async fn snapshot_page(&self, session: &mut dyn RendererSession, item: &WorkItem) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let html = match session.page_source().await {
            Ok(html) => html,
            Err(err) => {
                debug!(error = %err, "page source unavailable for snapshot");
                return;
            }
        };
        match store.store_page(Local::now(), &item.index, &html).await {
            Ok(stored) => info!(path = %stored.absolute_path.display(), "failed page saved"),
            Err(err) => warn!(kind = %FailureKind::Unclassified, error = %err, "could not save failed page"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Holds the open session for one run. Dropped while still open (unwinding or
/// a cancelled run), it hands the session to a background close task.
struct SessionGuard {
    session: Box<dyn RendererSession>,
    open: bool,
}

impl SessionGuard {
    fn new(session: Box<dyn RendererSession>) -> Self {
        Self {
            session,
            open: true,
        }
    }

    fn session(&mut self) -> &mut dyn RendererSession {
        self.session.as_mut()
    }

    async fn close(mut self) {
        if let Err(err) = self.session.close().await {
            warn!(kind = %FailureKind::Unclassified, error = %err, "renderer session close failed");
        }
        self.open = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let mut session = std::mem::replace(&mut self.session, Box::new(ReleasedSession));
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(kind = %FailureKind::Unclassified, "no runtime left to close renderer session");
            return;
        };
        warn!("run ended before teardown; closing renderer session in background");
        runtime.spawn(
            async move {
                if let Err(err) = session.close().await {
                    warn!(kind = %FailureKind::Unclassified, error = %err, "renderer session close failed");
                }
            }
            .instrument(Span::current()),
        );
    }
}

/// Stand-in left behind once the real session has been handed off.
struct ReleasedSession;

#[async_trait]
impl RendererSession for ReleasedSession {
    async fn navigate(&mut self, _locator: &str, _settle: Duration) -> Result<(), SessionError> {
        Err(SessionError::Closed)
    }

    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        Err(SessionError::Closed)
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        Err(SessionError::Closed)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Wire the WebDriver renderer and the Sheets stores from `config`.
pub fn build_controller(config: &RunConfig) -> Result<RunController> {
    let sheets = SheetsClient::new(config.sheets_config()?)?;
    let products = Arc::new(sheets.worksheet(&config.products_sheet, ColumnLayout::default()));
    let history = Arc::new(sheets.worksheet(&config.history_sheet, ColumnLayout::default()));
    let extractor = FieldExtractor::new(config.extractor_config()).context("compiling extractor selectors")?;

    Ok(RunController::new(
        Arc::new(WebDriverRenderer::new(&config.webdriver_url)),
        products,
        history,
        extractor,
    )
    .with_session_config(config.session_config())
    .with_settle_delay(config.settle_delay())
    .with_failure_snapshots(PageSnapshotStore::new(config.snapshot_dir())))
}

pub async fn build_scheduler(controller: Arc<RunController>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let controller = Arc::clone(&controller);
        Box::pin(async move {
            match controller.run().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    buffered = report.buffered,
                    "scheduled run complete"
                ),
                Err(err) => error!(kind = %err.kind(), error = %err, "scheduled run aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run on `config.sync_cron` until Ctrl-C.
pub async fn run_scheduled(controller: Arc<RunController>, cron: &str) -> Result<()> {
    let mut sched = build_scheduler(controller, cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pricewatch_core::ExtractedRecord;
    use pricewatch_sheets::MemorySheet;
    use tempfile::tempdir;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn products(indices: &[&str]) -> MemorySheet {
        let mut rows = vec![cells(&["Index", "URL", "Name", "", "", "Timestamp", "Price", "Seller"])];
        for index in indices {
            rows.push(cells(&[index, &format!("https://shop.test/p/{index}"), "Item"]));
        }
        MemorySheet::with_rows(rows)
    }

    fn batch(entries: &[(&str, &str, &str)]) -> RunBatch {
        let at = Local.with_ymd_and_hms(2024, 6, 29, 10, 0, 0).single().unwrap();
        let mut batch = RunBatch::new(Uuid::new_v4(), at);
        for (index, price, seller) in entries {
            batch.push(
                ExtractedRecord {
                    index: index.to_string(),
                    captured_at: at,
                    raw_price: price.to_string(),
                    seller: seller.to_string(),
                }
                .normalize()
                .unwrap(),
            );
        }
        batch
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = RunConfig::from_lookup(|_| None);
        assert!(defaults.headless);
        assert_eq!(defaults.settle_delay().min(), Duration::from_millis(1_500));
        assert_eq!(defaults.products_sheet, "Sheet1");
        assert_eq!(defaults.log_config().max_bytes, 5 * 1024 * 1024);
        assert_eq!(defaults.log_config().backups, 5);
        assert!(defaults.sheets_config().is_err());

        let overridden = RunConfig::from_lookup(|key| match key {
            "PRICEWATCH_HEADLESS" => Some("false".to_string()),
            "PRICEWATCH_SETTLE_MIN_MS" => Some("200".to_string()),
            "PRICEWATCH_SETTLE_MAX_MS" => Some("100".to_string()),
            "PRICEWATCH_SPREADSHEET_ID" => Some("abc".to_string()),
            "PRICEWATCH_ACCESS_TOKEN" => Some("tok".to_string()),
            "PRICEWATCH_WORKSPACE_ROOT" => Some("/var/lib/pricewatch".to_string()),
            _ => None,
        });
        assert!(!overridden.session_config().headless);
        assert_eq!(overridden.settle_delay().max(), Duration::from_millis(200));
        assert_eq!(overridden.sheets_config().unwrap().spreadsheet_id, "abc");
        assert_eq!(
            overridden.snapshot_dir(),
            PathBuf::from("/var/lib/pricewatch/errors/pages")
        );
    }

    #[tokio::test]
    async fn work_source_projects_index_and_url_in_order() {
        let sheet = MemorySheet::with_rows(vec![
            cells(&["Index", "URL", "Name"]),
            cells(&["7", "https://shop.test/a", "A"]),
            cells(&["", "https://shop.test/orphan", "B"]),
            cells(&["3", "https://shop.test/c", "C"]),
        ]);
        let items = WorkSource::new(&sheet).list().await.unwrap();
        assert_eq!(
            items,
            vec![
                WorkItem::new("7", "https://shop.test/a"),
                WorkItem::new("3", "https://shop.test/c"),
            ]
        );
    }

    #[tokio::test]
    async fn work_source_read_failure_propagates() {
        let sheet = products(&["1"]);
        sheet.fail_reads("unavailable");
        assert!(WorkSource::new(&sheet).list().await.is_err());
    }

    #[tokio::test]
    async fn missing_row_is_reported_and_history_keeps_all_records() {
        let current = products(&["1", "3"]);
        let history = MemorySheet::new();
        let batch = batch(&[
            ("1", "COP 10.000", "Acme"),
            ("2", "COP 20.000", "Beta"),
            ("3", "COP 30.000", "Gamma"),
        ]);

        let report = Reconciler::new(&current, &history).apply(&batch).await;

        assert_eq!(report.updated(), 2);
        assert_eq!(report.not_found(), vec!["2"]);
        assert_eq!(current.cell(2, 7).as_deref(), Some("10000"));
        assert_eq!(current.cell(3, 8).as_deref(), Some("Gamma"));
        assert_eq!(report.history, HistoryOutcome::Appended { start_row: 1, rows: 3 });
        let log = history.rows();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], cells(&["Timestamp", "Seller", "Price"]));
        assert_eq!(log[2], cells(&["2024-06-29_100000", "Beta", "COP 20.000"]));
    }

    #[tokio::test]
    async fn one_failing_update_does_not_stop_the_rest() {
        let current = products(&["1", "2", "3"]);
        current.fail_update_of_row(3, "Quota exceeded for quota metric 'Write requests'");
        let history = MemorySheet::new();
        let batch = batch(&[
            ("1", "COP 1", "A"),
            ("2", "COP 2", "B"),
            ("3", "COP 3", "C"),
        ]);

        let report = Reconciler::new(&current, &history).apply(&batch).await;

        assert_eq!(report.updated(), 2);
        assert_eq!(report.failed(), vec![("2", FailureKind::QuotaExceeded)]);
        assert_eq!(current.cell(4, 7).as_deref(), Some("3"));
        assert_eq!(current.cell(3, 7), None);
    }

    #[tokio::test]
    async fn history_appends_are_contiguous_across_batches() {
        let current = products(&["1", "2", "3"]);
        let history = MemorySheet::new();
        let reconciler = Reconciler::new(&current, &history);

        reconciler.apply(&batch(&[("1", "COP 1", "A"), ("2", "COP 2", "B")])).await;
        let second = reconciler.apply(&batch(&[("3", "COP 3", "C")])).await;

        assert_eq!(second.history, HistoryOutcome::Appended { start_row: 4, rows: 1 });
        let sellers: Vec<_> = history.rows().iter().skip(1).map(|r| r[1].clone()).collect();
        assert_eq!(sellers, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn history_failure_keeps_current_state_updates() {
        let current = products(&["1"]);
        let history = MemorySheet::new();
        history.fail_writes("backend unavailable");

        let report = Reconciler::new(&current, &history)
            .apply(&batch(&[("1", "COP 5.000", "Acme")]))
            .await;

        assert_eq!(report.updated(), 1);
        assert!(matches!(
            report.history,
            HistoryOutcome::Failed { kind: FailureKind::StoreFailure, .. }
        ));
        assert_eq!(current.cell(2, 7).as_deref(), Some("5000"));
    }

    #[tokio::test]
    async fn empty_batch_skips_history() {
        let current = products(&["1"]);
        let history = MemorySheet::new();
        let report = Reconciler::new(&current, &history).apply(&batch(&[])).await;
        assert_eq!(report.history, HistoryOutcome::Skipped);
        assert!(history.rows().is_empty());
    }

    #[test]
    fn item_failures_map_to_taxonomy() {
        let nav = ItemFailure::Navigation(SessionError::Navigation {
            locator: "u".into(),
            reason: "dns".into(),
        });
        assert_eq!(nav.kind(), FailureKind::NavigationFailure);
        let timeout = ItemFailure::Extraction(ExtractionError::ExtractionTimeout {
            selector: "p".into(),
            after: Duration::from_secs(1),
        });
        assert_eq!(timeout.kind(), FailureKind::ExtractionTimeout);
        let malformed = ItemFailure::Normalization(NormalizationError::MalformedPrice {
            raw: "x".into(),
            reason: "r",
        });
        assert_eq!(malformed.kind(), FailureKind::MalformedPrice);
        let other = ItemFailure::Extraction(ExtractionError::Session(SessionError::Closed));
        assert_eq!(other.kind(), FailureKind::Unclassified);
        let panicked = ItemFailure::Panicked("boom".into());
        assert_eq!(panicked.kind(), FailureKind::Unclassified);
    }

    #[test]
    fn panic_payloads_become_readable_reasons() {
        let literal: Box<dyn Any + Send> = Box::new("driver crashed");
        assert_eq!(panic_message(&*literal), "driver crashed");
        let formatted: Box<dyn Any + Send> = Box::new(format!("index {}", 4));
        assert_eq!(panic_message(&*formatted), "index 4");
        let opaque: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*opaque), "non-string panic payload");
    }

    #[tokio::test]
    async fn failed_pages_are_stored_once_per_content() {
        let dir = tempdir().expect("tempdir");
        let store = PageSnapshotStore::new(dir.path());
        let at = Local.with_ymd_and_hms(2024, 6, 29, 10, 0, 0).single().unwrap();

        let first = store.store_page(at, "SKU/42", "<html>x</html>").await.expect("first");
        let second = store.store_page(at, "SKU/42", "<html>x</html>").await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("2024-06-29_100000/SKU-42"));
        assert!(first.absolute_path.exists());
    }
}
