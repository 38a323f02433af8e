use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_extract::{ExtractorConfig, FieldExtractor};
use pricewatch_render::{Renderer, RendererSession, SessionConfig, SessionError, SettleDelay};
use pricewatch_sheets::MemorySheet;
use pricewatch_sync::{FailureKind, HistoryOutcome, PageSnapshotStore, RunController, RunError};
use tempfile::tempdir;

#[derive(Clone)]
enum Page {
    Html(String),
    Unreachable,
    NeverReady,
    Crashes,
    Hangs,
}

#[derive(Default)]
struct Browser {
    pages: HashMap<String, Page>,
    refuse_start: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    visited: Mutex<Vec<String>>,
}

impl Browser {
    fn with_page(mut self, locator: &str, page: Page) -> Self {
        self.pages.insert(locator.to_string(), page);
        self
    }

    fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

struct ScriptedRenderer(Arc<Browser>);

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn open(&self, _config: &SessionConfig) -> Result<Box<dyn RendererSession>, SessionError> {
        if self.0.refuse_start {
            return Err(SessionError::Start("chromedriver not reachable".to_string()));
        }
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            browser: Arc::clone(&self.0),
            current: None,
            closed: false,
        }))
    }
}

struct ScriptedSession {
    browser: Arc<Browser>,
    current: Option<Page>,
    closed: bool,
}

#[async_trait]
impl RendererSession for ScriptedSession {
    async fn navigate(&mut self, locator: &str, _settle: Duration) -> Result<(), SessionError> {
        self.browser.visited.lock().unwrap().push(locator.to_string());
        match self.browser.pages.get(locator) {
            Some(Page::Unreachable) | None => Err(SessionError::Navigation {
                locator: locator.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            }),
            Some(Page::Crashes) => panic!("renderer crashed on {locator}"),
            Some(Page::Hangs) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Some(page) => {
                self.current = Some(page.clone());
                Ok(())
            }
        }
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        match &self.current {
            Some(Page::Html(html)) if html.contains(selector.trim_start_matches('.')) => Ok(()),
            _ => Err(SessionError::WaitTimeout {
                selector: selector.to_string(),
                after: timeout,
            }),
        }
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        match &self.current {
            Some(Page::Html(html)) => Ok(html.clone()),
            _ => Ok("<html><body>loading</body></html>".to_string()),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.browser.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn product_page(price: &str, seller: &str) -> Page {
    Page::Html(format!(
        r#"<html><body>
            <p class="ProductPrice_container__price__XmMWA">{price}</p>
            <div class="seller-information_fs-seller-information__3otO1">
              <div data-fs-product-details-seller__content="true"><div>{seller}</div></div>
            </div>
        </body></html>"#
    ))
}

fn cells(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn products(rows: &[(&str, &str)]) -> Arc<MemorySheet> {
    let mut all = vec![cells(&["Index", "URL", "Name", "", "", "Timestamp", "Price", "Seller"])];
    for (index, url) in rows {
        all.push(cells(&[index, url, "Item", "", "", "", "", ""]));
    }
    Arc::new(MemorySheet::with_rows(all))
}

fn controller(browser: &Arc<Browser>, current: &Arc<MemorySheet>, history: &Arc<MemorySheet>) -> RunController {
    let extractor = FieldExtractor::new(ExtractorConfig {
        timeout: Duration::from_millis(50),
        ..Default::default()
    })
    .unwrap();
    RunController::new(
        Arc::new(ScriptedRenderer(Arc::clone(browser))),
        current.clone(),
        history.clone(),
        extractor,
    )
    .with_settle_delay(SettleDelay::none())
}

#[tokio::test]
async fn one_good_item_and_one_unreachable_item() {
    let browser = Arc::new(
        Browser::default()
            .with_page("https://shop.test/a", product_page("COP 50.000", "Acme"))
            .with_page("https://shop.test/b", Page::Unreachable),
    );
    let current = products(&[("1", "https://shop.test/a"), ("2", "https://shop.test/b")]);
    let history = Arc::new(MemorySheet::new());

    let report = controller(&browser, &current, &history).run().await.unwrap();

    assert_eq!(report.items_seen, 2);
    assert_eq!(report.buffered, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, "2");
    assert_eq!(report.skipped[0].kind, FailureKind::NavigationFailure);

    assert_eq!(current.cell(2, 7).as_deref(), Some("50000"));
    assert_eq!(current.cell(2, 8).as_deref(), Some("Acme"));
    assert_eq!(current.cell(3, 7).as_deref(), Some(""));
    assert_eq!(current.cell(3, 8).as_deref(), Some(""));

    assert_eq!(report.reconcile.history, HistoryOutcome::Appended { start_row: 1, rows: 1 });
    let log = history.rows();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1][1], "Acme");
    assert_eq!(log[1][2], "COP 50.000");

    assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_closes_once_when_every_navigation_fails() {
    let browser = Arc::new(Browser::default());
    let current = products(&[
        ("1", "https://shop.test/x"),
        ("2", "https://shop.test/y"),
        ("3", "https://shop.test/z"),
    ]);
    let history = Arc::new(MemorySheet::new());

    let report = controller(&browser, &current, &history).run().await.unwrap();

    assert_eq!(report.buffered, 0);
    assert_eq!(
        report.skipped_by_kind().get(&FailureKind::NavigationFailure),
        Some(&3)
    );
    assert_eq!(report.reconcile.history, HistoryOutcome::Skipped);
    assert!(history.rows().is_empty());
    assert_eq!(browser.opens.load(Ordering::SeqCst), 1);
    assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_item_does_not_stop_later_items() {
    let browser = Arc::new(
        Browser::default()
            .with_page("https://shop.test/1", product_page("COP 1.000", "Uno"))
            .with_page("https://shop.test/2", Page::Unreachable)
            .with_page("https://shop.test/3", Page::NeverReady)
            .with_page("https://shop.test/4", product_page("COP no-price", "Cuatro"))
            .with_page("https://shop.test/5", product_page("COP 5.500", "Cinco")),
    );
    let current = products(&[
        ("1", "https://shop.test/1"),
        ("2", "https://shop.test/2"),
        ("3", "https://shop.test/3"),
        ("4", "https://shop.test/4"),
        ("5", "https://shop.test/5"),
    ]);
    let history = Arc::new(MemorySheet::new());

    let report = controller(&browser, &current, &history).run().await.unwrap();

    assert_eq!(browser.visited().len(), 5);
    assert_eq!(report.buffered, 2);
    let kinds: Vec<_> = report.skipped.iter().map(|s| (s.index.as_str(), s.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("2", FailureKind::NavigationFailure),
            ("3", FailureKind::ExtractionTimeout),
            ("4", FailureKind::MalformedPrice),
        ]
    );
    assert_eq!(current.cell(6, 7).as_deref(), Some("5500"));
    let sellers: Vec<_> = history.rows().iter().skip(1).map(|r| r[1].clone()).collect();
    assert_eq!(sellers, vec!["Uno", "Cinco"]);
}

#[tokio::test]
async fn unreadable_work_source_aborts_but_still_closes() {
    let browser = Arc::new(Browser::default());
    let current = products(&[("1", "https://shop.test/a")]);
    current.fail_reads("503 backend error");
    let history = Arc::new(MemorySheet::new());

    let err = controller(&browser, &current, &history).run().await.unwrap_err();

    assert!(matches!(err, RunError::SourceUnavailable(_)));
    assert_eq!(err.kind(), FailureKind::SourceUnavailable);
    assert!(browser.visited().is_empty());
    assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_start_failure_aborts_before_any_work() {
    let browser = Arc::new(Browser {
        refuse_start: true,
        ..Default::default()
    });
    let current = products(&[("1", "https://shop.test/a")]);
    let history = Arc::new(MemorySheet::new());

    let err = controller(&browser, &current, &history).run().await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::SessionStartFailure);
    assert_eq!(browser.closes.load(Ordering::SeqCst), 0);
    assert!(history.rows().is_empty());
}

#[tokio::test]
async fn extraction_failures_leave_a_page_snapshot() {
    let dir = tempdir().expect("tempdir");
    let broken = Page::Html(
        r#"<html><body><p class="ProductPrice_container__price__XmMWA">COP 9.000</p></body></html>"#
            .to_string(),
    );
    let browser = Arc::new(Browser::default().with_page("https://shop.test/a", broken));
    let current = products(&[("1", "https://shop.test/a")]);
    let history = Arc::new(MemorySheet::new());

    let report = controller(&browser, &current, &history)
        .with_failure_snapshots(PageSnapshotStore::new(dir.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(report.skipped[0].kind, FailureKind::ElementNotFound);
    let stamp_dirs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(stamp_dirs.len(), 1);
    let item_dir = stamp_dirs[0].as_ref().unwrap().path().join("1");
    assert_eq!(std::fs::read_dir(item_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn panicking_item_is_skipped_and_the_run_continues() {
    let browser = Arc::new(
        Browser::default()
            .with_page("https://shop.test/1", Page::Crashes)
            .with_page("https://shop.test/2", product_page("COP 2.000", "Dos"))
            .with_page("https://shop.test/3", product_page("COP 3.000", "Tres")),
    );
    let current = products(&[
        ("1", "https://shop.test/1"),
        ("2", "https://shop.test/2"),
        ("3", "https://shop.test/3"),
    ]);
    let history = Arc::new(MemorySheet::new());

    let report = controller(&browser, &current, &history).run().await.unwrap();

    assert_eq!(browser.visited().len(), 3);
    assert_eq!(report.buffered, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, "1");
    assert_eq!(report.skipped[0].kind, FailureKind::Unclassified);
    assert!(report.skipped[0].reason.contains("renderer crashed"));
    assert_eq!(current.cell(3, 7).as_deref(), Some("2000"));
    assert_eq!(history.rows().len(), 3);
    assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_run_still_releases_the_session() {
    let browser = Arc::new(
        Browser::default()
            .with_page("https://shop.test/1", Page::Hangs)
            .with_page("https://shop.test/2", product_page("COP 2.000", "Dos")),
    );
    let current = products(&[("1", "https://shop.test/1"), ("2", "https://shop.test/2")]);
    let history = Arc::new(MemorySheet::new());
    let controller = controller(&browser, &current, &history);

    let outcome = tokio::time::timeout(Duration::from_millis(50), controller.run()).await;
    assert!(outcome.is_err(), "run should still be navigating");

    for _ in 0..100 {
        if browser.closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(browser.visited(), vec!["https://shop.test/1".to_string()]);
    assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
    assert!(history.rows().is_empty());
}
