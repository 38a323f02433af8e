//! Field extraction: price + seller from a rendered product page.
//!
//! Each field is an ordered chain of CSS steps. Every step descends from the
//! element matched by the previous one, and the first miss fails the whole item.

use std::time::Duration;

use chrono::{DateTime, Local};
use pricewatch_core::ExtractedRecord;
use pricewatch_render::{RendererSession, SessionError};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pricewatch-extract";

pub const PRICE_SELECTOR: &str = ".ProductPrice_container__price__XmMWA";
pub const SELLER_SECTION_SELECTOR: &str = ".seller-information_fs-seller-information__3otO1";
pub const SELLER_CONTENT_SELECTOR: &str = r#"div[data-fs-product-details-seller__content="true"]"#;
pub const SELLER_INNER_SELECTOR: &str = "div";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionStep {
    pub name: &'static str,
    pub selector: String,
}

impl ExtractionStep {
    pub fn new(name: &'static str, selector: impl Into<String>) -> Self {
        Self {
            name,
            selector: selector.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Element whose presence means the page finished rendering.
    pub ready_marker: String,
    pub price_steps: Vec<ExtractionStep>,
    pub seller_steps: Vec<ExtractionStep>,
    pub timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ready_marker: PRICE_SELECTOR.to_string(),
            price_steps: vec![ExtractionStep::new("price", PRICE_SELECTOR)],
            seller_steps: vec![
                ExtractionStep::new("seller section", SELLER_SECTION_SELECTOR),
                ExtractionStep::new("seller content", SELLER_CONTENT_SELECTOR),
                ExtractionStep::new("seller name", SELLER_INNER_SELECTOR),
            ],
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{field}: no element for step `{step}` ({selector})")]
    ElementNotFound {
        field: &'static str,
        step: &'static str,
        selector: String,
    },
    #[error("timed out after {after:?} waiting for `{selector}`")]
    ExtractionTimeout { selector: String, after: Duration },
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error(transparent)]
    Session(SessionError),
}

impl From<SessionError> for ExtractionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::WaitTimeout { selector, after } => {
                ExtractionError::ExtractionTimeout { selector, after }
            }
            other => ExtractionError::Session(other),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledStep {
    name: &'static str,
    raw: String,
    selector: Selector,
}

#[derive(Debug, Clone)]
struct StepChain {
    field: &'static str,
    steps: Vec<CompiledStep>,
}

impl StepChain {
    fn compile(field: &'static str, steps: &[ExtractionStep]) -> Result<Self, ExtractionError> {
        let steps = steps
            .iter()
            .map(|step| {
                Ok(CompiledStep {
                    name: step.name,
                    raw: step.selector.clone(),
                    selector: parse_selector(&step.selector)?,
                })
            })
            .collect::<Result<Vec<_>, ExtractionError>>()?;
        Ok(Self { field, steps })
    }

    fn resolve(&self, root: ElementRef<'_>) -> Result<String, ExtractionError> {
        let mut current = root;
        for step in &self.steps {
            current = current
                .select(&step.selector)
                .next()
                .ok_or_else(|| ExtractionError::ElementNotFound {
                    field: self.field,
                    step: step.name,
                    selector: step.raw.clone(),
                })?;
        }
        let text = collapse_whitespace(&current.text().collect::<String>());
        if text.is_empty() {
            let last = self.steps.last();
            return Err(ExtractionError::ElementNotFound {
                field: self.field,
                step: last.map(|s| s.name).unwrap_or("text"),
                selector: last.map(|s| s.raw.clone()).unwrap_or_default(),
            });
        }
        Ok(text)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    ready_marker: String,
    timeout: Duration,
    price: StepChain,
    seller: StepChain,
}

impl FieldExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractionError> {
        parse_selector(&config.ready_marker)?;
        Ok(Self {
            price: StepChain::compile("price", &config.price_steps)?,
            seller: StepChain::compile("seller", &config.seller_steps)?,
            ready_marker: config.ready_marker,
            timeout: config.timeout,
        })
    }

    /// Wait for the page to render, then read price and seller from it.
    pub async fn extract(
        &self,
        session: &mut dyn RendererSession,
        index: &str,
    ) -> Result<ExtractedRecord, ExtractionError> {
        session.wait_for(&self.ready_marker, self.timeout).await?;
        let html = session.page_source().await?;
        self.extract_from_html(&html, index, Local::now())
    }

    /// Both fields are required; no partial record is produced.
    pub fn extract_from_html(
        &self,
        html: &str,
        index: &str,
        captured_at: DateTime<Local>,
    ) -> Result<ExtractedRecord, ExtractionError> {
        let document = Html::parse_document(html);
        let raw_price = self.price.resolve(document.root_element())?;
        let seller = self.seller.resolve(document.root_element())?;
        debug!(index, raw_price = %raw_price, seller = %seller, "fields extracted");
        Ok(ExtractedRecord {
            index: index.to_string(),
            captured_at,
            raw_price,
            seller,
        })
    }
}
