//! Page-by-page session orchestration.
//!
//! A single logical thread drives navigation and extraction: pages in
//! strictly increasing index order, listings in document order, one rendered
//! page in flight. The controller suspends only at the limiter gate and the
//! page fetch; everything between is synchronous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use scraper::Html;
use tracing::{debug, info, warn};

use crate::config::ScrapeConfig;
use crate::extract::FieldExtractor;
use crate::limiter::RateLimiter;
use crate::models::ListingRecord;
use crate::page::{PageError, PageSource, WaitPolicy};
use crate::store::ListingStore;
use crate::validate::RecordValidator;

/// The portal paginates search results 48 listings at a time.
const LISTINGS_PER_PAGE: usize = 48;

/// Minimum attempts before the failure-rate breaker may trip.
const MIN_PAGE_SAMPLE: usize = 3;
const MIN_LISTING_SAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Throttled,
    Navigating,
    Extracting,
    Paginating,
    Completed,
    Aborted,
}

/// What one bounded session did. Returned on every exit path, including
/// aborts; a session never silently truncates its results.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub final_state: SessionState,
    pub pages_attempted: usize,
    pub pages_failed: usize,
    pub listings_extracted: usize,
    pub listings_failed: usize,
    pub records_saved: usize,
    pub records_skipped: usize,
    pub stopped_early: bool,
}

impl SessionSummary {
    fn new() -> Self {
        Self {
            final_state: SessionState::Idle,
            pages_attempted: 0,
            pages_failed: 0,
            listings_extracted: 0,
            listings_failed: 0,
            records_saved: 0,
            records_skipped: 0,
            stopped_early: false,
        }
    }

    pub fn aborted(&self) -> bool {
        self.final_state == SessionState::Aborted
    }
}

/// Everything harvested from one rendered page.
struct PageHarvest {
    records: Vec<ListingRecord>,
    cards_found: usize,
    failed: usize,
    has_next: bool,
    stopped: bool,
}

/// Drives one bounded scraping session against a page source.
pub struct SessionController<S: PageSource> {
    config: ScrapeConfig,
    source: S,
    extractor: FieldExtractor,
    validator: RecordValidator,
    limiter: RateLimiter,
    store: ListingStore,
    stop: Arc<AtomicBool>,
    state: SessionState,
}

impl<S: PageSource> SessionController<S> {
    pub fn new(config: ScrapeConfig, source: S, store: ListingStore) -> Self {
        let limiter = RateLimiter::new(&config);
        Self {
            config,
            source,
            extractor: FieldExtractor::portal_default(),
            validator: RecordValidator::default(),
            limiter,
            store,
            stop: Arc::new(AtomicBool::new(false)),
            state: SessionState::Idle,
        }
    }

    /// Handle for requesting a cooperative shutdown. Checked between
    /// listings and between pages; a stop flushes the current batch first.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub fn into_store(self) -> ListingStore {
        self.store
    }

    /// Run the session: navigate, extract, validate, persist, paginate,
    /// until completion, limit exhaustion, stop request, or abort.
    pub async fn run(&mut self, start_url: &str) -> Result<SessionSummary> {
        let mut summary = SessionSummary::new();
        let mut batch: Vec<ListingRecord> = Vec::new();
        let mut page_index = 1usize;

        info!(url = start_url, "session starting");

        loop {
            if self.stop.load(Ordering::Relaxed) {
                summary.stopped_early = true;
                return Ok(self.finish(SessionState::Completed, &mut batch, summary));
            }
            if summary.pages_attempted >= self.config.max_pages_per_session {
                info!("page limit reached");
                return Ok(self.finish(SessionState::Completed, &mut batch, summary));
            }

            self.state = SessionState::Throttled;
            self.limiter.wait_if_needed().await;

            self.state = SessionState::Navigating;
            let url = page_url(start_url, page_index);
            summary.pages_attempted += 1;
            debug!(page = page_index, url = %url, "navigating");

            let html = match self.load_page(&url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(page = page_index, error = %e, "page failed, skipping");
                    summary.pages_failed += 1;
                    if self.failure_rate_exceeded(&summary) {
                        return Ok(self.abort(&mut batch, summary));
                    }
                    page_index += 1;
                    continue;
                }
            };

            self.state = SessionState::Extracting;
            let remaining = self
                .config
                .max_listings_per_session
                .saturating_sub(summary.listings_extracted);
            let harvest = self.harvest_page(&html, remaining);

            if harvest.cards_found == 0 {
                warn!(page = page_index, "no listing cards found, counting page as failed");
                summary.pages_failed += 1;
                if self.failure_rate_exceeded(&summary) {
                    return Ok(self.abort(&mut batch, summary));
                }
                page_index += 1;
                continue;
            }

            info!(
                page = page_index,
                cards = harvest.cards_found,
                extracted = harvest.records.len(),
                "page extracted"
            );

            summary.listings_extracted += harvest.records.len();
            summary.listings_failed += harvest.failed;
            batch.extend(harvest.records);
            while batch.len() >= self.config.batch_save_size {
                let chunk: Vec<ListingRecord> =
                    batch.drain(..self.config.batch_save_size).collect();
                self.persist(&chunk, &mut summary);
            }

            if self.failure_rate_exceeded(&summary) {
                return Ok(self.abort(&mut batch, summary));
            }
            if harvest.stopped {
                summary.stopped_early = true;
                return Ok(self.finish(SessionState::Completed, &mut batch, summary));
            }

            self.state = SessionState::Paginating;
            let limits_allow = summary.listings_extracted < self.config.max_listings_per_session
                && summary.pages_attempted < self.config.max_pages_per_session;
            if !harvest.has_next || !limits_allow {
                if !harvest.has_next {
                    info!("no next page available");
                }
                return Ok(self.finish(SessionState::Completed, &mut batch, summary));
            }

            page_index += 1;
        }
    }

    /// Fetch with one extended-budget retry on timeout. Any other failure is
    /// a page-level failure for the caller to absorb.
    async fn load_page(&self, url: &str) -> Result<String, PageError> {
        match self.source.fetch(url, WaitPolicy::default()).await {
            Ok(html) => Ok(html),
            Err(e) if e.is_timeout() => {
                warn!(url, "navigation timed out, retrying with extended budget");
                self.source.fetch(url, WaitPolicy::extended()).await
            }
            Err(e) => Err(e),
        }
    }

    /// Synchronous per-page work: parse, enumerate cards in document order,
    /// extract and validate each. The stop flag is checked between listings,
    /// never mid-extraction.
    fn harvest_page(&self, html: &str, quota: usize) -> PageHarvest {
        let doc = Html::parse_document(html);
        let cards = self.extractor.listing_elements(&doc);

        let mut harvest = PageHarvest {
            records: Vec::new(),
            cards_found: cards.len(),
            failed: 0,
            has_next: self.extractor.has_next_page(&doc),
            stopped: false,
        };

        for card in cards {
            if self.stop.load(Ordering::Relaxed) {
                harvest.stopped = true;
                break;
            }
            if harvest.records.len() >= quota {
                break;
            }
            match self
                .extractor
                .extract_listing(card, self.config.extract_coordinates)
            {
                Some(mut record) => {
                    if self.config.validate_data {
                        let acceptable = self.validator.annotate(&mut record);
                        if !acceptable {
                            debug!(
                                listing_id = %record.listing_id,
                                score = record.completeness_score,
                                "low quality record flagged"
                            );
                        }
                    }
                    harvest.records.push(record);
                }
                None => harvest.failed += 1,
            }
        }

        harvest
    }

    fn persist(&self, records: &[ListingRecord], summary: &mut SessionSummary) {
        if records.is_empty() {
            return;
        }
        let outcome = self.store.upsert_batch(records);
        summary.records_saved += outcome.saved;
        summary.records_skipped += outcome.skipped.len();
        info!(
            saved = outcome.saved,
            skipped = outcome.skipped.len(),
            "batch flushed"
        );
    }

    fn failure_rate_exceeded(&self, summary: &SessionSummary) -> bool {
        let page_breach = summary.pages_attempted >= MIN_PAGE_SAMPLE
            && summary.pages_failed as f64 / summary.pages_attempted as f64
                > self.config.max_failure_rate;

        let listings_attempted = summary.listings_extracted + summary.listings_failed;
        let listing_breach = listings_attempted >= MIN_LISTING_SAMPLE
            && summary.listings_failed as f64 / listings_attempted as f64
                > self.config.max_failure_rate;

        page_breach || listing_breach
    }

    fn finish(
        &mut self,
        state: SessionState,
        batch: &mut Vec<ListingRecord>,
        mut summary: SessionSummary,
    ) -> SessionSummary {
        let pending: Vec<ListingRecord> = batch.drain(..).collect();
        self.persist(&pending, &mut summary);
        self.state = state;
        summary.final_state = state;
        info!(
            pages = summary.pages_attempted,
            listings = summary.listings_extracted,
            saved = summary.records_saved,
            state = ?state,
            "session finished"
        );
        summary
    }

    /// Structural site change or blocking suspected: flush whatever is
    /// pending and terminate with a full summary.
    fn abort(&mut self, batch: &mut Vec<ListingRecord>, summary: SessionSummary) -> SessionSummary {
        warn!(
            pages_failed = summary.pages_failed,
            listings_failed = summary.listings_failed,
            "failure rate exceeded, aborting session"
        );
        self.finish(SessionState::Aborted, batch, summary)
    }
}

/// Search result pages use the portal's `_Desde_{offset}` convention.
fn page_url(base: &str, page_index: usize) -> String {
    if page_index <= 1 {
        base.to_string()
    } else {
        let offset = (page_index - 1) * LISTINGS_PER_PAGE + 1;
        format!("{}/_Desde_{}", base.trim_end_matches('/'), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    enum Canned {
        Html(String),
        Timeout,
        Error,
    }

    /// Page source that replays a canned response per fetch call.
    struct MockSource {
        responses: Mutex<VecDeque<Canned>>,
    }

    impl MockSource {
        fn new(responses: Vec<Canned>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl PageSource for MockSource {
        async fn fetch(&self, _url: &str, wait: WaitPolicy) -> Result<String, PageError> {
            match self.responses.lock().unwrap().pop_front() {
                Some(Canned::Html(html)) => Ok(html),
                Some(Canned::Timeout) => Err(PageError::Timeout(wait.timeout)),
                Some(Canned::Error) => Err(PageError::Navigation("canned failure".to_string())),
                None => Err(PageError::Navigation("response stream exhausted".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn card(id: u32) -> String {
        format!(
            r#"<li class="ui-search-layout__item">
                 <a class="ui-search-link" href="/departamento/MLC-{id}-depto">
                   <h2 class="ui-search-item__title">Departamento número {id}</h2>
                 </a>
                 <span class="andes-money-amount">UF 5.{id:03}</span>
                 <ul><li>2 dormitorios</li><li>60 m² totales</li></ul>
                 <div class="ui-search-item__location">Apoquindo, Las Condes</div>
               </li>"#
        )
    }

    fn page(ids: &[u32], with_next: bool) -> Canned {
        let cards: String = ids.iter().map(|id| card(*id)).collect();
        let next = if with_next {
            r#"<li class="andes-pagination__button--next"><a href="/next">Siguiente</a></li>"#
        } else {
            ""
        };
        Canned::Html(format!(
            "<html><body><ol>{cards}</ol><ul>{next}</ul></body></html>"
        ))
    }

    fn test_config() -> ScrapeConfig {
        ScrapeConfig {
            min_delay: 0.0,
            max_delay: 0.0,
            max_requests_per_minute: 10_000,
            avoid_peak_hours: false,
            max_pages_per_session: 10,
            max_listings_per_session: 100,
            batch_save_size: 50,
            ..ScrapeConfig::default()
        }
    }

    fn controller(config: ScrapeConfig, responses: Vec<Canned>) -> SessionController<MockSource> {
        SessionController::new(
            config,
            MockSource::new(responses),
            ListingStore::in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn walks_pages_until_no_next() {
        let mut ctl = controller(
            test_config(),
            vec![page(&[1, 2], true), page(&[3], false)],
        );
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.pages_attempted, 2);
        assert_eq!(summary.listings_extracted, 3);
        assert_eq!(summary.records_saved, 3);
        assert_eq!(ctl.store().count().unwrap(), 3);
    }

    #[tokio::test]
    async fn respects_max_pages() {
        let config = ScrapeConfig {
            max_pages_per_session: 2,
            ..test_config()
        };
        // every page claims to have a next one
        let mut ctl = controller(
            config,
            vec![page(&[1], true), page(&[2], true), page(&[3], true)],
        );
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.pages_attempted, 2);
        assert_eq!(ctl.store().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn respects_max_listings() {
        let config = ScrapeConfig {
            max_listings_per_session: 2,
            ..test_config()
        };
        let mut ctl = controller(config, vec![page(&[1, 2, 3, 4], true)]);
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.listings_extracted, 2);
        assert_eq!(summary.pages_attempted, 1);
        assert_eq!(ctl.store().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn timeout_is_retried_once_with_extended_budget() {
        let mut ctl = controller(test_config(), vec![Canned::Timeout, page(&[1], false)]);
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.pages_attempted, 1);
        assert_eq!(summary.pages_failed, 0);
        assert_eq!(ctl.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_and_session_continues() {
        // first page times out twice (initial + extended retry), second is fine
        let mut ctl = controller(
            test_config(),
            vec![Canned::Timeout, Canned::Timeout, page(&[7], false)],
        );
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.pages_attempted, 2);
        assert_eq!(summary.pages_failed, 1);
        assert_eq!(ctl.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn abort_after_failure_rate_breach_still_flushes_batch() {
        let mut ctl = controller(
            test_config(),
            vec![page(&[1, 2], true), Canned::Error, Canned::Error],
        );
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert!(summary.aborted());
        assert_eq!(summary.final_state, SessionState::Aborted);
        assert_eq!(summary.pages_failed, 2);
        // the pending batch reached the store before termination
        assert_eq!(summary.records_saved, 2);
        assert_eq!(ctl.store().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn stop_request_flushes_and_completes() {
        let mut ctl = controller(test_config(), vec![page(&[1], true)]);
        ctl.stop_handle().store(true, Ordering::Relaxed);

        let summary = ctl.run("https://portal.test/venta").await.unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.final_state, SessionState::Completed);
        assert_eq!(summary.pages_attempted, 0);
    }

    #[tokio::test]
    async fn batches_flush_at_configured_size() {
        let config = ScrapeConfig {
            batch_save_size: 2,
            ..test_config()
        };
        let mut ctl = controller(config, vec![page(&[1, 2, 3, 4, 5], false)]);
        let summary = ctl.run("https://portal.test/venta").await.unwrap();

        assert_eq!(summary.records_saved, 5);
        assert_eq!(ctl.store().count().unwrap(), 5);
    }

    #[tokio::test]
    async fn records_are_validated_before_persistence() {
        let mut ctl = controller(test_config(), vec![page(&[9], false)]);
        ctl.run("https://portal.test/venta").await.unwrap();

        let record = ctl.store().get("MLC-9").unwrap().unwrap();
        // price, bedrooms, area, location present; coordinates missing
        assert!(record.completeness_score > 0);
        assert!(record
            .issues
            .iter()
            .any(|i| i.contains("missing coordinates")));
    }

    #[test]
    fn page_urls_follow_the_offset_convention() {
        assert_eq!(page_url("https://p.test/venta", 1), "https://p.test/venta");
        assert_eq!(
            page_url("https://p.test/venta", 2),
            "https://p.test/venta/_Desde_49"
        );
        assert_eq!(
            page_url("https://p.test/venta/", 3),
            "https://p.test/venta/_Desde_97"
        );
    }
}
