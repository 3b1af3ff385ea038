use crate::error::{Result, ScanError};
use crate::frontier::{UrlFrontier, resolve_link};
use crate::result::{FetchedPage, PageVisited};
use crate::stats::ScanStats;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

/// How long an idle worker waits before checking the frontier again.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Fetches a page and reports its outbound links.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Non-2xx responses are errors.
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// reqwest-backed [`PageFetcher`] that extracts `a[href]` links from HTML.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_timeout(user_agent, 10)
    }

    pub fn with_timeout(user_agent: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs((timeout_secs / 2).max(1)))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client })
    }

    /// Absolute, fragment-free links of every `a[href]` in `html`.
    pub fn extract_links(html: &str, current_url: &str) -> Result<Vec<String>> {
        let document = Html::parse_document(html);
        let link_selector = Selector::parse("a[href]")
            .map_err(|e| ScanError::ParseError(format!("{:?}", e)))?;

        let mut links = Vec::new();
        for element in document.select(&link_selector) {
            if let Some(href) = element.value().attr("href")
                && let Some(absolute_url) = resolve_link(current_url, href)
                && !links.contains(&absolute_url)
            {
                links.push(absolute_url);
            }
        }

        Ok(links)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        debug!("Fetching {}", url);

        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let response_time = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = response.content_length();

        let body = response.text().await?;

        let mut page = FetchedPage::new(url.to_string());
        page.status_code = status.as_u16();
        page.content_type = content_type.clone();
        page.content_length = content_length;
        page.response_time = response_time;

        let is_html = content_type
            .as_ref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);

        if is_html {
            page.links = Self::extract_links(&body, &final_url)?;
        }

        Ok(page)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub visited: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Drains a [`UrlFrontier`] with a pool of fetch workers.
pub struct LinkDiscoveryCrawler {
    fetcher: Arc<dyn PageFetcher>,
    workers: usize,
    request_delay: Duration,
    progress_callback: Option<ProgressCallback>,
}

impl LinkDiscoveryCrawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            workers: 4,
            request_delay: Duration::ZERO,
            progress_callback: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Minimum spacing between two fetches made by the same worker.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Crawls until the frontier is exhausted or `cancel` fires.
    ///
    /// Every successfully fetched page is counted on `stats` and sent on
    /// `events`. Failed fetches are counted and skipped. Only a worker panic
    /// makes this return an error.
    pub async fn crawl(
        &self,
        frontier: Arc<UrlFrontier>,
        stats: Arc<ScanStats>,
        events: mpsc::Sender<PageVisited>,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary> {
        info!(
            "Starting link discovery with {} workers (max depth {})",
            self.workers,
            frontier.max_depth()
        );

        let mut worker_handles = Vec::new();

        for worker_id in 0..self.workers {
            let fetcher = self.fetcher.clone();
            let frontier = frontier.clone();
            let stats = stats.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            let progress_cb = self.progress_callback.clone();
            let request_delay = self.request_delay;

            let handle = tokio::spawn(async move {
                debug!("Worker {} started", worker_id);
                let mut visited = 0usize;
                let mut failed = 0usize;
                let mut last_fetch: Option<Instant> = None;

                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let Some(item) = frontier.next() else {
                        if frontier.is_exhausted() {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                        continue;
                    };

                    if let Some(last) = last_fetch {
                        let elapsed = last.elapsed();
                        if elapsed < request_delay {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    frontier.complete();
                                    break;
                                }
                                _ = tokio::time::sleep(request_delay - elapsed) => {}
                            }
                        }
                    }

                    if let Some(ref callback) = progress_cb {
                        callback(worker_id, item.url.clone());
                    }

                    last_fetch = Some(Instant::now());
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => {
                            frontier.complete();
                            break;
                        }
                        outcome = fetcher.fetch(&item.url) => outcome,
                    };

                    match outcome {
                        Ok(page) => {
                            let mut queued = 0;
                            for link in &page.links {
                                if frontier.offer(link, item.depth) {
                                    queued += 1;
                                }
                            }
                            debug!(
                                "[Worker {}] {} -> {} links, {} new",
                                worker_id,
                                item.url,
                                page.links.len(),
                                queued
                            );

                            stats.record_visit(item.classification, item.is_seed);
                            visited += 1;
                            let event = PageVisited::from_fetch(&item, &page);
                            frontier.complete();

                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                sent = events.send(event) => {
                                    if sent.is_err() {
                                        debug!("[Worker {}] page consumer gone, dropping {}", worker_id, item.url);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Crawl error for {}: {}", item.url, e);
                            stats.record_fetch_failure();
                            failed += 1;
                            frontier.complete();
                        }
                    }
                }

                debug!("Worker {} finished", worker_id);
                (visited, failed)
            });

            worker_handles.push(handle);
        }

        drop(events);

        let mut summary = CrawlSummary::default();
        let mut first_error = None;
        for handle in worker_handles {
            match handle.await {
                Ok((visited, failed)) => {
                    summary.visited += visited;
                    summary.failed += failed;
                }
                Err(e) => {
                    error!("Crawl worker failed: {}", e);
                    frontier.close();
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(ScanError::JoinError(e));
        }

        if cancel.is_cancelled() {
            frontier.close();
            summary.cancelled = true;
        }

        info!(
            "Link discovery complete. Visited {} pages, {} failed",
            summary.visited, summary.failed
        );
        Ok(summary)
    }
}
