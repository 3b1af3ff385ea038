//! Cookie harvesting with a pool of browser sessions.
//!
//! Every harvest worker owns exactly one session for its whole life and
//! pulls visited pages off a shared queue. Sessions are always closed when a
//! worker stops, whether it ran dry, was cancelled, or panicked.

use crate::cookie::{BrowserCookie, RawCookie};
use crate::error::{Result, ScanError};
use crate::result::{HarvestedPage, PageVisited};
use crate::stats::ScanStats;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One browser context. Its cookie jar is reset on every navigation, so
/// [`BrowserSession::read_cookies`] only ever reports cookies set by the page
/// most recently navigated to.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn read_cookies(&mut self) -> Result<Vec<BrowserCookie>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Sessions opened up front so a driver that can't start fails the scan
/// before any crawling happens.
pub struct SessionPool {
    sessions: Vec<Box<dyn BrowserSession>>,
}

impl SessionPool {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn close_all(self) {
        for session in self.sessions {
            if let Err(e) = session.close().await {
                warn!("Failed to close browser session: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
    pub harvested: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct CookieHarvester {
    driver: Arc<dyn BrowserDriver>,
    sessions: usize,
    navigation_timeout: Duration,
}

impl CookieHarvester {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            sessions: 1,
            navigation_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_sessions(mut self, sessions: usize) -> Self {
        self.sessions = sessions.max(1);
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    /// Opens one session per worker. If any session fails to open, the ones
    /// already opened are closed and the error is returned.
    pub async fn open_pool(&self) -> Result<SessionPool> {
        let mut pool = SessionPool {
            sessions: Vec::with_capacity(self.sessions),
        };

        for i in 0..self.sessions {
            match self.driver.open_session().await {
                Ok(session) => {
                    debug!("Opened browser session {}", i);
                    pool.sessions.push(session);
                }
                Err(e) => {
                    error!("Cannot open browser session {}: {}", i, e);
                    pool.close_all().await;
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Loads `url` in `session` and returns what ended up in its jar.
    pub async fn harvest_page(
        session: &mut dyn BrowserSession,
        url: &str,
        navigation_timeout: Duration,
    ) -> Result<Vec<RawCookie>> {
        match tokio::time::timeout(navigation_timeout, session.navigate(url)).await {
            Ok(navigated) => navigated?,
            Err(_) => return Err(ScanError::Timeout(navigation_timeout.as_secs())),
        }

        let cookies = session.read_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| RawCookie::captured(c, url))
            .collect())
    }

    /// Harvests every page received on `pages` until the channel closes or
    /// `cancel` fires, sending one [`HarvestedPage`] per page to `out`.
    ///
    /// Page-level failures are reported on the harvested page and never
    /// returned. A panicking worker is returned as an error after its session
    /// has been closed and the other workers have stopped.
    pub async fn run(
        &self,
        pool: SessionPool,
        pages: mpsc::Receiver<PageVisited>,
        out: mpsc::Sender<HarvestedPage>,
        stats: Arc<ScanStats>,
        cancel: CancellationToken,
    ) -> Result<HarvestSummary> {
        info!("Starting cookie harvest with {} browser sessions", pool.len());

        let pages = Arc::new(Mutex::new(pages));
        let mut worker_handles = Vec::new();

        for (worker_id, mut session) in pool.sessions.into_iter().enumerate() {
            let pages = pages.clone();
            let out = out.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            let navigation_timeout = self.navigation_timeout;

            let handle = tokio::spawn(async move {
                let work = AssertUnwindSafe(Self::work(
                    worker_id,
                    session.as_mut(),
                    pages,
                    out,
                    stats,
                    cancel.clone(),
                    navigation_timeout,
                ))
                .catch_unwind()
                .await;

                if let Err(e) = session.close().await {
                    warn!("[Session {}] close failed: {}", worker_id, e);
                }
                debug!("[Session {}] closed", worker_id);

                work.map_err(|_| {
                    cancel.cancel();
                    ScanError::Other(format!("harvest worker {} panicked", worker_id))
                })
            });

            worker_handles.push(handle);
        }

        drop(out);

        let mut summary = HarvestSummary::default();
        let mut first_error = None;
        for handle in worker_handles {
            match handle.await {
                Ok(Ok((harvested, failed))) => {
                    summary.harvested += harvested;
                    summary.failed += failed;
                }
                Ok(Err(e)) => {
                    error!("Harvest worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Harvest worker task failed: {}", e);
                    first_error.get_or_insert(ScanError::JoinError(e));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        summary.cancelled = cancel.is_cancelled();
        info!(
            "Cookie harvest complete. {} pages harvested, {} failed",
            summary.harvested, summary.failed
        );
        Ok(summary)
    }

    async fn work(
        worker_id: usize,
        session: &mut dyn BrowserSession,
        pages: Arc<Mutex<mpsc::Receiver<PageVisited>>>,
        out: mpsc::Sender<HarvestedPage>,
        stats: Arc<ScanStats>,
        cancel: CancellationToken,
        navigation_timeout: Duration,
    ) -> (usize, usize) {
        let mut harvested = 0usize;
        let mut failed = 0usize;

        loop {
            let next = {
                let mut rx = pages.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    page = rx.recv() => page,
                }
            };
            let Some(page) = next else {
                break;
            };

            debug!("[Session {}] harvesting {}", worker_id, page.url);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = Self::harvest_page(session, &page.url, navigation_timeout) => outcome,
            };

            let result = match outcome {
                Ok(cookies) => {
                    debug!("[Session {}] {} cookies on {}", worker_id, cookies.len(), page.url);
                    stats.record_harvest(cookies.len());
                    harvested += 1;
                    HarvestedPage::new(page, cookies)
                }
                Err(e) => {
                    warn!("Harvest error for {}: {}", page.url, e);
                    stats.record_harvest_failure();
                    failed += 1;
                    HarvestedPage::with_error(page, e.to_string())
                }
            };

            if out.send(result).await.is_err() {
                debug!("[Session {}] cookie consumer gone, stopping", worker_id);
                break;
            }
        }

        (harvested, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::Classification;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeDriver {
        cookies: HashMap<String, Vec<&'static str>>,
        slow: Vec<String>,
        broken: Vec<String>,
        panics_on: Option<String>,
        fail_open_after: Option<usize>,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        navigations: Arc<StdMutex<Vec<String>>>,
    }

    struct FakeSession {
        cookies: HashMap<String, Vec<&'static str>>,
        slow: Vec<String>,
        broken: Vec<String>,
        panics_on: Option<String>,
        jar: Vec<BrowserCookie>,
        closed: Arc<AtomicUsize>,
        navigations: Arc<StdMutex<Vec<String>>>,
    }

    fn cookie(name: &str) -> BrowserCookie {
        BrowserCookie {
            name: name.to_string(),
            value: "v".to_string(),
            domain: "site.test".to_string(),
            path: "/".to_string(),
            expires: None,
            http_only: false,
            secure: true,
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn navigate(&mut self, url: &str) -> Result<()> {
            self.jar.clear();
            self.navigations.lock().unwrap().push(url.to_string());
            if self.panics_on.as_deref() == Some(url) {
                panic!("renderer crashed");
            }
            if self.slow.iter().any(|u| u == url) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.broken.iter().any(|u| u == url) {
                return Err(ScanError::BrowserError("net::ERR_NAME_NOT_RESOLVED".to_string()));
            }
            if let Some(names) = self.cookies.get(url) {
                self.jar.extend(names.iter().map(|n| cookie(n)));
            }
            Ok(())
        }

        async fn read_cookies(&mut self) -> Result<Vec<BrowserCookie>> {
            Ok(self.jar.clone())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_open_after
                && n >= limit
            {
                return Err(ScanError::BrowserError("chrome not found".to_string()));
            }
            Ok(Box::new(FakeSession {
                cookies: self.cookies.clone(),
                slow: self.slow.clone(),
                broken: self.broken.clone(),
                panics_on: self.panics_on.clone(),
                jar: Vec::new(),
                closed: self.closed.clone(),
                navigations: self.navigations.clone(),
            }))
        }
    }

    fn visited(url: &str) -> PageVisited {
        PageVisited {
            url: url.to_string(),
            classification: Classification::Internal,
            depth: 0,
            path_depth: 0,
            is_seed: false,
            status_code: 200,
            links_found: 0,
        }
    }

    async fn harvest(
        driver: Arc<FakeDriver>,
        sessions: usize,
        urls: &[&str],
        timeout: Duration,
    ) -> (Result<HarvestSummary>, Vec<HarvestedPage>, Arc<ScanStats>) {
        let harvester = CookieHarvester::new(driver)
            .with_sessions(sessions)
            .with_navigation_timeout(timeout);
        let pool = harvester.open_pool().await.unwrap();

        let (page_tx, page_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for url in urls {
            page_tx.send(visited(url)).await.unwrap();
        }
        drop(page_tx);

        let stats = Arc::new(ScanStats::new(1));
        let collector = tokio::spawn(async move {
            let mut pages = Vec::new();
            while let Some(page) = out_rx.recv().await {
                pages.push(page);
            }
            pages
        });

        let result = harvester
            .run(pool, page_rx, out_tx, stats.clone(), CancellationToken::new())
            .await;
        (result, collector.await.unwrap(), stats)
    }

    #[tokio::test]
    async fn test_pool_harvests_every_page_and_closes_sessions() {
        let mut driver = FakeDriver::default();
        driver.cookies.insert("https://site.test/".to_string(), vec!["sid", "_ga"]);
        driver.cookies.insert("https://site.test/a".to_string(), vec!["sid"]);
        let driver = Arc::new(driver);

        let urls = ["https://site.test/", "https://site.test/a", "https://site.test/b"];
        let (result, pages, stats) = harvest(driver.clone(), 2, &urls, Duration::from_secs(1)).await;

        let summary = result.unwrap();
        assert_eq!(summary.harvested, 3);
        assert_eq!(pages.len(), 3);
        assert_eq!(stats.cookies_extracted(), 3);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 2);

        let root = pages.iter().find(|p| p.page.url == "https://site.test/").unwrap();
        assert_eq!(root.cookies.len(), 2);
        assert!(root.cookies.iter().all(|c| c.source_url == "https://site.test/"));
    }

    #[tokio::test]
    async fn test_reused_session_does_not_leak_previous_page_cookies() {
        let mut driver = FakeDriver::default();
        driver.cookies.insert("https://site.test/".to_string(), vec!["first"]);
        driver.cookies.insert("https://site.test/next".to_string(), vec!["second"]);
        let driver = Arc::new(driver);

        let urls = ["https://site.test/", "https://site.test/next"];
        let (_, pages, _) = harvest(driver, 1, &urls, Duration::from_secs(1)).await;

        let next = pages.iter().find(|p| p.page.url == "https://site.test/next").unwrap();
        let names: Vec<&str> = next.cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["second"]);
    }

    #[tokio::test]
    async fn test_failed_navigation_yields_no_cookies_and_continues() {
        let mut driver = FakeDriver::default();
        driver.broken.push("https://site.test/broken".to_string());
        driver.cookies.insert("https://site.test/ok".to_string(), vec!["sid"]);
        let driver = Arc::new(driver);

        let urls = ["https://site.test/broken", "https://site.test/ok"];
        let (result, pages, stats) = harvest(driver, 1, &urls, Duration::from_secs(1)).await;

        assert_eq!(result.unwrap().failed, 1);
        let broken = pages.iter().find(|p| p.page.url == "https://site.test/broken").unwrap();
        assert!(broken.cookies.is_empty());
        assert!(broken.error.is_some());
        assert_eq!(stats.snapshot().harvest_failures, 1);
        assert_eq!(stats.cookies_extracted(), 1);
    }

    #[tokio::test]
    async fn test_navigation_timeout_is_skipped() {
        let mut driver = FakeDriver::default();
        driver.slow.push("https://site.test/slow".to_string());
        let driver = Arc::new(driver);

        let urls = ["https://site.test/slow"];
        let (result, pages, _) = harvest(driver, 1, &urls, Duration::from_millis(50)).await;

        assert_eq!(result.unwrap().failed, 1);
        assert!(pages[0].error.as_deref().unwrap_or("").contains("Timed out"));
    }

    #[tokio::test]
    async fn test_panicking_worker_still_closes_its_session() {
        let mut driver = FakeDriver::default();
        driver.panics_on = Some("https://site.test/crash".to_string());
        let driver = Arc::new(driver);

        let urls = ["https://site.test/crash", "https://site.test/after"];
        let (result, _, _) = harvest(driver.clone(), 1, &urls, Duration::from_secs(1)).await;

        assert!(result.is_err());
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_closes_already_opened_sessions() {
        let driver = Arc::new(FakeDriver {
            fail_open_after: Some(2),
            ..Default::default()
        });

        let harvester = CookieHarvester::new(driver.clone()).with_sessions(3);
        let result = harvester.open_pool().await;

        assert!(matches!(result, Err(ScanError::BrowserError(_))));
        assert_eq!(driver.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers_and_closes_sessions() {
        let driver = Arc::new(FakeDriver::default());
        let harvester = CookieHarvester::new(driver.clone()).with_sessions(2);
        let pool = harvester.open_pool().await.unwrap();

        // sender kept open: workers only stop because of the token
        let (_page_tx, page_rx) = mpsc::channel::<PageVisited>(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let summary = harvester
            .run(pool, page_rx, out_tx, Arc::new(ScanStats::new(1)), cancel)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 2);
        assert!(driver.navigations.lock().unwrap().is_empty());
    }
}
