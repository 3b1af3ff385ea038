//! The scan pipeline: link discovery feeds cookie harvesting, harvested
//! cookies are resolved and folded into the catalog as they arrive.

use crate::catalog::{CookieCatalog, CookieCatalogBuilder};
use crate::config::ScanConfig;
use crate::data::ScanStore;
use crate::error::{MuncherError, Result};
use muncher_scanner::crawler::{CrawlSummary, ProgressCallback};
use muncher_scanner::frontier::DiscoveredUrl;
use muncher_scanner::harvester::HarvestSummary;
use muncher_scanner::user_agent::pick_user_agent;
use muncher_scanner::{
    BrowserDriver, CookieCache, CookieHarvester, CookieKnowledgeResolver, HarvestedPage,
    KnowledgeSource, LastResult, LinkDiscoveryCrawler, PageFetcher, ScanError, ScanStats,
    StatsSnapshot, UrlFrontier,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// The network collaborators of one scan.
pub struct ScanDrivers {
    pub fetcher: Arc<dyn PageFetcher>,
    pub browser: Arc<dyn BrowserDriver>,
    pub knowledge: Arc<dyn KnowledgeSource>,
}

pub type HarvestCallback = Arc<dyn Fn(&HarvestedPage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub stats: StatsSnapshot,
    pub catalog: CookieCatalog,
}

impl ScanOutcome {
    pub fn finished(&self) -> bool {
        self.stats.last_result == LastResult::Finished
    }
}

pub struct ScanRunner<'a> {
    store: &'a dyn ScanStore,
    cache: Option<Arc<CookieCache>>,
    log_path: Option<PathBuf>,
    crawl_progress: Option<ProgressCallback>,
    harvest_progress: Option<HarvestCallback>,
}

impl<'a> ScanRunner<'a> {
    pub fn new(store: &'a dyn ScanStore) -> Self {
        Self {
            store,
            cache: None,
            log_path: None,
            crawl_progress: None,
            harvest_progress: None,
        }
    }

    /// Shares a cookie cache with other scans. Without one, a cache is warmed
    /// from the store's cookie info.
    pub fn with_cache(mut self, cache: Arc<CookieCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Recorded on the stats as this run's log artifact.
    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    pub fn with_crawl_progress(mut self, callback: ProgressCallback) -> Self {
        self.crawl_progress = Some(callback);
        self
    }

    pub fn with_harvest_progress(mut self, callback: HarvestCallback) -> Self {
        self.harvest_progress = Some(callback);
        self
    }

    /// Runs the scan for `schedule_id`.
    ///
    /// `make_drivers` receives the loaded config and the user agent picked
    /// for this run. A cancelled run returns `Ok` with `aborted` stats; setup
    /// failures and mid-run fatal errors return `Err`.
    pub async fn run<F>(
        &self,
        schedule_id: i64,
        make_drivers: F,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome>
    where
        F: FnOnce(&ScanConfig, &str) -> Result<ScanDrivers>,
    {
        let schedule = self.store.get_schedule(schedule_id)?;
        let config = self.store.load_config(schedule_id)?;
        let user_agent = pick_user_agent(config.user_agent.as_deref());
        let drivers = make_drivers(&config, &user_agent)?;

        let stats = Arc::new(ScanStats::new(schedule_id));
        if let Some(ref path) = self.log_path {
            stats.add_log_path(path.clone());
        }
        self.store.create_stats(&stats.snapshot())?;

        info!(
            "Scanning schedule {} ({}): {} seeds, depth {}",
            schedule.id,
            schedule.title,
            config.seeds.len(),
            config.max_depth
        );

        let frontier = match UrlFrontier::new(
            &config.seeds,
            config.max_depth,
            schedule_id,
            config.domain_only,
        ) {
            Ok(frontier) => Arc::new(frontier),
            Err(e) => return Err(self.abort(&stats, e.into())),
        };

        let harvester = CookieHarvester::new(drivers.browser)
            .with_sessions(config.browser_sessions)
            .with_navigation_timeout(config.navigation_timeout());
        let pool = match harvester.open_pool().await {
            Ok(pool) => pool,
            Err(e) => return Err(self.abort(&stats, e.into())),
        };

        let cache = match self.cache.clone() {
            Some(cache) => cache,
            None => match self.store.load_cookie_info() {
                Ok(records) => Arc::new(CookieCache::warm(records)),
                Err(e) => {
                    pool.close_all().await;
                    return Err(self.abort(&stats, e));
                }
            },
        };
        let resolver = CookieKnowledgeResolver::new(drivers.knowledge, cache.clone())
            .with_cache_unknown(config.cache_unknown);

        // internal failures cancel the run without cancelling the caller
        let run_cancel = cancel.child_token();

        let (page_tx, page_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (harvest_tx, mut harvest_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut crawler = LinkDiscoveryCrawler::new(drivers.fetcher)
            .with_workers(config.workers)
            .with_request_delay(config.request_delay());
        if let Some(ref callback) = self.crawl_progress {
            crawler = crawler.with_progress_callback(callback.clone());
        }

        let crawl_handle: JoinHandle<std::result::Result<CrawlSummary, ScanError>> = {
            let frontier = frontier.clone();
            let stats = stats.clone();
            let cancel = run_cancel.clone();
            tokio::spawn(async move {
                let result = crawler.crawl(frontier.clone(), stats, page_tx, cancel.clone()).await;
                if result.is_err() {
                    cancel.cancel();
                }
                frontier.close();
                result
            })
        };

        let harvest_handle: JoinHandle<std::result::Result<HarvestSummary, ScanError>> = {
            let stats = stats.clone();
            let cancel = run_cancel.clone();
            tokio::spawn(async move {
                harvester
                    .run(pool, page_rx, harvest_tx, stats, cancel)
                    .await
            })
        };

        let mut catalog = CookieCatalogBuilder::new();
        let mut fatal: Option<MuncherError> = None;

        loop {
            let harvested = tokio::select! {
                biased;
                _ = run_cancel.cancelled() => {
                    debug!("Scan of schedule {} cancelled; dropping buffered pages", schedule_id);
                    break;
                }
                next = harvest_rx.recv() => match next {
                    Some(harvested) => harvested,
                    None => break,
                },
            };
            if let Some(ref callback) = self.harvest_progress {
                callback(&harvested);
            }
            if let Err(e) = self
                .consume(schedule_id, harvested, &resolver, &mut catalog, &run_cancel)
                .await
            {
                error!("Failed to record harvested page: {}", e);
                fatal = Some(e);
                run_cancel.cancel();
                break;
            }
        }
        drop(harvest_rx);

        for (stage, joined) in [
            ("crawl", crawl_handle.await.map(|r| r.map(|_| ()))),
            ("harvest", harvest_handle.await.map(|r| r.map(|_| ()))),
        ] {
            let failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(MuncherError::Scan(e)),
                Err(e) => Some(MuncherError::Scan(ScanError::JoinError(e))),
            };
            if let Some(e) = failure {
                error!("{} stage failed: {}", stage, e);
                fatal.get_or_insert(e);
            }
        }

        stats.record_lookups(resolver.lookups());

        if let Err(e) = self.persist_frontier(&frontier) {
            fatal.get_or_insert(e);
        }
        if let Err(e) = self.persist_new_cookie_info(&cache, &stats) {
            fatal.get_or_insert(e);
        }

        if let Some(e) = fatal {
            return Err(self.abort(&stats, e));
        }

        let result = if cancel.is_cancelled() {
            warn!("Scan of schedule {} cancelled", schedule_id);
            LastResult::Aborted
        } else {
            LastResult::Finished
        };
        stats.finish(result);

        let snapshot = stats.snapshot();
        self.store.save_stats(&snapshot)?;

        info!(
            "Scan of schedule {} {}: {} pages, {} cookies, {} unique",
            schedule_id,
            snapshot.last_result.as_str(),
            snapshot.pages_visited() + snapshot.seed_pages,
            snapshot.cookies_extracted,
            catalog.catalog().unique_cookies
        );

        Ok(ScanOutcome {
            stats: snapshot,
            catalog: catalog.build(),
        })
    }

    async fn consume(
        &self,
        schedule_id: i64,
        harvested: HarvestedPage,
        resolver: &CookieKnowledgeResolver,
        catalog: &mut CookieCatalogBuilder,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let page = &harvested.page;
        let url = DiscoveredUrl {
            url: page.url.clone(),
            depth: page.depth,
            path_depth: page.path_depth,
            schedule_id,
            classification: page.classification,
            is_seed: page.is_seed,
            visited: true,
        };
        self.store.save_url(&url, Some(page.status_code))?;

        for cookie in harvested.cookies {
            self.store.save_cookie(schedule_id, &cookie)?;
            let source_url = cookie.source_url.clone();
            let resolved = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                resolved = resolver.resolve_cookie(cookie) => resolved,
            };
            debug!("{} on {} -> {}", resolved.name(), source_url, resolved.purpose());
            catalog.add(resolved, &source_url);
        }
        Ok(())
    }

    fn persist_frontier(&self, frontier: &UrlFrontier) -> Result<()> {
        for url in frontier.snapshot() {
            self.store.save_url(&url, None)?;
        }
        Ok(())
    }

    /// Writes back cache entries resolved during this run.
    fn persist_new_cookie_info(&self, cache: &CookieCache, stats: &ScanStats) -> Result<()> {
        let started_at = stats.snapshot().started_at;
        for metadata in cache.snapshot() {
            if metadata.resolved_at >= started_at {
                self.store.save_cookie_info(&metadata)?;
            }
        }
        Ok(())
    }

    /// Marks the run aborted and persists what it has.
    fn abort(&self, stats: &ScanStats, cause: MuncherError) -> MuncherError {
        error!("Scan of schedule {} aborted: {}", stats.schedule_id(), cause);
        stats.finish(LastResult::Aborted);
        if let Err(e) = self.store.save_stats(&stats.snapshot()) {
            error!("Failed to persist aborted stats: {}", e);
        }
        cause
    }
}
