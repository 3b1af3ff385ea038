//! Cookie knowledge resolution.
//!
//! Every distinct cookie name is looked up once against a [`KnowledgeSource`]
//! and the answer is kept in a [`CookieCache`] that callers own and may share
//! between scans.

use crate::cookie::{CookieMetadata, RawCookie, ResolvedCookie, UNKNOWN_PURPOSE};
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const COOKIEPEDIA_URL: &str = "https://cookiepedia.co.uk";

const RECORD_HEADING: &str = "About this cookie:";

/// What a knowledge source says about one cookie name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieKnowledge {
    pub about: Option<String>,
    pub purpose: Option<String>,
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// `Ok(None)` when the source has no record for `name`.
    async fn lookup(&self, name: &str) -> Result<Option<CookieKnowledge>>;
}

/// Scrapes cookie records from cookiepedia.
pub struct CookiepediaSource {
    client: Client,
    base_url: Url,
}

impl CookiepediaSource {
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_base_url(user_agent, COOKIEPEDIA_URL)
    }

    pub fn with_base_url(user_agent: &str, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn record_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ScanError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("cookies")
            .push(name);
        Ok(url)
    }

    /// Reads a record page. Pages whose first `h2` isn't the record heading
    /// are not records.
    pub fn parse_record(html: &str) -> Result<Option<CookieKnowledge>> {
        let document = Html::parse_document(html);
        let heading = selector("h2")?;

        let is_record = document
            .select(&heading)
            .next()
            .is_some_and(|h| text_of(h) == RECORD_HEADING);
        if !is_record {
            return Ok(None);
        }

        let content = document
            .select(&selector("div#content-left")?)
            .next()
            .ok_or_else(|| ScanError::ParseError("record page has no content block".to_string()))?;

        let paragraphs: Vec<_> = content.select(&selector("p")?).collect();
        let about = paragraphs
            .first()
            .map(|p| text_of(*p))
            .filter(|t| !t.is_empty());
        let strong = selector("strong")?;
        let purpose = paragraphs
            .get(1)
            .and_then(|p| p.select(&strong).next())
            .map(text_of)
            .filter(|t| !t.is_empty());

        Ok(Some(CookieKnowledge { about, purpose }))
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScanError::ParseError(format!("{:?}", e)))
}

fn text_of(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

#[async_trait]
impl KnowledgeSource for CookiepediaSource {
    async fn lookup(&self, name: &str) -> Result<Option<CookieKnowledge>> {
        let url = self.record_url(name)?;
        debug!("Looking up cookie {} at {}", name, url);

        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ScanError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        Self::parse_record(&body)
    }
}

/// Cookie metadata keyed by cookie name. Writes are last-writer-wins.
#[derive(Debug, Default)]
pub struct CookieCache {
    entries: RwLock<HashMap<String, CookieMetadata>>,
}

impl CookieCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache from previously persisted metadata.
    pub fn warm(records: impl IntoIterator<Item = CookieMetadata>) -> Self {
        let cache = Self::new();
        for record in records {
            cache.insert(record);
        }
        cache
    }

    pub fn get(&self, name: &str) -> Option<CookieMetadata> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn insert(&self, metadata: CookieMetadata) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.name.clone(), metadata);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, sorted by name.
    pub fn snapshot(&self) -> Vec<CookieMetadata> {
        let mut records: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

pub struct CookieKnowledgeResolver {
    source: Arc<dyn KnowledgeSource>,
    cache: Arc<CookieCache>,
    cache_unknown: bool,
    lookups: AtomicUsize,
}

impl CookieKnowledgeResolver {
    pub fn new(source: Arc<dyn KnowledgeSource>, cache: Arc<CookieCache>) -> Self {
        Self {
            source,
            cache,
            cache_unknown: false,
            lookups: AtomicUsize::new(0),
        }
    }

    /// Also cache names the source has no record of.
    pub fn with_cache_unknown(mut self, cache_unknown: bool) -> Self {
        self.cache_unknown = cache_unknown;
        self
    }

    pub fn cache(&self) -> &Arc<CookieCache> {
        &self.cache
    }

    /// External lookups made so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Never fails; source errors resolve to "Unknown" and are not cached.
    pub async fn resolve(&self, name: &str) -> CookieMetadata {
        if let Some(hit) = self.cache.get(name) {
            return hit;
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        match self.source.lookup(name).await {
            Ok(Some(knowledge)) => {
                let metadata = CookieMetadata {
                    name: name.to_string(),
                    purpose: knowledge
                        .purpose
                        .unwrap_or_else(|| UNKNOWN_PURPOSE.to_string()),
                    about: knowledge.about,
                    resolved_at: Utc::now(),
                };
                self.cache.insert(metadata.clone());
                metadata
            }
            Ok(None) => {
                debug!("No record for cookie {}", name);
                let metadata = CookieMetadata::unknown(name);
                if self.cache_unknown {
                    self.cache.insert(metadata.clone());
                }
                metadata
            }
            Err(e) => {
                warn!("Lookup failed for cookie {}: {}", name, e);
                CookieMetadata::unknown(name)
            }
        }
    }

    pub async fn resolve_cookie(&self, cookie: RawCookie) -> ResolvedCookie {
        let metadata = self.resolve(&cookie.name).await;
        ResolvedCookie { cookie, metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GA_PAGE: &str = r#"
        <html><body>
        <h2>About this cookie:</h2>
        <div id="content-left">
            <p>This cookie name is associated with Google Universal Analytics.</p>
            <p>The main purpose of this cookie is: <strong>Performance</strong></p>
        </div>
        </body></html>
    "#;

    #[derive(Default)]
    struct FakeSource {
        records: HashMap<String, CookieKnowledge>,
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with(name: &str, purpose: &str) -> Self {
            let mut source = Self::default();
            source.records.insert(
                name.to_string(),
                CookieKnowledge {
                    about: Some(format!("about {}", name)),
                    purpose: Some(purpose.to_string()),
                },
            );
            source
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl KnowledgeSource for FakeSource {
        async fn lookup(&self, name: &str) -> Result<Option<CookieKnowledge>> {
            self.calls.lock().unwrap().push(name.to_string());
            if self.failing.iter().any(|n| n == name) {
                return Err(ScanError::Other("source unavailable".to_string()));
            }
            Ok(self.records.get(name).cloned())
        }
    }

    #[tokio::test]
    async fn test_second_resolve_hits_cache() {
        let source = Arc::new(FakeSource::with("_ga", "Performance"));
        let resolver = CookieKnowledgeResolver::new(source.clone(), Arc::new(CookieCache::new()));

        let first = resolver.resolve("_ga").await;
        let second = resolver.resolve("_ga").await;

        assert_eq!(first.purpose, "Performance");
        assert_eq!(second, first);
        assert_eq!(source.calls(), 1);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn test_unknown_is_not_cached_by_default() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(CookieCache::new());
        let resolver = CookieKnowledgeResolver::new(source.clone(), cache.clone());

        let metadata = resolver.resolve("mystery").await;
        resolver.resolve("mystery").await;

        assert!(metadata.is_unknown());
        assert!(metadata.about.is_none());
        assert!(cache.is_empty());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_is_cached_when_enabled() {
        let source = Arc::new(FakeSource::default());
        let resolver = CookieKnowledgeResolver::new(source.clone(), Arc::new(CookieCache::new()))
            .with_cache_unknown(true);

        resolver.resolve("mystery").await;
        resolver.resolve("mystery").await;

        assert_eq!(source.calls(), 1);
        assert!(resolver.cache().get("mystery").unwrap().is_unknown());
    }

    #[tokio::test]
    async fn test_source_error_resolves_unknown_and_is_never_cached() {
        let mut source = FakeSource::default();
        source.failing.push("flaky".to_string());
        let source = Arc::new(source);
        let resolver = CookieKnowledgeResolver::new(source.clone(), Arc::new(CookieCache::new()))
            .with_cache_unknown(true);

        let metadata = resolver.resolve("flaky").await;

        assert!(metadata.is_unknown());
        assert!(resolver.cache().get("flaky").is_none());
    }

    #[tokio::test]
    async fn test_record_without_purpose_is_cached_as_unknown() {
        let mut source = FakeSource::default();
        source.records.insert(
            "odd".to_string(),
            CookieKnowledge {
                about: Some("Seen on a few sites.".to_string()),
                purpose: None,
            },
        );
        let resolver = CookieKnowledgeResolver::new(Arc::new(source), Arc::new(CookieCache::new()));

        let metadata = resolver.resolve("odd").await;

        assert!(metadata.is_unknown());
        assert_eq!(metadata.about.as_deref(), Some("Seen on a few sites."));
        assert!(resolver.cache().get("odd").is_some());
    }

    #[tokio::test]
    async fn test_warm_cache_skips_source() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(CookieCache::warm(vec![CookieMetadata {
            name: "sid".to_string(),
            purpose: "Strictly Necessary".to_string(),
            about: None,
            resolved_at: Utc::now(),
        }]));
        let resolver = CookieKnowledgeResolver::new(source.clone(), cache);

        let resolved = resolver
            .resolve_cookie(RawCookie {
                name: "sid".to_string(),
                value: "1".to_string(),
                domain: "site.test".to_string(),
                path: "/".to_string(),
                http_only: true,
                secure: true,
                expires: None,
                source_url: "https://site.test/".to_string(),
                captured_at: Utc::now(),
            })
            .await;

        assert_eq!(resolved.purpose(), "Strictly Necessary");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_keep_one_entry_per_name() {
        let source = Arc::new(FakeSource::with("_gid", "Performance"));
        let resolver = Arc::new(CookieKnowledgeResolver::new(source, Arc::new(CookieCache::new())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve("_gid").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().purpose, "Performance");
        }

        assert_eq!(resolver.cache().len(), 1);
    }

    #[test]
    fn test_parse_record_page() {
        let knowledge = CookiepediaSource::parse_record(GA_PAGE).unwrap().unwrap();

        assert_eq!(knowledge.purpose.as_deref(), Some("Performance"));
        assert_eq!(
            knowledge.about.as_deref(),
            Some("This cookie name is associated with Google Universal Analytics.")
        );
    }

    #[test]
    fn test_parse_non_record_page() {
        let html = "<html><body><h2>Search results</h2></body></html>";
        assert!(CookiepediaSource::parse_record(html).unwrap().is_none());
        assert!(CookiepediaSource::parse_record("<html></html>").unwrap().is_none());
    }

    #[test]
    fn test_parse_record_without_content_is_malformed() {
        let html = "<html><body><h2>About this cookie:</h2></body></html>";
        assert!(CookiepediaSource::parse_record(html).is_err());
    }

    #[test]
    fn test_record_url_escapes_name() {
        let source = CookiepediaSource::with_base_url("muncher-test", "https://kb.test/").unwrap();
        assert_eq!(
            source.record_url("a b").unwrap().as_str(),
            "https://kb.test/cookies/a%20b"
        );
    }

    #[tokio::test]
    async fn test_cookiepedia_lookup() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/cookies/_ga"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GA_PAGE))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/cookies/nothing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = CookiepediaSource::with_base_url("muncher-test", &server.uri()).unwrap();

        let ga = source.lookup("_ga").await.unwrap().unwrap();
        assert_eq!(ga.purpose.as_deref(), Some("Performance"));
        assert!(source.lookup("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cookiepedia_server_error_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/cookies/_ga"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = CookiepediaSource::with_base_url("muncher-test", &server.uri()).unwrap();
        let result = source.lookup("_ga").await;

        assert!(matches!(result, Err(ScanError::HttpStatus { status: 503, .. })));
    }
}
