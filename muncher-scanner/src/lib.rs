pub mod browser;
pub mod cookie;
pub mod crawler;
pub mod error;
pub mod frontier;
pub mod harvester;
pub mod resolver;
pub mod result;
pub mod stats;
pub mod user_agent;

#[cfg(feature = "browser")]
pub use browser::{ChromeDriver, ChromeOptions};
pub use browser::HttpCookieDriver;
pub use cookie::{BrowserCookie, CookieMetadata, RawCookie, ResolvedCookie, UNKNOWN_PURPOSE};
pub use crawler::{HttpFetcher, LinkDiscoveryCrawler, PageFetcher};
pub use error::ScanError;
pub use frontier::{Classification, DiscoveredUrl, UrlFrontier};
pub use harvester::{BrowserDriver, BrowserSession, CookieHarvester};
pub use resolver::{CookieCache, CookieKnowledgeResolver, CookiepediaSource, KnowledgeSource};
pub use result::{HarvestedPage, PageVisited};
pub use stats::{LastResult, ScanStats, StatsSnapshot};
