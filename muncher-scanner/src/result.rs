use crate::cookie::RawCookie;
use crate::frontier::{Classification, DiscoveredUrl};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a [`crate::crawler::PageFetcher`] returns for one successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub response_time: Duration,
    /// Absolute, fragment-free outbound links.
    pub links: Vec<String>,
}

impl FetchedPage {
    pub fn new(url: String) -> Self {
        Self {
            url,
            status_code: 0,
            content_type: None,
            content_length: None,
            response_time: Duration::from_secs(0),
            links: Vec::new(),
        }
    }
}

/// Emitted by the crawler for every page it actually visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageVisited {
    pub url: String,
    pub classification: Classification,
    pub depth: usize,
    pub path_depth: usize,
    pub is_seed: bool,
    pub status_code: u16,
    pub links_found: usize,
}

impl PageVisited {
    pub fn from_fetch(discovered: &DiscoveredUrl, page: &FetchedPage) -> Self {
        Self {
            url: discovered.url.clone(),
            classification: discovered.classification,
            depth: discovered.depth,
            path_depth: discovered.path_depth,
            is_seed: discovered.is_seed,
            status_code: page.status_code,
            links_found: page.links.len(),
        }
    }
}

/// Cookies captured for one visited page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestedPage {
    pub page: PageVisited,
    pub cookies: Vec<RawCookie>,
    pub error: Option<String>,
}

impl HarvestedPage {
    pub fn new(page: PageVisited, cookies: Vec<RawCookie>) -> Self {
        Self {
            page,
            cookies,
            error: None,
        }
    }

    pub fn with_error(page: PageVisited, error: String) -> Self {
        Self {
            page,
            cookies: Vec::new(),
            error: Some(error),
        }
    }
}
