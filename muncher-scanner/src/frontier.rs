//! Scheduling state for link discovery.
//!
//! The frontier owns every URL a scan has discovered. A single mutex guards
//! the queue and the seen set together, which is what makes `offer` and
//! `next` atomic with respect to each other. The lock is never held across
//! an await point.

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Internal,
    External,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Internal => "internal",
            Classification::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    pub url: String,
    /// Link hops from the nearest seed.
    pub depth: usize,
    /// Non-empty path segments of `url`.
    pub path_depth: usize,
    pub schedule_id: i64,
    pub classification: Classification,
    pub is_seed: bool,
    pub visited: bool,
}

/// Number of non-empty path segments, e.g. `https://a.com/x/y` is 2.
pub fn path_depth(url: &Url) -> usize {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).count())
        .unwrap_or(0)
}

/// [`path_depth`] for an unparsed URL. Unparsable input sorts after everything.
pub fn url_path_depth(url: &str) -> usize {
    Url::parse(url).map(|u| path_depth(&u)).unwrap_or(usize::MAX)
}

/// Resolves `href` against `base` and drops the fragment. Returns `None` for
/// links that can't be crawled (`javascript:`, `mailto:`, anchors, ...).
pub fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    let base_url = Url::parse(base).ok()?;
    let mut resolved = base_url.join(href).ok()?;
    resolved.set_fragment(None);

    Some(resolved.to_string())
}

fn normalize(url: &str) -> Option<Url> {
    let mut parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str()?;
    parsed.set_fragment(None);
    Some(parsed)
}

#[derive(Debug, Default)]
struct FrontierState {
    queue: VecDeque<DiscoveredUrl>,
    seen: HashMap<String, DiscoveredUrl>,
    in_flight: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct UrlFrontier {
    state: Mutex<FrontierState>,
    seed_hosts: HashSet<String>,
    max_depth: usize,
    schedule_id: i64,
    domain_only: bool,
}

impl UrlFrontier {
    /// Builds a frontier pre-seeded with `seeds` at depth 0.
    ///
    /// Fails if a seed is not an absolute http(s) URL or if `seeds` is empty.
    pub fn new(seeds: &[String], max_depth: usize, schedule_id: i64, domain_only: bool) -> Result<Self> {
        if seeds.is_empty() {
            return Err(ScanError::InvalidUrl("no seed URLs given".to_string()));
        }

        let mut parsed_seeds = Vec::with_capacity(seeds.len());
        let mut seed_hosts = HashSet::new();
        for seed in seeds {
            let parsed = normalize(seed)
                .ok_or_else(|| ScanError::InvalidUrl(format!("cannot resolve seed URL '{}'", seed)))?;
            if let Some(host) = parsed.host_str() {
                seed_hosts.insert(host.to_lowercase());
            }
            parsed_seeds.push(parsed);
        }

        let frontier = Self {
            state: Mutex::new(FrontierState::default()),
            seed_hosts,
            max_depth,
            schedule_id,
            domain_only,
        };

        {
            let mut state = frontier.lock();
            for parsed in parsed_seeds {
                let key = parsed.to_string();
                if state.seen.contains_key(&key) {
                    continue;
                }
                let discovered = DiscoveredUrl {
                    url: key.clone(),
                    depth: 0,
                    path_depth: path_depth(&parsed),
                    schedule_id,
                    classification: Classification::Internal,
                    is_seed: true,
                    visited: false,
                };
                state.seen.insert(key, discovered.clone());
                state.queue.push_back(discovered);
            }
        }

        Ok(frontier)
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Internal iff the host exactly matches a seed host.
    pub fn classify(&self, url: &Url) -> Classification {
        match url.host_str() {
            Some(host) if self.seed_hosts.contains(&host.to_lowercase()) => Classification::Internal,
            _ => Classification::External,
        }
    }

    /// Offers a URL found on a page at `discovered_from_depth`.
    ///
    /// Returns true iff the URL was new, within the depth limit, and allowed
    /// by the domain restriction. Only then is it queued.
    pub fn offer(&self, url: &str, discovered_from_depth: usize) -> bool {
        let depth = discovered_from_depth + 1;
        if depth > self.max_depth {
            return false;
        }

        let Some(parsed) = normalize(url) else {
            return false;
        };

        let classification = self.classify(&parsed);
        if self.domain_only && classification == Classification::External {
            return false;
        }

        let key = parsed.to_string();
        let mut state = self.lock();
        if state.closed || state.seen.contains_key(&key) {
            return false;
        }

        let discovered = DiscoveredUrl {
            url: key.clone(),
            depth,
            path_depth: path_depth(&parsed),
            schedule_id: self.schedule_id,
            classification,
            is_seed: false,
            visited: false,
        };
        debug!("Queued {} ({}, depth {})", key, classification.as_str(), depth);
        state.seen.insert(key, discovered.clone());
        state.queue.push_back(discovered);
        true
    }

    /// Dequeues the next URL and marks it visited in the same critical section.
    ///
    /// Every item returned must be acknowledged with [`UrlFrontier::complete`].
    pub fn next(&self) -> Option<DiscoveredUrl> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let mut item = state.queue.pop_front()?;
        item.visited = true;
        if let Some(entry) = state.seen.get_mut(&item.url) {
            entry.visited = true;
        }
        state.in_flight += 1;
        Some(item)
    }

    /// Acknowledges that a dequeued URL has been fully processed, including
    /// offering its outbound links.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// True once nothing is queued and nothing dequeued is still being
    /// processed, or once the frontier has been closed.
    pub fn is_exhausted(&self) -> bool {
        let state = self.lock();
        state.closed || (state.queue.is_empty() && state.in_flight == 0)
    }

    /// Stops all further dequeues and offers.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn visited_count(&self) -> usize {
        self.lock().seen.values().filter(|d| d.visited).count()
    }

    /// Every URL discovered so far, in no particular order.
    pub fn snapshot(&self) -> Vec<DiscoveredUrl> {
        self.lock().seen.values().cloned().collect()
    }
}
