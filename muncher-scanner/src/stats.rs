use crate::frontier::Classification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastResult {
    Running,
    Finished,
    Aborted,
}

impl LastResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastResult::Running => "running",
            LastResult::Finished => "finished",
            LastResult::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(LastResult::Running),
            "finished" => Some(LastResult::Finished),
            "aborted" => Some(LastResult::Aborted),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LastResult::Running => 0,
            LastResult::Finished => 1,
            LastResult::Aborted => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => LastResult::Finished,
            2 => LastResult::Aborted,
            _ => LastResult::Running,
        }
    }
}

/// Live counters for one scan run.
///
/// Shared between crawl and harvest workers behind an `Arc`; every counter is
/// an atomic so workers never serialize on it.
#[derive(Debug)]
pub struct ScanStats {
    schedule_id: i64,
    internal_pages: AtomicUsize,
    external_pages: AtomicUsize,
    seed_pages: AtomicUsize,
    fetch_failures: AtomicUsize,
    pages_harvested: AtomicUsize,
    harvest_failures: AtomicUsize,
    cookies_extracted: AtomicUsize,
    cookie_lookups: AtomicUsize,
    last_result: AtomicU8,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    log_paths: Mutex<Vec<PathBuf>>,
}

impl ScanStats {
    pub fn new(schedule_id: i64) -> Self {
        Self {
            schedule_id,
            internal_pages: AtomicUsize::new(0),
            external_pages: AtomicUsize::new(0),
            seed_pages: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
            pages_harvested: AtomicUsize::new(0),
            harvest_failures: AtomicUsize::new(0),
            cookies_extracted: AtomicUsize::new(0),
            cookie_lookups: AtomicUsize::new(0),
            last_result: AtomicU8::new(LastResult::Running.to_u8()),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            log_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule_id(&self) -> i64 {
        self.schedule_id
    }

    /// Seeds are tracked apart from pages reached through links.
    pub fn record_visit(&self, classification: Classification, is_seed: bool) {
        let counter = if is_seed {
            &self.seed_pages
        } else {
            match classification {
                Classification::Internal => &self.internal_pages,
                Classification::External => &self.external_pages,
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_harvest(&self, cookies: usize) {
        self.pages_harvested.fetch_add(1, Ordering::Relaxed);
        self.cookies_extracted.fetch_add(cookies, Ordering::Relaxed);
    }

    pub fn record_harvest_failure(&self) {
        self.harvest_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookups(&self, lookups: usize) {
        self.cookie_lookups.fetch_add(lookups, Ordering::Relaxed);
    }

    pub fn add_log_path(&self, path: PathBuf) {
        self.log_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path);
    }

    pub fn internal_pages(&self) -> usize {
        self.internal_pages.load(Ordering::Relaxed)
    }

    pub fn external_pages(&self) -> usize {
        self.external_pages.load(Ordering::Relaxed)
    }

    pub fn pages_visited(&self) -> usize {
        self.internal_pages() + self.external_pages()
    }

    pub fn cookies_extracted(&self) -> usize {
        self.cookies_extracted.load(Ordering::Relaxed)
    }

    pub fn last_result(&self) -> LastResult {
        LastResult::from_u8(self.last_result.load(Ordering::Acquire))
    }

    /// Records the terminal state. The first terminal state wins, so an abort
    /// raised while a run is wrapping up is never overwritten by `Finished`.
    pub fn finish(&self, result: LastResult) {
        let _ = self.last_result.compare_exchange(
            LastResult::Running.to_u8(),
            result.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let mut finished_at = self
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if finished_at.is_none() {
            *finished_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let finished_at = *self
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let log_paths = self
            .log_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        StatsSnapshot {
            schedule_id: self.schedule_id,
            internal_pages: self.internal_pages(),
            external_pages: self.external_pages(),
            seed_pages: self.seed_pages.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            pages_harvested: self.pages_harvested.load(Ordering::Relaxed),
            harvest_failures: self.harvest_failures.load(Ordering::Relaxed),
            cookies_extracted: self.cookies_extracted(),
            cookie_lookups: self.cookie_lookups.load(Ordering::Relaxed),
            last_result: self.last_result(),
            started_at: self.started_at,
            finished_at,
            duration_secs: finished_at.map(|end| (end - self.started_at).num_seconds()),
            log_paths,
        }
    }
}

/// Point-in-time copy of [`ScanStats`], used for persistence and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub schedule_id: i64,
    pub internal_pages: usize,
    pub external_pages: usize,
    pub seed_pages: usize,
    pub fetch_failures: usize,
    pub pages_harvested: usize,
    pub harvest_failures: usize,
    pub cookies_extracted: usize,
    pub cookie_lookups: usize,
    pub last_result: LastResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub log_paths: Vec<String>,
}

impl StatsSnapshot {
    pub fn pages_visited(&self) -> usize {
        self.internal_pages + self.external_pages
    }
}
