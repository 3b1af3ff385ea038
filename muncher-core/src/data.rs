use crate::config::ScanConfig;
use crate::error::{MuncherError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use muncher_scanner::frontier::DiscoveredUrl;
use muncher_scanner::{CookieMetadata, LastResult, RawCookie, StatsSnapshot};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The key-addressed reads and writes a scan run and the CLI need.
pub trait ScanStore {
    fn get_schedule(&self, id: i64) -> Result<Schedule>;

    /// Loads and validates the config a schedule points at.
    fn load_config(&self, schedule_id: i64) -> Result<ScanConfig>;

    /// Fails with [`MuncherError::StatsExist`] if the schedule already has stats.
    fn create_stats(&self, stats: &StatsSnapshot) -> Result<()>;

    fn save_stats(&self, stats: &StatsSnapshot) -> Result<()>;

    fn load_stats(&self, schedule_id: i64) -> Result<Option<StatsSnapshot>>;

    fn save_url(&self, url: &DiscoveredUrl, status_code: Option<u16>) -> Result<()>;

    fn save_cookie(&self, schedule_id: i64, cookie: &RawCookie) -> Result<()>;

    fn load_scan_cookies(&self, schedule_id: i64) -> Result<Vec<RawCookie>>;

    fn load_cookie_info(&self) -> Result<Vec<CookieMetadata>>;

    /// Insert or replace by cookie name.
    fn save_cookie_info(&self, metadata: &CookieMetadata) -> Result<()>;

    fn create_config(&self, config: &ScanConfig) -> Result<i64>;

    fn create_schedule(&self, config_id: i64, title: &str, description: Option<&str>) -> Result<i64>;

    fn list_schedules(&self) -> Result<Vec<ScheduleSummary>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub config_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub schedule: Schedule,
    pub last_result: Option<LastResult>,
    pub cookies_extracted: Option<usize>,
}

/// A persisted `url_scans` row.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRecord {
    pub url: String,
    pub depth: usize,
    pub path_depth: usize,
    pub classification: String,
    pub is_seed: bool,
    pub visited: bool,
    pub status_code: Option<u16>,
}

pub struct Database {
    conn: Connection,
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

impl Database {
    /// Removes the database file along with its WAL side files.
    pub fn drop(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = Path::new(&side);
            if side.exists() {
                fs::remove_file(side)?;
            }
        }
        Ok(())
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scan_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    json_params TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY(config_id) REFERENCES scan_configs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS scan_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER UNIQUE NOT NULL,
    internal_pages INTEGER NOT NULL DEFAULT 0,
    external_pages INTEGER NOT NULL DEFAULT 0,
    seed_pages INTEGER NOT NULL DEFAULT 0,
    fetch_failures INTEGER NOT NULL DEFAULT 0,
    pages_harvested INTEGER NOT NULL DEFAULT 0,
    harvest_failures INTEGER NOT NULL DEFAULT 0,
    cookies_extracted INTEGER NOT NULL DEFAULT 0,
    cookie_lookups INTEGER NOT NULL DEFAULT 0,
    last_result TEXT NOT NULL CHECK(last_result IN ('running', 'finished', 'aborted')),
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_secs INTEGER,
    log_paths TEXT NOT NULL DEFAULT '[]',  -- JSON array
    FOREIGN KEY(schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS url_scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    path_depth INTEGER NOT NULL,
    classification TEXT NOT NULL CHECK(classification IN ('internal', 'external')),
    is_seed BOOLEAN NOT NULL DEFAULT 0,
    visited BOOLEAN NOT NULL DEFAULT 0,
    status_code INTEGER,
    FOREIGN KEY(schedule_id) REFERENCES schedules(id) ON DELETE CASCADE,
    UNIQUE(schedule_id, url)
);

CREATE INDEX IF NOT EXISTS idx_url_scans_schedule ON url_scans(schedule_id);

CREATE TABLE IF NOT EXISTS cookies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    domain TEXT NOT NULL,
    path TEXT NOT NULL,
    http_only BOOLEAN NOT NULL,
    secure BOOLEAN NOT NULL,
    expires INTEGER,
    source_url TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    FOREIGN KEY(schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cookies_schedule ON cookies(schedule_id);
CREATE INDEX IF NOT EXISTS idx_cookies_name ON cookies(name);

CREATE TABLE IF NOT EXISTS cookie_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cookie_name TEXT UNIQUE NOT NULL,
    purpose TEXT NOT NULL,
    about TEXT,
    resolved_at TEXT NOT NULL
);
            ",
        )?;
        Ok(())
    }

    pub fn get_connection(&self) -> &Connection {
        &self.conn
    }

    pub fn load_urls(&self, schedule_id: i64) -> Result<Vec<UrlRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, depth, path_depth, classification, is_seed, visited, status_code
             FROM url_scans WHERE schedule_id = ?1 ORDER BY id",
        )?;

        let urls = stmt
            .query_map(params![schedule_id], |row| {
                Ok(UrlRecord {
                    url: row.get(0)?,
                    depth: to_usize(row.get(1)?),
                    path_depth: to_usize(row.get(2)?),
                    classification: row.get(3)?,
                    is_seed: row.get(4)?,
                    visited: row.get(5)?,
                    status_code: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(urls)
    }

    fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<StatsSnapshot> {
        let last_result: String = row.get(9)?;
        let last_result = LastResult::from_str(&last_result).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                Type::Text,
                format!("unknown last_result {}", last_result).into(),
            )
        })?;
        let started_at: String = row.get(10)?;
        let finished_at: Option<String> = row.get(11)?;
        let log_paths: String = row.get(13)?;
        let log_paths = serde_json::from_str(&log_paths)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))?;

        Ok(StatsSnapshot {
            schedule_id: row.get(0)?,
            internal_pages: to_usize(row.get(1)?),
            external_pages: to_usize(row.get(2)?),
            seed_pages: to_usize(row.get(3)?),
            fetch_failures: to_usize(row.get(4)?),
            pages_harvested: to_usize(row.get(5)?),
            harvest_failures: to_usize(row.get(6)?),
            cookies_extracted: to_usize(row.get(7)?),
            cookie_lookups: to_usize(row.get(8)?),
            last_result,
            started_at: parse_time(10, &started_at)?,
            finished_at: finished_at.as_deref().map(|s| parse_time(11, s)).transpose()?,
            duration_secs: row.get(12)?,
            log_paths,
        })
    }

    fn write_stats(&self, stats: &StatsSnapshot, insert: bool) -> Result<usize> {
        let log_paths = serde_json::to_string(&stats.log_paths)?;
        let sql = if insert {
            "INSERT INTO scan_stats (
                schedule_id, internal_pages, external_pages, seed_pages, fetch_failures,
                pages_harvested, harvest_failures, cookies_extracted, cookie_lookups,
                last_result, started_at, finished_at, duration_secs, log_paths
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        } else {
            "UPDATE scan_stats SET
                internal_pages = ?2, external_pages = ?3, seed_pages = ?4, fetch_failures = ?5,
                pages_harvested = ?6, harvest_failures = ?7, cookies_extracted = ?8,
                cookie_lookups = ?9, last_result = ?10, started_at = ?11, finished_at = ?12,
                duration_secs = ?13, log_paths = ?14
             WHERE schedule_id = ?1"
        };

        let changed = self.conn.execute(
            sql,
            params![
                stats.schedule_id,
                stats.internal_pages as i64,
                stats.external_pages as i64,
                stats.seed_pages as i64,
                stats.fetch_failures as i64,
                stats.pages_harvested as i64,
                stats.harvest_failures as i64,
                stats.cookies_extracted as i64,
                stats.cookie_lookups as i64,
                stats.last_result.as_str(),
                format_time(&stats.started_at),
                stats.finished_at.as_ref().map(format_time),
                stats.duration_secs,
                log_paths,
            ],
        )?;
        Ok(changed)
    }
}

impl ScanStore for Database {
    fn get_schedule(&self, id: i64) -> Result<Schedule> {
        let mut stmt = self.conn.prepare(
            "SELECT id, config_id, title, description, created_at FROM schedules WHERE id = ?1",
        )?;

        stmt.query_row(params![id], |row| {
            Ok(Schedule {
                id: row.get(0)?,
                config_id: row.get(1)?,
                title: row.get(2)?,
                description: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?
        .ok_or(MuncherError::ScheduleNotFound(id))
    }

    fn load_config(&self, schedule_id: i64) -> Result<ScanConfig> {
        let schedule = self.get_schedule(schedule_id)?;
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json_params FROM scan_configs WHERE id = ?1",
                params![schedule.config_id],
                |row| row.get(0),
            )
            .optional()?;

        let json = json.ok_or_else(|| {
            MuncherError::Config(format!(
                "schedule {} points at missing config {}",
                schedule_id, schedule.config_id
            ))
        })?;
        ScanConfig::from_json(&json)
    }

    fn create_stats(&self, stats: &StatsSnapshot) -> Result<()> {
        if self.load_stats(stats.schedule_id)?.is_some() {
            return Err(MuncherError::StatsExist(stats.schedule_id));
        }
        self.write_stats(stats, true)?;
        Ok(())
    }

    fn save_stats(&self, stats: &StatsSnapshot) -> Result<()> {
        if self.write_stats(stats, false)? == 0 {
            self.write_stats(stats, true)?;
        }
        Ok(())
    }

    fn load_stats(&self, schedule_id: i64) -> Result<Option<StatsSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT schedule_id, internal_pages, external_pages, seed_pages, fetch_failures,
                    pages_harvested, harvest_failures, cookies_extracted, cookie_lookups,
                    last_result, started_at, finished_at, duration_secs, log_paths
             FROM scan_stats WHERE schedule_id = ?1",
        )?;

        Ok(stmt
            .query_row(params![schedule_id], Self::stats_from_row)
            .optional()?)
    }

    fn save_url(&self, url: &DiscoveredUrl, status_code: Option<u16>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO url_scans (
                schedule_id, url, depth, path_depth, classification, is_seed, visited, status_code
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(schedule_id, url) DO UPDATE SET
                visited = MAX(visited, excluded.visited),
                status_code = COALESCE(excluded.status_code, status_code)",
            params![
                url.schedule_id,
                &url.url,
                url.depth as i64,
                url.path_depth as i64,
                url.classification.as_str(),
                url.is_seed,
                url.visited,
                status_code,
            ],
        )?;
        Ok(())
    }

    fn save_cookie(&self, schedule_id: i64, cookie: &RawCookie) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cookies (
                schedule_id, name, value, domain, path, http_only, secure, expires,
                source_url, captured_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                schedule_id,
                &cookie.name,
                &cookie.value,
                &cookie.domain,
                &cookie.path,
                cookie.http_only,
                cookie.secure,
                cookie.expires,
                &cookie.source_url,
                format_time(&cookie.captured_at),
            ],
        )?;
        Ok(())
    }

    fn load_scan_cookies(&self, schedule_id: i64) -> Result<Vec<RawCookie>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, value, domain, path, http_only, secure, expires, source_url, captured_at
             FROM cookies WHERE schedule_id = ?1 ORDER BY id",
        )?;

        let cookies = stmt
            .query_map(params![schedule_id], |row| {
                let captured_at: String = row.get(8)?;
                Ok(RawCookie {
                    name: row.get(0)?,
                    value: row.get(1)?,
                    domain: row.get(2)?,
                    path: row.get(3)?,
                    http_only: row.get(4)?,
                    secure: row.get(5)?,
                    expires: row.get(6)?,
                    source_url: row.get(7)?,
                    captured_at: parse_time(8, &captured_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(cookies)
    }

    fn load_cookie_info(&self) -> Result<Vec<CookieMetadata>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cookie_name, purpose, about, resolved_at FROM cookie_info ORDER BY cookie_name")?;

        let records = stmt
            .query_map([], |row| {
                let resolved_at: String = row.get(3)?;
                Ok(CookieMetadata {
                    name: row.get(0)?,
                    purpose: row.get(1)?,
                    about: row.get(2)?,
                    resolved_at: parse_time(3, &resolved_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn save_cookie_info(&self, metadata: &CookieMetadata) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cookie_info (cookie_name, purpose, about, resolved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cookie_name) DO UPDATE SET
                purpose = excluded.purpose,
                about = excluded.about,
                resolved_at = excluded.resolved_at",
            params![
                &metadata.name,
                &metadata.purpose,
                &metadata.about,
                format_time(&metadata.resolved_at),
            ],
        )?;
        Ok(())
    }

    fn create_config(&self, config: &ScanConfig) -> Result<i64> {
        config.validate()?;
        self.conn.execute(
            "INSERT INTO scan_configs (json_params, created_at) VALUES (?1, ?2)",
            params![config.to_json()?, current_timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn create_schedule(&self, config_id: i64, title: &str, description: Option<&str>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO schedules (config_id, title, description, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![config_id, title, description, current_timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_schedules(&self) -> Result<Vec<ScheduleSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.config_id, s.title, s.description, s.created_at,
                    st.last_result, st.cookies_extracted
             FROM schedules s
             LEFT JOIN scan_stats st ON st.schedule_id = s.id
             ORDER BY s.id",
        )?;

        let schedules = stmt
            .query_map([], |row| {
                let last_result: Option<String> = row.get(5)?;
                let cookies: Option<i64> = row.get(6)?;
                Ok(ScheduleSummary {
                    schedule: Schedule {
                        id: row.get(0)?,
                        config_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        created_at: row.get(4)?,
                    },
                    last_result: last_result.as_deref().and_then(LastResult::from_str),
                    cookies_extracted: cookies.map(to_usize),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(schedules)
    }
}
