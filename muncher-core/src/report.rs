// Report generation from database

use crate::catalog::{CookieCatalog, CookieCatalogBuilder};
use crate::data::{Schedule, ScanStore};
use crate::error::Result;
use chrono::{DateTime, Utc};
use muncher_scanner::{CookieMetadata, RawCookie, ResolvedCookie, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub const CSV_HEADERS: [&str; 10] = [
    "url",
    "extraction time",
    "name",
    "purpose",
    "about",
    "domain",
    "http only",
    "secure",
    "value",
    "expiration date",
];

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "csv" => Some(ReportFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    pub schedule: Schedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
    pub catalog: CookieCatalog,
    /// Every cookie observation in capture order.
    pub observations: Vec<ResolvedCookie>,
}

/// Rebuilds a schedule's catalog from stored cookies and cookie info.
pub fn gather_report_data(store: &dyn ScanStore, schedule_id: i64) -> Result<ReportData> {
    let schedule = store.get_schedule(schedule_id)?;
    let stats = store.load_stats(schedule_id)?;

    let info: HashMap<String, CookieMetadata> = store
        .load_cookie_info()?
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();

    let mut builder = CookieCatalogBuilder::new();
    let mut observations = Vec::new();
    for cookie in store.load_scan_cookies(schedule_id)? {
        let resolved = resolve_from(&info, cookie);
        builder.add(resolved.clone(), &resolved.cookie.source_url);
        observations.push(resolved);
    }

    Ok(ReportData {
        schedule,
        stats,
        catalog: builder.build(),
        observations,
    })
}

fn resolve_from(info: &HashMap<String, CookieMetadata>, cookie: RawCookie) -> ResolvedCookie {
    let metadata = info
        .get(&cookie.name)
        .cloned()
        .unwrap_or_else(|| CookieMetadata::unknown(&cookie.name));
    ResolvedCookie { cookie, metadata }
}

pub fn generate_text_report(data: &ReportData) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                        MUNCHER COOKIE COMPLIANCE REPORT\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Schedule:     {} ({})\n", data.schedule.id, data.schedule.title));
    if let Some(ref description) = data.schedule.description {
        report.push_str(&format!("Description:  {}\n", description));
    }

    match data.stats {
        Some(ref stats) => {
            report.push_str(&format!("Status:       {}\n", status_to_string(stats)));
            report.push_str(&format!("Scan Date:    {}\n", format_timestamp(&stats.started_at)));
            if let Some(duration) = stats.duration_secs {
                report.push_str(&format!("Duration:     {} seconds\n", duration));
            }
            report.push_str(&format!("Seed Pages:   {}\n", stats.seed_pages));
            report.push_str(&format!("Internal:     {}\n", stats.internal_pages));
            report.push_str(&format!("External:     {}\n", stats.external_pages));
            if stats.fetch_failures > 0 || stats.harvest_failures > 0 {
                report.push_str(&format!(
                    "Failures:     {} fetch, {} harvest\n",
                    stats.fetch_failures, stats.harvest_failures
                ));
            }
            for path in &stats.log_paths {
                report.push_str(&format!("Log:          {}\n", path));
            }
        }
        None => report.push_str("Status:       Not scanned\n"),
    }
    report.push('\n');

    report.push_str(RULE);
    report.push_str("SUMMARY\n");
    report.push_str(RULE);
    report.push('\n');

    let catalog = &data.catalog;
    report.push_str(&format!("Cookies Observed:  {}\n", catalog.total_cookies));
    report.push_str(&format!("Unique Cookies:    {}\n", catalog.unique_cookies));
    report.push_str(&format!("Unidentified:      {}\n\n", catalog.unidentified_cookies));

    for group in &catalog.groups {
        report.push_str(&format!("  [{}] {}\n", group.purpose, group.entries.len()));
    }
    report.push('\n');

    for group in &catalog.groups {
        report.push_str(RULE);
        report.push_str(&format!("{}\n", group.purpose.to_uppercase()));
        report.push_str(RULE);
        report.push('\n');

        for entry in &group.entries {
            let cookie = &entry.cookie.cookie;
            report.push_str(&format!("{}\n", entry.name()));
            report.push_str(&format!("Domain:       {}\n", cookie.domain));
            report.push_str(&format!("First Found:  {}\n", entry.first_found_url));
            report.push_str(&format!("Flags:        {}\n", format_flags(cookie)));
            report.push_str(&format!("Expires:      {}\n", format_expiry(cookie.expires)));
            if let Some(ref about) = entry.cookie.metadata.about {
                report.push_str("About:\n");
                report.push_str(&wrap_text(about, 80, "  "));
            }
            report.push('\n');
        }
    }

    report.push_str(RULE);
    report.push_str("                          End of Report\n");
    report.push_str(RULE);

    report
}

pub fn generate_csv_report(data: &ReportData) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_csv_rows(&mut writer, data)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Writes the CSV report to `path`, creating parent folders as needed.
pub fn write_csv_report(data: &ReportData, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    write_csv_rows(&mut writer, data)?;
    writer.flush()?;
    Ok(())
}

fn write_csv_rows<W: Write>(writer: &mut csv::Writer<W>, data: &ReportData) -> Result<()> {
    writer.write_record(CSV_HEADERS)?;
    for observation in &data.observations {
        let cookie = &observation.cookie;
        writer.write_record([
            cookie.source_url.as_str(),
            format_timestamp(&cookie.captured_at).as_str(),
            cookie.name.as_str(),
            observation.purpose(),
            observation.metadata.about.as_deref().unwrap_or(""),
            cookie.domain.as_str(),
            bool_str(cookie.http_only),
            bool_str(cookie.secure),
            cookie.value.as_str(),
            format_expiry(cookie.expires).as_str(),
        ])?;
    }
    Ok(())
}

pub fn generate_json_report(data: &ReportData) -> Result<String> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "Muncher",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": Utc::now().to_rfc3339(),
                "format": "json"
            },
            "schedule": data.schedule,
            "stats": data.stats,
            "summary": {
                "total_cookies": data.catalog.total_cookies,
                "unique_cookies": data.catalog.unique_cookies,
                "unidentified_cookies": data.catalog.unidentified_cookies,
                "purposes": data.catalog.groups.iter()
                    .map(|g| serde_json::json!({
                        "purpose": g.purpose,
                        "count": g.entries.len()
                    }))
                    .collect::<Vec<_>>()
            },
            "catalog": data.catalog.groups
        }
    });

    Ok(serde_json::to_string_pretty(&json_report)?)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn status_to_string(stats: &StatsSnapshot) -> &'static str {
    match stats.last_result.as_str() {
        "finished" => "Finished",
        "aborted" => "Aborted",
        _ => "Running",
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_expiry(expires: Option<i64>) -> String {
    match expires {
        Some(secs) => DateTime::<Utc>::from_timestamp(secs, 0)
            .map(|dt| format_timestamp(&dt))
            .unwrap_or_else(|| secs.to_string()),
        None => "session".to_string(),
    }
}

fn format_flags(cookie: &RawCookie) -> String {
    let mut flags = Vec::new();
    if cookie.http_only {
        flags.push("HttpOnly");
    }
    if cookie.secure {
        flags.push("Secure");
    }
    if flags.is_empty() {
        "none".to_string()
    } else {
        flags.join(", ")
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn wrap_text(text: &str, width: usize, indent: &str) -> String {
    let mut result = String::new();
    let mut current_line = String::new();

    for word in text.split_whitespace() {
        if current_line.len() + word.len() + 1 > width - indent.len() && !current_line.is_empty() {
            result.push_str(indent);
            result.push_str(&current_line);
            result.push('\n');
            current_line.clear();
        }

        if !current_line.is_empty() {
            current_line.push(' ');
        }
        current_line.push_str(word);
    }

    if !current_line.is_empty() {
        result.push_str(indent);
        result.push_str(&current_line);
        result.push('\n');
    }

    result
}
