use clap::ArgMatches;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use muncher_core::config::ScanConfig;
use muncher_core::data::{Database, ScanStore};
use muncher_core::report::{
    ReportFormat, gather_report_data, generate_csv_report, generate_json_report,
    generate_text_report, save_report, write_csv_report,
};
use muncher_core::scan::{ScanDrivers, ScanOutcome, ScanRunner};
use muncher_core::{MuncherError, Result as CoreResult};
use muncher_scanner::{
    CookiepediaSource, HarvestedPage, HttpCookieDriver, HttpFetcher, LastResult,
};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use url::Url;

use crate::commands::DEFAULT_DB_PATH;

// Helper functions for schedule handler

/// Load seed URLs from either a file or the `--url` arguments
pub fn load_urls_from_source(
    urls: &[Url],
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if !urls.is_empty() {
        Ok(urls.iter().map(|u| u.as_str().to_string()).collect())
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| parse_url_line(line.trim()))
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add https:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = Url::parse(line)
        && url.has_host()
    {
        return Some(line.to_string());
    }

    let with_scheme = format!("https://{}", line);
    if Url::parse(&with_scheme).is_ok() {
        return Some(with_scheme);
    }

    eprintln!("{} Skipping invalid URL '{}'", "⚠".yellow(), line);
    None
}

/// Path portion of a URL for compact progress messages.
pub fn extract_url_path(url: &str) -> String {
    Url::parse(url)
        .map(|u| {
            let path = u.path();
            if path.is_empty() { "/".to_string() } else { path.to_string() }
        })
        .unwrap_or_else(|_| url.to_string())
}

/// The database location from `--db`, with `~` expanded.
pub fn db_path(args: &ArgMatches) -> PathBuf {
    let raw = args
        .get_one::<String>("db")
        .map(String::as_str)
        .unwrap_or(DEFAULT_DB_PATH);
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn open_database(path: &Path) -> Result<Database, String> {
    if !Database::exists(path) {
        return Err(format!(
            "No database at {}. Run `muncher init` first.",
            path.display()
        ));
    }
    Database::new(path).map_err(|e| format!("Cannot open database {}: {}", path.display(), e))
}

/// Builds the scan config described by `schedule` arguments.
pub fn config_from_args(args: &ArgMatches) -> Result<ScanConfig, String> {
    let urls: Vec<Url> = args
        .get_many::<Url>("url")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let seeds = load_urls_from_source(&urls, args.get_one::<PathBuf>("hosts-file"))?;

    let mut config = ScanConfig::new(seeds);
    config.domain_only = args.get_flag("domain-only");
    config.silent = args.get_flag("silent");
    config.cache_unknown = args.get_flag("cache-unknown");
    config.user_agent = args.get_one::<String>("user-agent").cloned();
    if let Some(depth) = args.get_one::<usize>("depth") {
        config.max_depth = *depth;
    }
    if let Some(delay) = args.get_one::<u64>("delay") {
        config.request_delay_ms = *delay;
    }
    if let Some(workers) = args.get_one::<usize>("workers") {
        config.workers = *workers;
    }
    if let Some(sessions) = args.get_one::<usize>("sessions") {
        config.browser_sessions = *sessions;
    }
    if let Some(timeout) = args.get_one::<u64>("timeout") {
        config.navigation_timeout_secs = *timeout;
    }
    if let Some(folder) = args.get_one::<PathBuf>("logs-folder") {
        config.logs_folder = folder.clone();
    }
    if let Some(folder) = args.get_one::<PathBuf>("output-folder") {
        config.output_folder = folder.clone();
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// How cookies are harvested from visited pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Headless Chromium. Sees cookies set by scripts.
    Chrome,
    /// Plain HTTP with a per-page cookie jar. Only sees `Set-Cookie` headers.
    Http,
}

impl Engine {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chrome" | "chromium" => Some(Engine::Chrome),
            "http" => Some(Engine::Http),
            _ => None,
        }
    }
}

/// Network collaborators for one scan run.
pub fn make_drivers(engine: Engine, config: &ScanConfig, user_agent: &str) -> CoreResult<ScanDrivers> {
    let fetcher = Arc::new(HttpFetcher::new(user_agent)?);
    let knowledge = Arc::new(CookiepediaSource::new(user_agent)?);

    let browser: Arc<dyn muncher_scanner::BrowserDriver> = match engine {
        Engine::Http => Arc::new(
            HttpCookieDriver::new(user_agent).with_timeout(config.navigation_timeout()),
        ),
        #[cfg(feature = "browser")]
        Engine::Chrome => {
            let options = muncher_scanner::ChromeOptions {
                settle: config.settle(),
                ..muncher_scanner::ChromeOptions::new(user_agent)
            };
            Arc::new(muncher_scanner::ChromeDriver::new(options))
        }
        #[cfg(not(feature = "browser"))]
        Engine::Chrome => {
            return Err(MuncherError::Config(
                "muncher was built without browser support; use --engine http".to_string(),
            ));
        }
    };

    Ok(ScanDrivers {
        fetcher,
        browser,
        knowledge,
    })
}

pub fn print_banner() {
    println!(
        "{}",
        r#"
  _ __ ___  _   _ _ __   ___| |__   ___ _ __
 | '_ ` _ \| | | | '_ \ / __| '_ \ / _ \ '__|
 | | | | | | |_| | | | | (__| | | |  __/ |
 |_| |_| |_|\__,_|_| |_|\___|_| |_|\___|_|
"#
        .bright_cyan()
        .bold()
    );
    println!(
        "  {} v{}\n",
        "cookie compliance scanner".bright_white(),
        env!("CARGO_PKG_VERSION")
    );
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> String {
    print!("{} ", msg.bright_cyan().bold());
    let _ = io::stdout().flush();
    let mut response = String::new();
    if io::stdin().read_line(&mut response).is_err() {
        return String::new();
    }
    response.trim().to_lowercase()
}

fn spinner(progress: &MultiProgress, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = progress.add(ProgressBar::new_spinner());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn handle_init(args: &ArgMatches) -> Result<(), String> {
    let quiet = args.get_flag("quiet");
    let force = args.get_flag("force");
    let db_path = match args.get_one::<String>("PATH") {
        Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
        None => db_path(args),
    };

    if !quiet {
        print_divider();
        println!("{}", "  MUNCHER INITIALIZATION".bright_white().bold());
        print_divider();
        println!();
    }

    if Database::exists(&db_path) {
        if !force {
            println!("{}", "⚠ WARNING".yellow().bold());
            println!("Database already exists at:");
            println!(
                "  {} {}",
                "•".yellow(),
                db_path.display().to_string().bright_white()
            );
            println!();

            let response = print_prompt("Would you like to overwrite it? [y/N]:");
            println!();
            if response != "y" && response != "yes" {
                println!("{} Keeping existing database", "→".blue());
                return Ok(());
            }
        }
        Database::drop(&db_path).map_err(|e| format!("Failed to remove database: {}", e))?;
        if !quiet {
            println!("{} Existing database removed", "✓".green().bold());
        }
    }

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    Database::new(&db_path).map_err(|e| format!("Failed to create database: {}", e))?;

    if !quiet {
        println!(
            "{} Database initialized: {}",
            "✓".green().bold(),
            db_path.display().to_string().bright_white()
        );
        println!();
    }
    Ok(())
}

/// Stores a config and a schedule for it. Returns the schedule id.
pub fn handle_schedule(args: &ArgMatches) -> Result<i64, String> {
    let db = open_database(&db_path(args))?;
    let config = config_from_args(args)?;

    let title = args
        .get_one::<String>("title")
        .cloned()
        .unwrap_or_else(|| config.seeds[0].clone());
    let description = args.get_one::<String>("description").map(String::as_str);

    let config_id = db.create_config(&config).map_err(|e| e.to_string())?;
    let schedule_id = db
        .create_schedule(config_id, &title, description)
        .map_err(|e| e.to_string())?;

    if args.get_flag("quiet") {
        println!("{}", schedule_id);
    } else {
        println!(
            "{} Schedule {} created: {} ({} seed{}, depth {})",
            "✓".green().bold(),
            schedule_id.to_string().bright_white().bold(),
            title,
            config.seeds.len(),
            if config.seeds.len() == 1 { "" } else { "s" },
            config.max_depth
        );
    }
    Ok(schedule_id)
}

/// Installs a file log sink for the scan. Silent scans get none.
/// Per-schedule log file shared with the subscriber's file layer. Events are
/// discarded until a file is attached.
#[derive(Clone, Default)]
pub struct LogFile {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    pub fn attach(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        let file =
            File::create(path).map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;

        let mut slot = self
            .file
            .lock()
            .map_err(|_| "Log file lock poisoned".to_string())?;
        *slot = Some(file);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

/// Filter for the stderr layer. `--quiet` keeps errors only, otherwise
/// `RUST_LOG` applies with warnings as the default.
pub fn stderr_filter(quiet: bool) -> EnvFilter {
    if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    }
}

pub fn build_subscriber(
    quiet: bool,
    log_file: LogFile,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(stderr_filter(quiet)),
        )
        .with(
            fmt::layer()
                .with_writer(move || log_file.clone())
                .with_ansi(false)
                .with_target(false)
                .with_filter(LevelFilter::INFO),
        )
}

/// Installs the global subscriber and returns the handle scans attach their
/// log file to.
pub fn init_logging(quiet: bool) -> LogFile {
    let log_file = LogFile::default();
    if build_subscriber(quiet, log_file.clone()).try_init().is_err() {
        warn!("A log subscriber is already installed; scan log files stay empty");
    }
    log_file
}

pub async fn handle_scan(args: &ArgMatches, log_file: &LogFile) -> Result<LastResult, String> {
    let quiet = args.get_flag("quiet");
    let schedule_id = *args
        .get_one::<i64>("id")
        .ok_or_else(|| "--id is required".to_string())?;
    let engine = args
        .get_one::<String>("engine")
        .and_then(|e| Engine::from_str(e))
        .unwrap_or(Engine::Chrome);

    let db = open_database(&db_path(args))?;
    let config = db.load_config(schedule_id).map_err(|e| e.to_string())?;

    let started = chrono::Utc::now();
    let log_path = config.log_file_path(schedule_id, started);
    if let Some(ref path) = log_path {
        log_file.attach(path)?;
    }

    if !quiet {
        println!(
            "\n🍪 Scanning schedule {} ({} seed{})",
            schedule_id,
            config.seeds.len(),
            if config.seeds.len() == 1 { "" } else { "s" }
        );
        println!("Crawl workers:    {}", config.workers);
        println!("Browser sessions: {} ({:?})", config.browser_sessions, engine);
        println!("Max depth:        {}", config.max_depth);
        println!(
            "Cross-domain:     {}",
            if config.domain_only { "disabled (seed hosts only)" } else { "followed" }
        );
        if let Some(ref path) = log_path {
            println!("Log:              {}", path.display());
        }
        println!();
    }

    let progress = MultiProgress::new();
    let crawl_bar = spinner(&progress, quiet);
    let harvest_bar = spinner(&progress, quiet);
    crawl_bar.set_message("crawl: starting");
    harvest_bar.set_message("harvest: waiting for pages");

    let crawl_progress = {
        let bar = crawl_bar.clone();
        Arc::new(move |worker_id: usize, url: String| {
            bar.set_message(format!("crawl [{}]: {}", worker_id, extract_url_path(&url)));
        })
    };
    let harvest_progress = {
        let bar = harvest_bar.clone();
        let pages = Arc::new(AtomicUsize::new(0));
        let cookies = Arc::new(AtomicUsize::new(0));
        Arc::new(move |page: &HarvestedPage| {
            let pages = pages.fetch_add(1, Ordering::Relaxed) + 1;
            let cookies = cookies.fetch_add(page.cookies.len(), Ordering::Relaxed) + page.cookies.len();
            bar.set_message(format!(
                "harvest: {} pages, {} cookies, last {}",
                pages,
                cookies,
                extract_url_path(&page.page.url)
            ));
        })
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut runner = ScanRunner::new(&db)
        .with_crawl_progress(crawl_progress)
        .with_harvest_progress(harvest_progress);
    if let Some(ref path) = log_path {
        runner = runner.with_log_path(path.clone());
    }

    let outcome = runner
        .run(
            schedule_id,
            |config, user_agent| make_drivers(engine, config, user_agent),
            cancel,
        )
        .await;

    crawl_bar.finish_and_clear();
    harvest_bar.finish_and_clear();
    let _ = progress.clear();

    let outcome = outcome.map_err(|e| match e {
        MuncherError::StatsExist(id) => format!(
            "Schedule {} has already been scanned. Create a new schedule to scan again.",
            id
        ),
        other => format!("Scan failed: {}", other),
    })?;

    if !quiet {
        print_scan_summary(&outcome);
    }

    let output_path = config.output_file_path(schedule_id, started);
    let data = gather_report_data(&db, schedule_id).map_err(|e| e.to_string())?;
    write_csv_report(&data, &output_path)
        .map_err(|e| format!("Failed to write {}: {}", output_path.display(), e))?;
    if !quiet {
        println!(
            "{} Cookie report: {}",
            "✓".green().bold(),
            output_path.display().to_string().bright_white()
        );
    }

    Ok(outcome.stats.last_result)
}

fn print_scan_summary(outcome: &ScanOutcome) {
    let stats = &outcome.stats;
    let catalog = &outcome.catalog;

    print_divider();
    match stats.last_result {
        LastResult::Finished => println!("{}", "  SCAN FINISHED".green().bold()),
        _ => println!("{}", "  SCAN ABORTED".red().bold()),
    }
    print_divider();
    println!(
        "Pages:    {} seed, {} internal, {} external",
        stats.seed_pages, stats.internal_pages, stats.external_pages
    );
    if stats.fetch_failures > 0 || stats.harvest_failures > 0 {
        println!(
            "Failures: {} fetch, {} harvest",
            stats.fetch_failures.to_string().yellow(),
            stats.harvest_failures.to_string().yellow()
        );
    }
    println!(
        "Cookies:  {} observed, {} unique, {} unidentified",
        catalog.total_cookies,
        catalog.unique_cookies.to_string().bright_white().bold(),
        catalog.unidentified_cookies.to_string().yellow()
    );
    for group in &catalog.groups {
        println!("  {} {}: {}", "•".cyan(), group.purpose, group.entries.len());
    }
    if let Some(duration) = stats.duration_secs {
        println!("Duration: {}s", duration);
    }
    println!();
}

pub fn handle_report(args: &ArgMatches) -> Result<(), String> {
    let schedule_id = *args
        .get_one::<i64>("id")
        .ok_or_else(|| "--id is required".to_string())?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::from_str(f))
        .unwrap_or(ReportFormat::Text);
    let output = args.get_one::<PathBuf>("output");

    let db = open_database(&db_path(args))?;
    let data = gather_report_data(&db, schedule_id).map_err(|e| e.to_string())?;

    match (format, output) {
        (ReportFormat::Csv, Some(path)) => {
            write_csv_report(&data, path).map_err(|e| e.to_string())?;
        }
        (format, output) => {
            let content = match format {
                ReportFormat::Text => generate_text_report(&data),
                ReportFormat::Json => generate_json_report(&data).map_err(|e| e.to_string())?,
                ReportFormat::Csv => generate_csv_report(&data).map_err(|e| e.to_string())?,
            };
            match output {
                Some(path) => save_report(&content, path).map_err(|e| e.to_string())?,
                None => {
                    print!("{}", content);
                    return Ok(());
                }
            }
        }
    }

    if let Some(path) = output
        && !args.get_flag("quiet")
    {
        println!(
            "{} Report saved: {}",
            "✓".green().bold(),
            path.display().to_string().bright_white()
        );
    }
    Ok(())
}

pub fn handle_schedules(args: &ArgMatches) -> Result<(), String> {
    let db = open_database(&db_path(args))?;
    let schedules = db.list_schedules().map_err(|e| e.to_string())?;

    if schedules.is_empty() {
        println!("No schedules yet. Create one with `muncher schedule -u <URL>`.");
        return Ok(());
    }

    println!(
        "{}",
        format!("{:>5}  {:<40}  {:<10}  {:>7}", "ID", "TITLE", "RESULT", "COOKIES").bold()
    );
    for summary in schedules {
        let result = match summary.last_result {
            Some(LastResult::Finished) => "finished".green(),
            Some(LastResult::Aborted) => "aborted".red(),
            Some(LastResult::Running) => "running".yellow(),
            None => "pending".dimmed(),
        };
        let cookies = summary
            .cookies_extracted
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:<40}  {:<10}  {:>7}",
            summary.schedule.id,
            truncate(&summary.schedule.title, 40),
            result,
            cookies
        );
    }
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
