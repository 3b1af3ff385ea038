use muncher::commands::command_argument_builder;
use muncher::handlers::*;
use muncher_core::data::{Database, ScanStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use url::Url;

fn matches(args: &[&str]) -> clap::ArgMatches {
    let mut argv = vec!["muncher"];
    argv.extend_from_slice(args);
    command_argument_builder()
        .try_get_matches_from(argv)
        .unwrap()
}

fn subcommand<'a>(matches: &'a clap::ArgMatches, name: &str) -> &'a clap::ArgMatches {
    let (found, sub) = matches.subcommand().unwrap();
    assert_eq!(found, name);
    sub
}

fn db_arg(dir: &Path) -> String {
    dir.join("muncher.db").display().to_string()
}

#[test]
fn test_parse_url_line_with_scheme() {
    let result = parse_url_line("https://example.com");
    assert_eq!(result, Some("https://example.com".to_string()));
}

#[test]
fn test_parse_url_line_without_scheme() {
    let result = parse_url_line("example.com");
    assert_eq!(result, Some("https://example.com".to_string()));
}

#[test]
fn test_parse_url_line_host_and_port() {
    let result = parse_url_line("localhost:8080");
    assert_eq!(result, Some("https://localhost:8080".to_string()));
}

#[test]
fn test_parse_url_line_invalid() {
    let result = parse_url_line("not a valid url!!!");
    assert_eq!(result, None);
}

#[test]
fn test_extract_url_path() {
    assert_eq!(
        extract_url_path("https://example.com/privacy/cookies"),
        "/privacy/cookies"
    );
    assert_eq!(extract_url_path("https://example.com/"), "/");
    assert_eq!(extract_url_path("https://example.com"), "/");
}

#[test]
fn test_load_urls_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, "https://example.com")?;
    writeln!(temp_file, "# shop front")?;
    writeln!(temp_file, "shop.example.com")?;
    writeln!(temp_file)?; // Empty line
    writeln!(temp_file, "https://news.example.com")?;

    let path = PathBuf::from(temp_file.path());
    let urls = load_urls_from_file(&path)?;

    assert_eq!(urls.len(), 3);
    assert_eq!(urls[0], "https://example.com");
    assert_eq!(urls[1], "https://shop.example.com");
    assert_eq!(urls[2], "https://news.example.com");

    Ok(())
}

#[test]
fn test_load_urls_from_file_empty() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file).unwrap();
    writeln!(temp_file, "   ").unwrap();

    let path = PathBuf::from(temp_file.path());
    let result = load_urls_from_file(&path);

    assert!(result.is_err());
    assert!(result.unwrap_err().contains("No valid URLs"));
}

#[test]
fn test_load_urls_from_source_urls() {
    let urls = vec![
        Url::parse("https://example.com").unwrap(),
        Url::parse("https://example.org/shop").unwrap(),
    ];
    let result = load_urls_from_source(&urls, None).unwrap();

    assert_eq!(result, vec!["https://example.com/", "https://example.org/shop"]);
}

#[test]
fn test_load_urls_from_source_no_input() {
    let result = load_urls_from_source(&[], None);
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .contains("Either --url or --hosts-file must be provided")
    );
}

#[test]
fn test_engine_from_str() {
    assert_eq!(Engine::from_str("chrome"), Some(Engine::Chrome));
    assert_eq!(Engine::from_str("HTTP"), Some(Engine::Http));
    assert_eq!(Engine::from_str("firefox"), None);
}

// ============================================================================
// Argument Tests
// ============================================================================

#[test]
fn test_config_from_args() {
    let m = matches(&[
        "schedule",
        "-u",
        "https://a.test/",
        "-u",
        "https://b.test/",
        "--depth",
        "2",
        "--domain-only",
        "--sessions",
        "3",
        "--cache-unknown",
        "--user-agent",
        "muncher-test",
    ]);
    let config = config_from_args(subcommand(&m, "schedule")).unwrap();

    assert_eq!(config.seeds, vec!["https://a.test/", "https://b.test/"]);
    assert_eq!(config.max_depth, 2);
    assert!(config.domain_only);
    assert!(config.cache_unknown);
    assert!(!config.silent);
    assert_eq!(config.browser_sessions, 3);
    assert_eq!(config.workers, 4);
    assert_eq!(config.user_agent.as_deref(), Some("muncher-test"));
    assert_eq!(config.logs_folder, PathBuf::from("logs"));
}

#[test]
fn test_config_from_args_rejects_zero_workers() {
    let m = matches(&["schedule", "-u", "https://a.test/", "--workers", "0"]);
    let result = config_from_args(subcommand(&m, "schedule"));

    assert!(result.unwrap_err().contains("workers"));
}

#[test]
fn test_url_and_hosts_file_conflict() {
    let result = command_argument_builder().try_get_matches_from([
        "muncher",
        "schedule",
        "-u",
        "https://a.test/",
        "-H",
        "hosts.txt",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_db_path_expands_tilde() {
    let m = matches(&["--db", "~/muncher-test.db", "schedules"]);
    let path = db_path(subcommand(&m, "schedules"));

    assert!(!path.to_string_lossy().starts_with('~'));
    assert!(path.ends_with("muncher-test.db"));
}

#[test]
fn test_make_http_drivers() {
    let config = muncher_core::ScanConfig::new(vec!["https://a.test/".to_string()]);
    assert!(make_drivers(Engine::Http, &config, "muncher-test").is_ok());
}

// ============================================================================
// Logging Tests
// ============================================================================

#[test]
fn test_quiet_stderr_filter_keeps_errors_only() {
    let filter = stderr_filter(true);
    assert_eq!(
        filter.max_level_hint(),
        Some(tracing_subscriber::filter::LevelFilter::ERROR)
    );
}

#[test]
fn test_log_file_receives_events_once_attached() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("logs").join("scan.log");
    let log_file = LogFile::default();
    let subscriber = build_subscriber(true, log_file.clone());

    tracing::subscriber::with_default(subscriber, || {
        tracing::info!("before attach");
        assert!(!log_file.is_attached());

        log_file.attach(&path).unwrap();
        tracing::warn!("crawl worker failed");
        tracing::debug!("frontier state");
    });

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("crawl worker failed"));
    assert!(!written.contains("before attach"));
    assert!(!written.contains("frontier state"));
}

// ============================================================================
// Command Tests
// ============================================================================

#[test]
fn test_init_creates_database_in_new_folder() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("nested").join("muncher.db");
    let db_str = db.display().to_string();

    let m = matches(&["-q", "init", &db_str]);
    handle_init(subcommand(&m, "init")).unwrap();

    assert!(Database::exists(&db));
}

#[test]
fn test_init_force_replaces_database() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_arg(temp_dir.path());

    let m = matches(&["-q", "--db", &db, "init"]);
    handle_init(subcommand(&m, "init")).unwrap();
    let m = matches(&["-q", "--db", &db, "schedule", "-u", "https://a.test/"]);
    handle_schedule(subcommand(&m, "schedule")).unwrap();

    let m = matches(&["-q", "--db", &db, "init", "--force"]);
    handle_init(subcommand(&m, "init")).unwrap();

    let database = Database::new(Path::new(&db)).unwrap();
    assert!(database.list_schedules().unwrap().is_empty());
}

#[test]
fn test_schedule_requires_database() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_arg(temp_dir.path());

    let m = matches(&["--db", &db, "schedule", "-u", "https://a.test/"]);
    let result = handle_schedule(subcommand(&m, "schedule"));

    assert!(result.unwrap_err().contains("muncher init"));
}

#[test]
fn test_schedule_stores_config_and_title() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_arg(temp_dir.path());

    let m = matches(&["-q", "--db", &db, "init"]);
    handle_init(subcommand(&m, "init")).unwrap();

    let m = matches(&[
        "-q",
        "--db",
        &db,
        "schedule",
        "-u",
        "https://shop.test/",
        "--description",
        "checkout flow",
        "--silent",
    ]);
    let id = handle_schedule(subcommand(&m, "schedule")).unwrap();

    let database = Database::new(Path::new(&db)).unwrap();
    let schedule = database.get_schedule(id).unwrap();
    assert_eq!(schedule.title, "https://shop.test/");
    assert_eq!(schedule.description.as_deref(), Some("checkout flow"));
    assert!(database.load_config(id).unwrap().silent);

    let m = matches(&["--db", &db, "schedules"]);
    handle_schedules(subcommand(&m, "schedules")).unwrap();
}

#[test]
fn test_report_of_unscanned_schedule_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_arg(temp_dir.path());

    let m = matches(&["-q", "--db", &db, "init"]);
    handle_init(subcommand(&m, "init")).unwrap();
    let m = matches(&["-q", "--db", &db, "schedule", "-u", "https://a.test/", "--title", "a"]);
    let id = handle_schedule(subcommand(&m, "schedule")).unwrap();

    let output = temp_dir.path().join("report.json");
    let output_str = output.display().to_string();
    let id_str = id.to_string();
    let m = matches(&[
        "-q", "--db", &db, "report", "-i", &id_str, "-f", "json", "-o", &output_str,
    ]);
    handle_report(subcommand(&m, "report")).unwrap();

    let written = std::fs::read_to_string(&output).unwrap();
    assert!(written.contains("\"unique_cookies\": 0"));
    assert!(written.contains("\"title\": \"a\""));
}

#[test]
fn test_report_of_missing_schedule() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_arg(temp_dir.path());

    let m = matches(&["-q", "--db", &db, "init"]);
    handle_init(subcommand(&m, "init")).unwrap();

    let m = matches(&["--db", &db, "report", "-i", "41"]);
    assert!(handle_report(subcommand(&m, "report")).is_err());
}
