use crate::CLAP_STYLING;
use clap::{arg, command};
use url::Url;

pub const DEFAULT_DB_PATH: &str = "~/.config/muncher/muncher.db";

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("muncher")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("muncher")
        .about("Crawls websites, harvests the cookies they set and catalogs them by purpose")
        .styles(CLAP_STYLING)
        .arg(
            arg!(-q --"quiet" "Suppress banner, spinners and non-essential output")
                .required(false)
                .global(true),
        )
        .arg(
            arg!(--"db" <PATH>)
                .required(false)
                .help("Location of the muncher database")
                .default_value(DEFAULT_DB_PATH)
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Initializes the muncher database on your filesystem")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Location of the database file (default: --db)"),
                )
                .arg(
                    arg!(-f - -"force")
                        .help(
                            "Forces the overwriting of any existing database at the specified \
                        location.",
                        )
                        .required(false),
                ),
        )
        .subcommand(
            command!("schedule")
                .about("Stores a scan configuration and a schedule for it. Prints the schedule id.")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("A seed URL to crawl from. Repeat for several seeds.")
                        .value_parser(clap::value_parser!(Url))
                        .action(clap::ArgAction::Append)
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of seed URLs")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .arg(
                    arg!(-d --"depth" <DEPTH>)
                        .required(false)
                        .help("Maximum link depth from the seeds")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("3"),
                )
                .arg(
                    arg!(--"domain-only")
                        .required(false)
                        .help("Only follow links on the seed hosts")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"delay" <MS>)
                        .required(false)
                        .help("Pause between requests of each crawl worker, in milliseconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("0"),
                )
                .arg(
                    arg!(--"user-agent" <UA>)
                        .required(false)
                        .help("User agent to present (default: a random desktop browser)"),
                )
                .arg(
                    arg!(--"silent")
                        .required(false)
                        .help("Keep no log file for scans of this schedule")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"title" <TITLE>)
                        .required(false)
                        .help("Schedule title (default: the first seed)"),
                )
                .arg(
                    arg!(--"description" <TEXT>)
                        .required(false)
                        .help("Free-form schedule description"),
                )
                .arg(
                    arg!(-t --"workers" <NUM_WORKERS>)
                        .required(false)
                        .help("The number of async crawl workers in the worker pool.")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    arg!(-s --"sessions" <NUM_SESSIONS>)
                        .required(false)
                        .help("The number of browser sessions harvesting cookies.")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    arg!(--"timeout" <SECONDS>)
                        .required(false)
                        .help("Page navigation timeout in seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("30"),
                )
                .arg(
                    arg!(--"cache-unknown")
                        .required(false)
                        .help("Remember cookies the knowledge source has no record of")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"logs-folder" <DIR>)
                        .required(false)
                        .help("Folder for scan log files")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .default_value("logs"),
                )
                .arg(
                    arg!(--"output-folder" <DIR>)
                        .required(false)
                        .help("Folder for CSV cookie reports written after each scan")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .default_value("output"),
                ),
        )
        .subcommand(
            command!("scan")
                .about("Runs the scan for a schedule: crawl, harvest cookies, catalog them")
                .arg(
                    arg!(-i --"id" <SCHEDULE_ID>)
                        .required(true)
                        .help("The schedule to scan")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(-e --"engine" <ENGINE>)
                        .required(false)
                        .help("Cookie harvesting engine: chrome (headless Chromium) or http")
                        .value_parser(["chrome", "http"])
                        .default_value("chrome"),
                ),
        )
        .subcommand(
            command!("report")
                .about("Rebuilds the cookie catalog of a scanned schedule and renders it")
                .arg(
                    arg!(-i --"id" <SCHEDULE_ID>)
                        .required(true)
                        .help("The schedule to report on")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, csv")
                        .value_parser(["text", "json", "csv"])
                        .default_value("text"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
        .subcommand(command!("schedules").about("Lists schedules and the result of their scan"))
}
