use colored::Colorize;
use muncher::commands::command_argument_builder;
use muncher::handlers::{
    handle_init, handle_report, handle_scan, handle_schedule, handle_schedules, init_logging,
    print_banner,
};
use muncher_scanner::LastResult;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    let log_file = init_logging(quiet);

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    let result = match chosen_command.subcommand() {
        None => return,
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("schedule", primary_command)) => handle_schedule(primary_command).map(|_| ()),
        Some(("scan", primary_command)) => match handle_scan(primary_command, &log_file).await {
            Ok(LastResult::Finished) => Ok(()),
            Ok(_) => {
                eprintln!("{} Scan aborted", "✗".red().bold());
                std::process::exit(1);
            }
            Err(e) => Err(e),
        },
        Some(("report", primary_command)) => handle_report(primary_command),
        Some(("schedules", primary_command)) => handle_schedules(primary_command),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}
