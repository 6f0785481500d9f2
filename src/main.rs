//! Passport Sync CLI entry point.

use clap::Parser;
use psync::cli::commands;
use psync::cli::{Cli, Commands};
use psync::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    init_tracing(cli.verbose, cli.quiet);

    // --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let db = cli.db.as_ref();
    let config = cli.config.as_ref();

    match &cli.command {
        Commands::Init { force } => commands::init::execute(db, config, *force, json),
        Commands::Version => commands::version::execute(json),

        // Sync
        Commands::Sync { full_history } => {
            commands::sync::execute_once(db, config, *full_history, json)
        }
        Commands::Run { full_history } => {
            commands::sync::execute_loop(db, config, *full_history, json)
        }
        Commands::Status { runs } => commands::status::execute(db, config, *runs, json),

        // Portal data
        Commands::Patient { command } => {
            commands::patient::execute(command, db, config, cli.actor.as_deref(), json)
        }
        Commands::Link { command } => {
            commands::link::execute(command, db, config, cli.actor.as_deref(), json)
        }
        Commands::Records {
            patient_id,
            record_type,
            limit,
        } => commands::records::execute(patient_id, *record_type, *limit, db, config, json),

        Commands::Completions { shell } => commands::completions::execute(shell),
    }
}
