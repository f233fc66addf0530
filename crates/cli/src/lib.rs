pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use factotum_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "factotum",
    about = "Factotum operator CLI",
    long_about = "Operate the execution governor: migrations, config inspection, dead-letter review, and crash recovery.",
    after_help = "Examples:\n  factotum doctor --json\n  factotum dead-letters list\n  factotum recover"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with secret redaction")]
    Config,
    #[command(about = "Validate config, policy rules, and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect or purge dead-lettered tasks")]
    DeadLetters(DeadLetterCommand),
    #[command(about = "Run the crash-recovery scan over pending intents and unresolved tasks")]
    Recover,
    #[command(about = "Resolve an ambiguous pending intent as committed or failed")]
    Resolve {
        task_id: String,
        attempt: u32,
        #[arg(long, conflicts_with = "failed", help = "The effect did happen")]
        committed: bool,
        #[arg(long, help = "The effect did not happen")]
        failed: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DeadLetterCommand {
    #[command(about = "List dead-letter entries with their attempt histories")]
    List,
    #[command(about = "Remove one dead-letter entry after review")]
    Purge { task_id: String },
}

pub fn run() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::DeadLetters(DeadLetterCommand::List) => commands::dead_letters::list(),
        Command::DeadLetters(DeadLetterCommand::Purge { task_id }) => {
            commands::dead_letters::purge(&task_id)
        }
        Command::Recover => commands::recover::run(),
        Command::Resolve { task_id, attempt, committed, failed } => {
            commands::recover::resolve(&task_id, attempt, committed, failed)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn init_logging() {
    use factotum_core::config::LogFormat::*;
    use tracing::Level;

    let config = AppConfig::load(LoadOptions::default()).unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}
