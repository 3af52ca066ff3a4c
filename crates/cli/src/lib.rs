pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use leadbridge_core::config::{ConfigOverrides, LoadOptions, LogFormat, LoggingConfig};

use commands::records::RecordCommand;
use commands::CommandResult;

#[derive(Debug, Parser)]
#[command(
    name = "leadbridge",
    about = "Leadbridge operator CLI",
    long_about = "Inspect configuration, check CRM connectivity, and run record operations against the CRM.",
    after_help = "Examples:\n  leadbridge doctor --json\n  leadbridge config\n  leadbridge get-record --email jane@example.com\n  leadbridge update-record-status --status scheduled --record-id 00Q5g00000AbCdEAAA"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a leadbridge.toml file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override logging.level for this invocation")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config and exchange the refresh token for an access token")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(flatten)]
    Record(RecordCommand),
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                log_level: self.log_level.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let result = match cli.command {
        Command::Config => commands::config::run(options),
        Command::Doctor { json } => {
            with_runtime("doctor", |runtime| runtime.block_on(commands::doctor::run(options, json)))
        }
        Command::Record(command) => {
            let name = command.name();
            with_runtime(name, |runtime| runtime.block_on(commands::records::run(command, options)))
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn with_runtime(
    command: &str,
    work: impl FnOnce(&tokio::runtime::Runtime) -> CommandResult,
) -> CommandResult {
    match build_runtime() {
        Ok(runtime) => work(&runtime),
        Err(error) => CommandResult::failure(command, "runtime", format!("{error:#}"), 1),
    }
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Installs the global subscriber once; later calls are no-ops. Events go to
/// stderr so stdout stays a clean JSON payload.
pub fn init_logging(config: &LoggingConfig) {
    use tracing::Level;

    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
