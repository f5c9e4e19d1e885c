//! Gantry CLI: train, resume and inspect adversarial training runs.

mod commands;
mod progress;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Gantry: resumable GAN training
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train (or resume training) from a configuration document
    Train {
        /// Configuration file (.yaml, .toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// Ignore existing checkpoints and start fresh
        #[arg(long)]
        no_resume: bool,
    },
    /// List the checkpoints of the run a configuration maps to
    Checkpoints {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the run fingerprint and checkpoint folder for a configuration
    Fingerprint {
        #[arg(short, long)]
        config: PathBuf,

        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
}

/// Stderr filter for the given verbosity flags.
fn stderr_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: human-readable stderr, plus a JSON
/// `experiment.log` inside `log_dir` when given.
///
/// The returned guard must live until the process exits so buffered log
/// lines are flushed.
pub(crate) fn init_tracing(
    verbose: u8,
    quiet: bool,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(stderr_filter(verbose, quiet)));

    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, "experiment.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train { config, no_resume } => {
            commands::train(&config, no_resume, cli.verbose, cli.quiet)
        }
        Commands::Checkpoints { config } => {
            let _guard = init_tracing(cli.verbose, cli.quiet, None);
            commands::checkpoints(&config)
        }
        Commands::Fingerprint { config, json } => {
            let _guard = init_tracing(cli.verbose, cli.quiet, None);
            commands::fingerprint(&config, json)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train() {
        let cli = Cli::parse_from(["gantry", "train", "--config", "run.yaml", "--no-resume", "-v"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Train { config, no_resume } => {
                assert_eq!(config, PathBuf::from("run.yaml"));
                assert!(no_resume);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_stderr_filter() {
        assert_eq!(stderr_filter(0, true), "error");
        assert_eq!(stderr_filter(0, false), "info");
        assert_eq!(stderr_filter(1, false), "debug");
        assert_eq!(stderr_filter(3, false), "trace");
    }
}
