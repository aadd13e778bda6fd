//! Site Deploy - Main entry point
//!
//! Observer events are written to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use site_deploy::config::Config;
use site_deploy::executor::{self, DeployJob};
use site_deploy::manifest::scan;
use site_deploy::secrets::KeyringStore;
use site_deploy::transfer::{DeployEvent, EventSink, TerminalEvent};
use site_deploy::{shutdown, utils, DeployError};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "site-deploy.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy the output directory to the remote host
    Deploy {
        /// Rescan the output directory even if a manifest exists
        #[arg(long)]
        rescan: bool,
    },

    /// Check that the remote root is writable
    Test,

    /// Scan the output directory and write its manifest
    Manifest,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            utils::logger::init(args.log_level.as_deref().unwrap_or("info"))?;
            return match args.command {
                Command::Manifest => Err(e).with_context(|| format!("Failed to load {}", args.config.display())),
                _ => Ok(report_failure(&e)),
            };
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("site-deploy v{} (site: {})", env!("CARGO_PKG_VERSION"), config.site.name);

    match args.command {
        Command::Deploy { rescan } => Ok(deploy(&config, rescan).await),
        Command::Test => Ok(test(&config).await),
        Command::Manifest => write_manifest(&config),
    }
}

async fn deploy(config: &Config, rescan: bool) -> ExitCode {
    let (_, credentials) = match config.target(&KeyringStore) {
        Ok(target) => target,
        Err(e) => return report_failure(&e),
    };
    let job = DeployJob::from_config(config, credentials, rescan);
    let transport = config.transport(config.connect_timeout());

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown::cancel_on_signal(cancel.clone()));

    let (events, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let terminal = executor::run_deployment(job, transport, events, cancel.clone()).await;

    // Every sender is gone once the run returns, so the printer drains and exits.
    if let Err(e) = printer.await {
        tracing::error!("Event printer task panicked: {}", e);
    }
    cancel.cancel();
    let _ = signals.await;

    exit_code(&terminal)
}

async fn test(config: &Config) -> ExitCode {
    let (endpoint, credentials) = match config.target(&KeyringStore) {
        Ok(target) => target,
        Err(e) => return report_failure(&e),
    };
    let transport = config.transport(config.test_timeout());

    let terminal = executor::test_connectivity(&endpoint, &credentials, transport, config.test_timeout()).await;
    print_event(&DeployEvent::Finished(terminal.clone()));

    exit_code(&terminal)
}

/// Report a failure that happened before the engine could start.
fn report_failure(error: &DeployError) -> ExitCode {
    tracing::error!("{}", error);
    let terminal = TerminalEvent::from(error);
    print_event(&DeployEvent::Finished(terminal.clone()));
    exit_code(&terminal)
}

fn write_manifest(config: &Config) -> Result<ExitCode> {
    let options = config.scan_options();
    let root = &config.site.output_dir;
    let manifest = scan::scan_directory(root, &options)?;
    let path = scan::write_manifest(root, &manifest, &options)?;

    tracing::info!(
        "Wrote {} ({} entries, {} files)",
        path.display(),
        manifest.len(),
        manifest.file_count()
    );
    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &DeployEvent) {
    match serde_json::to_string(event) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
        Err(e) => tracing::error!("Failed to serialize event: {}", e),
    }
}

fn exit_code(terminal: &TerminalEvent) -> ExitCode {
    if terminal.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
