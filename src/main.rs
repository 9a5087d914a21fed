// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use ota_updater::db::{self, Journal};
use ota_updater::device::{DEFAULT_PROPERTIES_PATH, DeviceProperties};
use ota_updater::engine::{CommandEngine, DEFAULT_ENGINE_PROGRAM, UpdateEngineClient};
use ota_updater::notify::{DEFAULT_MARKER_PATH, MarkerNotifier};
use ota_updater::package::{self, OpenPgpSignatureCheck, Verifier};
use ota_updater::schedule::{DEFAULT_INTERVAL, PeriodicSchedule};
use ota_updater::transfer::{DEFAULT_PACKAGE_PATH, HttpFetcher, PackageHandle, TransferManager};
use ota_updater::{Orchestrator, RunOutcome, power};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Default keyring holding the certificates packages are signed with
const DEFAULT_KEYRING_PATH: &str = "/etc/ota-updater/keyring.pgp";

#[derive(Parser)]
#[command(name = "ota-updater")]
#[command(author, version, about = "Over-the-air system update client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings shared by every command that performs update runs
#[derive(Args, Debug, Clone)]
struct UpdateArgs {
    /// Base URL of the update server
    #[arg(short, long, env = "OTA_UPDATER_URL")]
    url: String,

    /// Build property file describing the installed build
    #[arg(long, env = "OTA_UPDATER_PROPERTIES", default_value = DEFAULT_PROPERTIES_PATH)]
    properties: PathBuf,

    /// Where downloaded packages are written
    #[arg(long, env = "OTA_UPDATER_PACKAGE_PATH", default_value = DEFAULT_PACKAGE_PATH)]
    package_path: PathBuf,

    /// OpenPGP keyring trusted to sign packages
    #[arg(long, env = "OTA_UPDATER_KEYRING", default_value = DEFAULT_KEYRING_PATH)]
    keyring: PathBuf,

    /// Update engine front-end program
    #[arg(long, env = "OTA_UPDATER_ENGINE", default_value = DEFAULT_ENGINE_PROGRAM)]
    engine: PathBuf,

    /// Pending-reboot marker written after a successful update
    #[arg(long, env = "OTA_UPDATER_MARKER", default_value = DEFAULT_MARKER_PATH)]
    marker: PathBuf,

    /// Run journal database path
    #[arg(short, long, env = "OTA_UPDATER_DB_PATH", default_value = db::DEFAULT_DB_PATH)]
    db_path: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check for an update once and apply it
    Check {
        #[command(flatten)]
        args: UpdateArgs,
    },
    /// Check periodically until an update has been applied
    Daemon {
        #[command(flatten)]
        args: UpdateArgs,
        /// Seconds between checks
        #[arg(long, env = "OTA_UPDATER_INTERVAL", default_value_t = DEFAULT_INTERVAL.as_secs())]
        interval_secs: u64,
    },
    /// Show where the payload lives inside a local package
    Locate {
        /// Path to the package
        package_path: PathBuf,
        /// Print the layout as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the update run journal
    History {
        /// Run journal database path
        #[arg(short, long, env = "OTA_UPDATER_DB_PATH", default_value = db::DEFAULT_DB_PATH)]
        db_path: String,
        /// Number of runs to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        /// Print the runs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Wire the orchestrator from command-line settings
fn build_orchestrator(args: &UpdateArgs) -> Result<Orchestrator> {
    let device = DeviceProperties::load(&args.properties)
        .with_context(|| format!("Failed to read {}", args.properties.display()))?;
    info!(
        "Device {} at build {} ({})",
        device.device_id, device.build.incremental_id, device.build.timestamp_utc
    );

    let fetcher = HttpFetcher::new(&args.url)?;
    let transfer = TransferManager::new(Box::new(fetcher), &args.package_path);

    let signature = OpenPgpSignatureCheck::from_keyring(&args.keyring)
        .with_context(|| format!("Failed to load keyring {}", args.keyring.display()))?;
    let verifier = Verifier::new(Box::new(signature));

    let engine = UpdateEngineClient::new(Box::new(CommandEngine::new(&args.engine)));

    let mut orchestrator = Orchestrator::new(device, transfer, verifier, engine)
        .with_wake_lock(power::detect())
        .with_notifier(Box::new(MarkerNotifier::new(&args.marker)));

    match Journal::open(&args.db_path) {
        Ok(journal) => orchestrator = orchestrator.with_journal(journal),
        Err(e) => warn!("Run journal unavailable at {}: {}", args.db_path, e),
    }

    Ok(orchestrator)
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check { args }) => {
            let orchestrator = build_orchestrator(&args)?;

            match orchestrator.run()? {
                RunOutcome::UpToDate => println!("System is up to date."),
                RunOutcome::AlreadyRunning => println!("An update run is already in progress."),
                RunOutcome::RebootRequired(metadata) => {
                    println!(
                        "Installed build {} (timestamp {}).",
                        metadata.target_incremental_id, metadata.build_timestamp
                    );
                    println!("Reboot to finish the update.");
                }
            }
            Ok(())
        }
        Some(Commands::Daemon { args, interval_secs }) => {
            let interval = Duration::from_secs(interval_secs);
            let schedule = PeriodicSchedule::new(interval);
            let orchestrator =
                build_orchestrator(&args)?.with_scheduler(Box::new(schedule.clone()));

            info!("Checking for updates every {}s", interval.as_secs());
            schedule.run(|| match orchestrator.run() {
                Ok(outcome) => info!("Update check finished: {:?}", outcome),
                // Already logged with its stage; the next tick retries
                Err(_) => {}
            });

            println!("Update applied, reboot to finish.");
            Ok(())
        }
        Some(Commands::Locate { package_path, json }) => {
            let handle = PackageHandle::existing(&package_path)?;
            let layout = package::locate(&handle)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&layout)?);
            } else {
                println!("Package: {}", package_path.display());
                println!("  Size: {} bytes", handle.size());
                println!("  Payload offset: {}", layout.payload_offset);
                println!("  Payload size: {}", layout.payload_size);
                if layout.payload_properties.is_empty() {
                    println!("  No payload properties");
                } else {
                    println!("  Payload properties:");
                    for line in &layout.payload_properties {
                        println!("    {}", line);
                    }
                }
            }
            Ok(())
        }
        Some(Commands::History { db_path, limit, json }) => {
            let conn = db::open(&db_path)?;
            let runs = db::models::RunRecord::list_recent(&conn, limit)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No update runs recorded.");
            } else {
                println!("Update runs:");
                for run in &runs {
                    let target = run.target_incremental.as_deref().unwrap_or("-");
                    println!(
                        "  [{}] {} - {} at {} (target {})",
                        run.id.unwrap_or_default(),
                        run.started_at,
                        run.outcome.as_str(),
                        run.stage,
                        target
                    );
                    if let Some(error) = &run.error {
                        println!("      {}", error);
                    }
                }
                println!("\nTotal: {} run(s)", runs.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "ota-updater", &mut io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("ota-updater v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'ota-updater --help' for usage information");
            Ok(())
        }
    }
}
