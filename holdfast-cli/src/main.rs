//! Holdfast CLI
//!
//! Replicates filesystems flagged for backup to one or more backup pools.

mod config;
mod logging;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use holdfast_common::Error;
use holdfast_engine::{DryRunBackend, Orchestrator, RunSummary, StorageBackend, ZfsBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Exit status when none of the backup pools could be used
const EXIT_NO_BACKUP_POOLS: u8 = 1;
/// Exit status for configuration and internal errors
const EXIT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backup pools to replicate to
    #[arg(short, long = "backup", value_name = "POOL", num_args = 1..)]
    backup: Vec<String>,

    /// Pools to back up (default: every imported pool that is not a backup pool)
    #[arg(value_name = "POOL")]
    pools: Vec<String>,

    /// Destroy snapshots that are no longer needed
    #[arg(short = 'x', long)]
    destroy: bool,

    /// Log level: CRITICAL, ERROR, WARNING, INFO, DEBUG, TRACE or 3 to -1
    #[arg(short, long, value_name = "LEVEL", allow_hyphen_values = true)]
    log: Option<String>,

    /// Write the log to FILE instead of stderr
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Only log what would be done
    #[arg(short, long)]
    pretend: bool,

    /// Only use backup pools that sit on this single device
    #[arg(short, long, value_name = "DEVICE")]
    device: Option<String>,

    /// Snapshots to keep per filesystem on the backup pool with --destroy
    #[arg(long, value_name = "N")]
    keep: Option<usize>,

    /// Configuration file
    #[arg(long, value_name = "FILE", env = "HOLDFAST_CONFIG")]
    config: Option<PathBuf>,

    /// Print shell completions and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<clap_complete::Shell>,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            backup_pools: self.backup.clone(),
            source_pools: self.pools.clone(),
            destroy: self.destroy,
            dry_run: self.pretend,
            device: self.device.clone(),
            keep: self.keep,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        clap_complete::generate(shell, &mut Cli::command(), "holdfast", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let file = match config::FileConfig::load(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("holdfast: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let level = cli.log.as_deref().or(file.log.as_deref()).unwrap_or("WARNING");
    let log_file = cli.output.as_deref().or(file.log_file.as_deref());
    let _guard = match logging::LoggingConfig::new(level, log_file).and_then(|mut logging| {
        logging.json_format = file.log_json;
        logging.init()
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("holdfast: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match run(&cli, &file).await {
        Ok(summary) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Err(e) => match e.downcast_ref::<Error>() {
            Some(Error::NoBackupPools) => ExitCode::from(EXIT_NO_BACKUP_POOLS),
            _ => {
                error!("{:#}", e);
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}

async fn run(cli: &Cli, file: &config::FileConfig) -> Result<RunSummary> {
    let config = file.run_config(&cli.overrides());
    config.validate()?;

    let zfs: Arc<dyn StorageBackend> = Arc::new(ZfsBackend::new(file.commands.clone()));
    let backend: Arc<dyn StorageBackend> = if config.dry_run {
        Arc::new(DryRunBackend::new(zfs))
    } else {
        zfs
    };

    info!("Run {} for {}", config.stamp, config.backup_pools.join(" "));
    let summary = Orchestrator::new(backend, config).run().await?;
    Ok(summary)
}
