use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dep_patch::config::DEFAULT_HIDDEN_DIR;
use dep_patch::report::Envelope;
use dep_patch::{
    apply_patches, cleanup_backups, get_patch, list_patches, remove_patch, ApplyOptions, CleanupOptions, Config,
    DriftPolicy, FsLedger, NodeModulesResolver, PatchError,
};

#[derive(Parser)]
#[command(name = "dep-patch", about = "Apply, inspect, retrieve and revert dependency patches")]
struct Cli {
    /// Project root
    #[arg(long, env = "DEP_PATCH_CWD", default_value = ".", global = true)]
    cwd: PathBuf,
    /// Name of the hidden patch directory under the project root
    #[arg(long, env = "DEP_PATCH_DIR", default_value = DEFAULT_HIDDEN_DIR, global = true)]
    dir: String,
    /// Re-hash every blob against its name when reading it
    #[arg(long, global = true)]
    verify_blobs: bool,
    /// Log more (repeatable); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the patches in the manifest
    List,
    /// Copy the patched files of one patch into a directory
    Get {
        purl: String,
        /// Destination directory (default: patches/<purl>)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Apply patches to installed packages
    Apply {
        /// Purls to apply (default: every installed package with a patch)
        purls: Vec<String>,
        /// Check everything, write nothing
        #[arg(long)]
        dry_run: bool,
        /// Patch files whose content matches neither the original nor the patched hash
        #[arg(long)]
        force: bool,
        /// Exit non-zero if any purl failed
        #[arg(long)]
        strict: bool,
    },
    /// Revert an applied patch from its backup
    Rm { purl: String },
    /// Delete backups of patches no longer in the manifest
    Cleanup {
        /// Delete every backup, including those of patches still in the manifest
        #[arg(long, conflicts_with = "uuid")]
        all: bool,
        /// Delete one specific backup
        #[arg(long)]
        uuid: Option<Uuid>,
        #[arg(long)]
        dry_run: bool,
    },
}

impl Commands {
    /// Prefix for error messages of this command.
    fn operation(&self) -> &'static str {
        match self {
            Commands::List => "Failed to list patches",
            Commands::Get { .. } => "Failed to get patch",
            Commands::Apply { .. } => "Failed to apply patches",
            Commands::Rm { .. } => "Failed to remove patch",
            Commands::Cleanup { .. } => "Failed to clean up backups",
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn render<T: Serialize>(operation: &str, result: Result<T, PatchError>) -> anyhow::Result<(String, bool)> {
    let envelope = Envelope::from_result(operation, result);
    let ok = envelope.is_success();
    Ok((envelope.to_json().context("Failed to serialize result")?, ok))
}

fn run(command: Commands, mut config: Config, cancel: Arc<AtomicBool>) -> anyhow::Result<(String, bool)> {
    let ledger = FsLedger::new(&config);
    let operation = command.operation();
    match command {
        Commands::List => render(operation, list_patches(&config)),
        Commands::Get { purl, out } => render(operation, get_patch(&config, &purl, out.as_deref())),
        Commands::Apply {
            purls,
            dry_run,
            force,
            strict,
        } => {
            if force {
                config.drift_policy = DriftPolicy::Overwrite;
            }
            let options = ApplyOptions {
                purls,
                dry_run,
                cancel: Some(cancel),
            };
            let result = apply_patches(&config, &NodeModulesResolver, &ledger, &options);
            let strict_failed = matches!(&result, Ok(report) if strict && report.failures() > 0);
            let (json, ok) = render(operation, result)?;
            Ok((json, ok && !strict_failed))
        }
        Commands::Rm { purl } => render(operation, remove_patch(&config, &ledger, &purl)),
        Commands::Cleanup { all, uuid, dry_run } => {
            let options = CleanupOptions {
                all,
                uuid,
                dry_run,
                cancel: Some(cancel),
            };
            render(operation, cleanup_backups(&config, &ledger, &options))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = match cli.cwd.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            debug!(cwd = %cli.cwd.display(), error = %e, "project root not usable");
            let missing = PatchError::NotFound {
                what: "Project root",
                path: cli.cwd.clone(),
            };
            let (json, _) = render::<()>(cli.command.operation(), Err(missing))?;
            println!("{}", json);
            std::process::exit(1);
        }
    };
    let mut config = Config::new(root);
    config.hidden_dir = cli.dir;
    config.verify_blobs = cli.verify_blobs;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let start = Instant::now();
    let command = cli.command;
    let (json, ok) = tokio::task::spawn_blocking(move || run(command, config, cancel)).await??;
    debug!(elapsed_secs = start.elapsed().as_secs_f64(), "done");

    println!("{}", json);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
