use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use deltaup::action::Architecture;
use deltaup::apply;
use deltaup::checksum;
use deltaup::config::UpdateConfig;
use deltaup::create;
use deltaup::delta::{self, DiffOptions};
use deltaup::orchestrator::{ActionState, Orchestrator};
use deltaup::package::UpdatePackage;
use deltaup::platform::{SystemLauncher, UnsupportedRegistrar};

#[derive(Parser)]
#[command(name = "deltaup", about = "Delta-based self-update packager and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an update package by comparing old and new directories
    Create {
        /// Path to the old (installed) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the package file
        #[arg(long, short)]
        output: PathBuf,
        /// Block size used for delta matching
        #[arg(long, default_value_t = delta::encode::DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },
    /// Apply an update package to an installation directory
    Apply {
        /// Installation directory to update
        #[arg(long)]
        target: PathBuf,
        /// Path to the package file
        #[arg(long, short)]
        package: PathBuf,
        /// Where to keep backups while updating (default: <target>/.update-backup)
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        /// Host architecture override (any, 32, 64)
        #[arg(long)]
        arch: Option<Architecture>,
        /// Keep the backup directory after a successful update
        #[arg(long)]
        keep_backups: bool,
    },
    /// Encode a delta that turns SOURCE into TARGET
    Diff {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Reconstruct a file from an optional source and a delta
    Patch {
        /// Source file; omit when the delta was made against nothing
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        delta: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        /// Expected checksum of the source, hex
        #[arg(long, value_parser = parse_checksum)]
        source_checksum: u32,
        /// Expected checksum of the result, hex
        #[arg(long, value_parser = parse_checksum)]
        target_checksum: u32,
    },
    /// Print the checksum of each file
    Checksum {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_checksum(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid checksum '{s}': {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            block_size,
        } => {
            println!("Creating update package...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let options = DiffOptions {
                block_size,
                ..DiffOptions::default()
            };
            let start = Instant::now();
            let summary = create::create_package(&old, &new, &output, options).await?;
            let elapsed = start.elapsed();

            println!("\nPackage created successfully!");
            println!("  Files added: {}", summary.files_added);
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files replaced: {}", summary.files_replaced);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Files unchanged: {}", summary.files_unchanged);
            println!("  Payload bytes: {}", summary.payload_bytes);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            package,
            backup_dir,
            arch,
            keep_backups,
        } => {
            println!("Applying update...");
            println!("  Target: {}", target.display());
            println!("  Package: {}", package.display());

            let start = Instant::now();
            let package_path = package.clone();
            let package =
                tokio::task::spawn_blocking(move || UpdatePackage::read_from(&package_path))
                    .await??;

            let mut config = UpdateConfig::new(&target).keep_backups(keep_backups);
            if let Some(dir) = backup_dir {
                config = config.with_backup_dir(dir);
            }
            if let Some(arch) = arch {
                config = config.with_host(arch);
            }

            let orchestrator = Orchestrator::new(config, SystemLauncher, UnsupportedRegistrar);
            let cancel = orchestrator.cancel_token();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling update");
                    cancel.cancel();
                }
            });

            let report = tokio::task::spawn_blocking(move || {
                orchestrator.run(&package.actions, &package, |event| println!("{event}"))
            })
            .await?;
            interrupt.abort();
            let elapsed = start.elapsed();

            let count = |state: ActionState| report.actions.iter().filter(|a| a.state == state).count();
            println!("\nUpdate finished: {:?}", report.state);
            println!("  Applied: {}", count(ActionState::Committed));
            println!("  Skipped: {}", count(ActionState::Skipped));
            println!("  Rolled back: {}", count(ActionState::RolledBack));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            if let Some(dir) = &report.retained_backups {
                println!("  Backups kept at: {}", dir.display());
            }

            report.into_result().context("Update failed")?;
        }
        Commands::Diff {
            source,
            target,
            output,
        } => {
            let old = std::fs::read(&source)
                .with_context(|| format!("Failed to read source: {}", source.display()))?;
            let new = std::fs::read(&target)
                .with_context(|| format!("Failed to read target: {}", target.display()))?;

            let encoded = delta::encode(&old, &new, DiffOptions::default());
            std::fs::write(&output, &encoded)
                .with_context(|| format!("Failed to write delta: {}", output.display()))?;

            println!("Delta written: {} bytes", encoded.len());
            println!("  Source checksum: {:08x}", checksum::checksum(&old));
            println!("  Target checksum: {:08x}", checksum::checksum(&new));
        }
        Commands::Patch {
            source,
            delta,
            output,
            source_checksum,
            target_checksum,
        } => {
            let delta_bytes = std::fs::read(&delta)
                .with_context(|| format!("Failed to read delta: {}", delta.display()))?;
            let bytes = apply::apply_delta(
                source.as_deref(),
                &delta_bytes,
                source_checksum,
                target_checksum,
            )
            .context("Failed to apply delta")?;
            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write output: {}", output.display()))?;
            println!("Patched file written: {} bytes", bytes.len());
        }
        Commands::Checksum { files } => {
            for file in files {
                let sum = checksum::checksum_file(&file)
                    .with_context(|| format!("Failed to read file: {}", file.display()))?;
                println!("{sum:08x}  {}", file.display());
            }
        }
    }

    Ok(())
}
