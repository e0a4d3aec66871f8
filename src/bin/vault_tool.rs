use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vaultsync::backup::IncrementalBackupOutcome;
use vaultsync::{RestoreOptions, RunOptions, Vault, VaultConfig};

#[derive(Parser)]
#[command(name = "vault-tool")]
#[command(about = "Developer tooling for directory-backed VaultSync stores")]
struct Cli {
    /// Directory holding the durable tiers.
    #[arg(long, default_value = "vault-data")]
    dir: PathBuf,
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schema version, pending migrations and compatibility switches.
    Status,
    Migrate {
        #[arg(long)]
        no_backup: bool,
        /// Retry even if the last run rolled back over the same data.
        #[arg(long)]
        force: bool,
    },
    Integrity,
    LegacyStatus,
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    Create {
        #[arg(long, default_value = "manual backup")]
        description: String,
    },
    Incremental {
        #[arg(long)]
        base: Option<String>,
    },
    List,
    Verify {
        id: String,
    },
    Restore {
        id: String,
        #[arg(long)]
        no_safety_backup: bool,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vaultsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let vault = Vault::open_dir(&cli.dir, config)
        .await
        .with_context(|| format!("Failed to open vault at '{}'", cli.dir.display()))?;
    vault.initialize().await.context("Failed to initialize vault")?;

    match cli.command {
        Command::Status => {
            let migration = vault.migrations().check_migration_status().await?;
            let compat = vault.compat().status().await?;
            print_json(&serde_json::json!({
                "migration": migration,
                "compat": compat,
                "storage": vault.facade().stats().await?,
            }))
        }
        Command::Migrate { no_backup, force } => {
            let options = RunOptions {
                create_backup: no_backup.then_some(false),
                force,
            };
            let run = vault
                .migrations()
                .run_pending_migrations(&options)
                .await
                .context("Migration failed")?;
            print_json(&run)
        }
        Command::Integrity => {
            let report = vault.migrations().perform_integrity_check().await?;
            print_json(&report)?;
            if report.valid {
                Ok(())
            } else {
                Err(anyhow!("{} integrity issue(s) found", report.issues.len()))
            }
        }
        Command::LegacyStatus => print_json(&vault.legacy().check_migration_status().await?),
        Command::Backup { action } => run_backup(&vault, action).await,
    }
}

async fn run_backup(vault: &Vault, action: BackupAction) -> Result<()> {
    let backups = vault.backups();
    match action {
        BackupAction::Create { description } => {
            print_json(&backups.create_full_backup(&description).await?)
        }
        BackupAction::Incremental { base } => {
            match backups.create_incremental_backup(base.as_deref()).await? {
                IncrementalBackupOutcome::Created(meta) => print_json(&meta),
                IncrementalBackupOutcome::NoChanges { base_id } => {
                    println!("No changes since backup {}", base_id);
                    Ok(())
                }
            }
        }
        BackupAction::List => print_json(&backups.list_backups().await?),
        BackupAction::Verify { id } => {
            let report = backups.verify_backup(&id).await?;
            print_json(&report)?;
            if report.valid {
                Ok(())
            } else {
                Err(anyhow!("Backup '{}' failed verification", id))
            }
        }
        BackupAction::Restore {
            id,
            no_safety_backup,
        } => {
            let options = RestoreOptions {
                safety_backup: !no_safety_backup,
            };
            let report = backups
                .restore_backup(&id, &options)
                .await
                .with_context(|| format!("Failed to restore backup '{}'", id))?;
            print_json(&report)
        }
        BackupAction::Delete { id } => {
            backups.delete_backup(&id).await?;
            println!("Deleted backup {}", id);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<VaultConfig> {
    match path {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => Ok(VaultConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
