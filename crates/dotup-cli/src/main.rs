use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use dotup_acquire::{Acquirer, ScriptInstaller};
use dotup_core::{
    default_storage_root, Config, InstallIdentity, InstallLayout, InstallMode, InstallScope,
    USER_OWNER,
};
use dotup_lock::{LockError, LockFile};
use dotup_tracker::{InstallRecord, InstallTracker, JsonStateStore, Slot, REGISTRY_LOCK_NAME};

#[derive(Parser, Debug)]
#[command(name = "dotup")]
#[command(about = ".NET install acquisition and tracking", long_about = None)]
struct Cli {
    /// Config file; defaults to dotup.toml under the storage root.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install (or reuse) a .NET install and register an owner for it.
    Acquire {
        #[arg(long)]
        version: String,
        #[arg(long, default_value = "runtime")]
        mode: String,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        global: bool,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Detach an owner; the install is deleted when its last owner leaves.
    Uninstall {
        #[arg(long)]
        version: String,
        #[arg(long, default_value = "runtime")]
        mode: String,
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        global: bool,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Remove all local installs and their records.
    UninstallAll,
    /// List tracked installs in both states.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage_root = default_storage_root()?;
    let config_path = cli
        .config
        .unwrap_or_else(|| storage_root.join("dotup.toml"));
    let config = Config::load(&config_path)?;

    let root = config.storage_root.clone().unwrap_or(storage_root);
    let layout = match &config.install_dir_name {
        Some(name) => InstallLayout::with_install_dir_name(&root, name.as_str()),
        None => InstallLayout::new(&root),
    };
    layout.ensure_base_dirs()?;

    let tracker = InstallTracker::new(
        JsonStateStore::new(layout.records_path()),
        layout.locks_dir(),
        Duration::from_millis(config.lock_retry_ms),
        Duration::from_millis(config.lock_timeout_ms),
    );
    let acquirer = Acquirer::new(
        tracker,
        ScriptInstaller::new(),
        layout.clone(),
        Duration::from_secs(config.install_timeout_secs),
    );

    match cli.command {
        Commands::Acquire {
            version,
            mode,
            arch,
            global,
            owner,
        } => {
            let identity = identity_from_args(&version, &mode, arch.as_deref(), global)?;
            let owner = Some(owner.unwrap_or_else(|| USER_OWNER.to_string()));

            let spinner = install_spinner(&identity);
            let result = acquirer.acquire(&identity, owner);
            spinner.finish_and_clear();

            let path = result?;
            println!("{}", path.display());
        }
        Commands::Uninstall {
            version,
            mode,
            arch,
            global,
            owner,
        } => {
            let identity = identity_from_args(&version, &mode, arch.as_deref(), global)?;
            let owner = Some(owner.unwrap_or_else(|| USER_OWNER.to_string()));
            acquirer.uninstall(&identity, &owner)?;
        }
        Commands::UninstallAll => {
            acquirer.uninstall_all()?;
        }
        Commands::Status => {
            let tracker = acquirer.tracker();
            // One non-blocking probe so a busy registry shows up in the
            // report; the scan below still waits its normal retry budget.
            match LockFile::try_acquire(&layout.locks_dir(), REGISTRY_LOCK_NAME) {
                Ok(guard) => drop(guard),
                Err(LockError::Contended { holder_pid, .. }) => match holder_pid {
                    Some(pid) => println!("registry: locked by pid {pid}"),
                    None => println!("registry: locked"),
                },
                Err(err) => return Err(err.into()),
            }
            tracker.scan_unrecorded_local_installs(&layout.installs_dir())?;
            print_slot("installed", &tracker.existing_installs(Slot::Installed, false)?);
            print_slot(
                "installing",
                &tracker.existing_installs(Slot::Installing, false)?,
            );
        }
    }

    Ok(())
}

fn identity_from_args(
    version: &str,
    mode: &str,
    arch: Option<&str>,
    global: bool,
) -> Result<InstallIdentity> {
    let mode = InstallMode::parse(mode)?;
    let scope = if global {
        InstallScope::Global
    } else {
        InstallScope::Local
    };
    Ok(InstallIdentity::new(version, arch, mode, scope))
}

fn install_spinner(identity: &InstallIdentity) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("acquiring {}", identity.key()));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_slot(label: &str, records: &[InstallRecord]) {
    if records.is_empty() {
        println!("{label}: none");
        return;
    }
    println!("{label}:");
    for record in records {
        let owners: Vec<&str> = record
            .owners
            .iter()
            .map(|owner| owner.as_deref().unwrap_or("(untracked)"))
            .collect();
        println!("- {} [{}]", record.key(), owners.join(", "));
    }
}
