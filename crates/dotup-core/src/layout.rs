use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::identity::InstallIdentity;

/// Environment variable overriding the install folder name under the
/// storage root.
pub const INSTALL_DIR_NAME_ENV: &str = "DOTUP_INSTALL_DIR_NAME";

const DEFAULT_INSTALL_DIR_NAME: &str = ".dotnet";

/// Directory layout under one storage root. All persisted state, locks, and
/// local installs live below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
    install_dir_name: String,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let install_dir_name = std::env::var(INSTALL_DIR_NAME_ENV)
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INSTALL_DIR_NAME.to_string());
        Self {
            root: root.into(),
            install_dir_name,
        }
    }

    pub fn with_install_dir_name(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            install_dir_name: name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent directory of all local installs: `<root>/<install_dir_name>`.
    pub fn installs_dir(&self) -> PathBuf {
        self.root.join(&self.install_dir_name)
    }

    /// Directory one install materializes under:
    /// `<root>/<install_dir_name>/<version>[~arch][~aspnetcore]`.
    pub fn install_dir(&self, identity: &InstallIdentity) -> PathBuf {
        self.installs_dir().join(identity.directory_name())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn records_path(&self) -> PathBuf {
        self.state_dir().join("records.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.installs_dir(),
            self.state_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Where OS-level installers place machine-wide .NET installs. Global
/// installs live here, never under the storage root.
pub fn global_install_root() -> PathBuf {
    if cfg!(windows) {
        let programs = std::env::var("ProgramFiles")
            .unwrap_or_else(|_| r"C:\Program Files".to_string());
        return PathBuf::from(programs).join("dotnet");
    }
    if cfg!(target_os = "macos") {
        return PathBuf::from("/usr/local/share/dotnet");
    }
    PathBuf::from("/usr/share/dotnet")
}

/// Default storage root when the config does not name one.
pub fn default_storage_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows storage root")?;
        return Ok(PathBuf::from(app_data).join("Dotup"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve storage root")?;
    Ok(PathBuf::from(home).join(".dotup"))
}
