use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use dotup_core::{global_install_root, InstallError, InstallIdentity, InstallLayout, InstallScope};
use dotup_lock::LockError;
use dotup_tracker::{InstallTracker, Owner, Slot, StateStore};

use crate::installer::Installer;

/// Installer failure tied to the install it was acquiring. The message prefix
/// is stable; callers match on it to present acquisition failures uniformly.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to acquire .NET install '{key}'")]
    Install {
        key: String,
        #[source]
        source: InstallError,
    },
    #[error("could not take the install-records lock")]
    Lock(#[from] LockError),
}

/// Lock failures come up through the tracker as flow errors; callers match
/// on the typed wrapper, so they are lifted back out of the chain here.
fn classify(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<LockError>() {
        Ok(lock) => AcquireError::Lock(lock).into(),
        Err(err) => err,
    }
}

/// Failure outcome handed to followers of a failed acquisition.
/// `anyhow::Error` cannot be cloned, so the typed cases are reconstructed
/// per waiter and anything else is carried as rendered text.
#[derive(Debug, Clone)]
enum SharedFailure {
    Install { key: String, source: InstallError },
    LockTimedOut { name: String, waited_ms: u64 },
    Other(String),
}

impl SharedFailure {
    fn of(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<AcquireError>() {
            Some(AcquireError::Install { key, source }) => Self::Install {
                key: key.clone(),
                source: source.clone(),
            },
            Some(AcquireError::Lock(LockError::TimedOut { name, waited_ms })) => {
                Self::LockTimedOut {
                    name: name.clone(),
                    waited_ms: *waited_ms,
                }
            }
            _ => Self::Other(format!("{err:#}")),
        }
    }

    fn into_error(self) -> anyhow::Error {
        match self {
            Self::Install { key, source } => AcquireError::Install { key, source }.into(),
            Self::LockTimedOut { name, waited_ms } => {
                AcquireError::Lock(LockError::TimedOut { name, waited_ms }).into()
            }
            Self::Other(message) => anyhow::anyhow!("{message}"),
        }
    }
}

#[derive(Debug)]
enum PendingState {
    InFlight,
    Done(PathBuf),
    Failed(SharedFailure),
}

#[derive(Debug)]
struct PendingSlot {
    state: Mutex<PendingState>,
    ready: Condvar,
}

impl PendingSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::InFlight),
            ready: Condvar::new(),
        }
    }

    fn resolve(&self, state: PendingState) {
        *lock_ignoring_poison(&self.state) = state;
        self.ready.notify_all();
    }
}

// A poisoned mutex means another caller panicked; the guarded data is a
// plain state value that stays valid, so the poison flag carries no
// information here.
fn lock_ignoring_poison<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Front door for obtaining installs. Deduplicates concurrent requests for
/// the same key within the process: the first caller drives the install, any
/// caller arriving while it is in flight blocks on the shared slot and
/// receives the same outcome.
///
/// Construct one per process and share it by reference; a second instance
/// would defeat the deduplication.
pub struct Acquirer<S: StateStore, I: Installer> {
    tracker: InstallTracker<S>,
    installer: I,
    layout: InstallLayout,
    install_timeout: Duration,
    pending: Mutex<HashMap<String, Arc<PendingSlot>>>,
}

impl<S: StateStore, I: Installer> Acquirer<S, I> {
    pub fn new(
        tracker: InstallTracker<S>,
        installer: I,
        layout: InstallLayout,
        install_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            installer,
            layout,
            install_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &InstallTracker<S> {
        &self.tracker
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    /// Returns the directory of a usable install for `identity`, installing
    /// it first if needed, and registers `owner` against it.
    pub fn acquire(&self, identity: &InstallIdentity, owner: Owner) -> Result<PathBuf> {
        let key = identity.key();

        // Global installs are delivered by the OS installer and never
        // materialize under the storage root; only ownership is recorded.
        // Driving the script installer here would collide with the local
        // install directory for the same version.
        if matches!(identity.scope, InstallScope::Global) {
            self.tracker.track_installed(identity, owner)?;
            return Ok(global_install_root());
        }

        // Check-and-register is atomic under the table mutex: of any number
        // of concurrent callers, exactly one finds no slot and installs.
        let slot = {
            let mut pending = lock_ignoring_poison(&self.pending);
            match pending.get(&key) {
                Some(slot) => Some(Arc::clone(slot)),
                None => {
                    pending.insert(key.clone(), Arc::new(PendingSlot::new()));
                    None
                }
            }
        };

        if let Some(slot) = slot {
            return self.await_outcome(&key, &slot, identity, owner);
        }

        match self.acquire_as_leader(identity, owner) {
            Ok(path) => {
                // The resolved slot stays in the table; later callers get
                // the path without re-checking disk.
                let pending = lock_ignoring_poison(&self.pending);
                if let Some(slot) = pending.get(&key) {
                    slot.resolve(PendingState::Done(path.clone()));
                }
                Ok(path)
            }
            Err(err) => {
                // Clear the entry so a later call can retry. The durable
                // `installing` record is left in place for diagnostics and
                // partial-install recovery.
                let err = classify(err);
                let mut pending = lock_ignoring_poison(&self.pending);
                if let Some(slot) = pending.remove(&key) {
                    slot.resolve(PendingState::Failed(SharedFailure::of(&err)));
                }
                Err(err)
            }
        }
    }

    fn await_outcome(
        &self,
        key: &str,
        slot: &PendingSlot,
        identity: &InstallIdentity,
        owner: Owner,
    ) -> Result<PathBuf> {
        debug!(key, "joining in-flight acquisition");
        let mut state = lock_ignoring_poison(&slot.state);
        while matches!(*state, PendingState::InFlight) {
            state = slot
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*state {
            PendingState::Done(path) => {
                let path = path.clone();
                drop(state);
                self.tracker.track_installed(identity, owner)?;
                Ok(path)
            }
            PendingState::Failed(failure) => Err(failure.clone().into_error()),
            PendingState::InFlight => unreachable!("loop exits only on a resolved state"),
        }
    }

    fn acquire_as_leader(&self, identity: &InstallIdentity, owner: Owner) -> Result<PathBuf> {
        let key = identity.key();
        let target = self.layout.install_dir(identity);

        let installed = self.tracker.existing_installs(Slot::Installed, false)?;
        if installed.iter().any(|record| record.key() == key) {
            if target.is_dir() {
                self.tracker.track_installed(identity, owner)?;
                return Ok(target);
            }
            // Recorded but gone from disk (deleted out of band); reinstall.
            warn!(key = %key, "installed record has no directory on disk; reinstalling");
        }

        // A leftover `installing` record with no in-flight work means a
        // prior process died mid-install. Whatever it left behind is not
        // trustworthy; remove it and install from scratch.
        let installing = self.tracker.existing_installs(Slot::Installing, false)?;
        if installing.iter().any(|record| record.key() == key) && target.exists() {
            warn!(key = %key, "removing partial install left by an interrupted acquisition");
            fs::remove_dir_all(&target).with_context(|| {
                format!("failed to remove partial install: {}", target.display())
            })?;
        }

        self.tracker.track_installing(identity, owner.clone())?;

        // The installer runs outside the registry lock; installs are slow
        // and must not serialize against record reads in other processes.
        self.installer
            .install(identity, &target, self.install_timeout)
            .map_err(|source| AcquireError::Install {
                key: key.clone(),
                source,
            })?;

        self.tracker
            .reclassify_installing_to_installed(identity, owner)?;
        debug!(key = %key, path = %target.display(), "install acquired");
        Ok(target)
    }

    /// Detaches `owner` from an installed record. When the last owner
    /// detaches, the record is deleted and a local install's directory is
    /// removed from disk. Global installs are left on disk for the OS
    /// installer lifecycle to manage.
    pub fn uninstall(&self, identity: &InstallIdentity, owner: &Owner) -> Result<()> {
        let key = identity.key();
        self.tracker.untrack_installed(identity, owner)?;

        let remaining = self.tracker.existing_installs(Slot::Installed, false)?;
        if remaining.iter().any(|record| record.key() == key) {
            return Ok(());
        }

        // A cached Done slot would hand out the path we are about to delete.
        lock_ignoring_poison(&self.pending).remove(&key);

        if matches!(identity.scope, InstallScope::Global) {
            debug!(key = %key, "global install untracked; directory left to the OS installer");
            return Ok(());
        }

        remove_install_dir(&self.layout.install_dir(identity))
    }

    /// Removes every local install and its record regardless of owners.
    /// Global records and directories are preserved.
    pub fn uninstall_all(&self) -> Result<()> {
        let installed = self.tracker.existing_installs(Slot::Installed, false)?;
        self.tracker.uninstall_all_records()?;
        lock_ignoring_poison(&self.pending).clear();

        for record in installed {
            if matches!(record.install.scope, InstallScope::Global) {
                continue;
            }
            remove_install_dir(&self.layout.install_dir(&record.install))?;
        }
        Ok(())
    }
}

fn remove_install_dir(target: &std::path::Path) -> Result<()> {
    match fs::remove_dir_all(target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove install: {}", target.display()))
        }
    }
}
