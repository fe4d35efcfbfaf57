use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use dotup_core::{parse_legacy_key, InstallIdentity, InstallScope};
use dotup_lock::with_lock;

use crate::records::{InstallRecord, Owner};
use crate::store::{Slot, StateStore};

/// Name of the machine-wide lock serializing all record mutation.
pub const REGISTRY_LOCK_NAME: &str = "install-records";

/// Orchestrates the persisted record store. Construct one per process and
/// pass it by reference; every consumer shares the same instance.
///
/// Every read-modify-write runs inside the registry lock unless the caller
/// states it already holds it (nested calls would otherwise deadlock against
/// themselves).
#[derive(Debug)]
pub struct InstallTracker<S: StateStore> {
    store: S,
    locks_dir: PathBuf,
    lock_retry: Duration,
    lock_timeout: Duration,
}

impl<S: StateStore> InstallTracker<S> {
    pub fn new(
        store: S,
        locks_dir: impl Into<PathBuf>,
        lock_retry: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks_dir: locks_dir.into(),
            lock_retry,
            lock_timeout,
        }
    }

    fn guarded<T>(
        &self,
        already_holding_lock: bool,
        action: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if already_holding_lock {
            action()
        } else {
            with_lock(
                &self.locks_dir,
                REGISTRY_LOCK_NAME,
                self.lock_retry,
                self.lock_timeout,
                action,
            )
        }
    }

    /// Returns the slot's records with any legacy entries upgraded. The
    /// upgraded form is persisted, so the conversion happens at most once
    /// per legacy entry.
    pub fn existing_installs(
        &self,
        slot: Slot,
        already_holding_lock: bool,
    ) -> Result<Vec<InstallRecord>> {
        self.guarded(already_holding_lock, || self.read_normalized(slot))
    }

    fn read_normalized(&self, slot: Slot) -> Result<Vec<InstallRecord>> {
        let stored = self.store.load(slot)?;
        let legacy_count = stored.iter().filter(|entry| entry.is_legacy()).count();
        let records: Vec<InstallRecord> = stored.into_iter().map(|entry| entry.upgrade()).collect();
        if legacy_count > 0 {
            debug!(
                slot = slot.as_str(),
                count = legacy_count,
                "upgraded legacy install records"
            );
            self.store.save(slot, &records)?;
        }
        Ok(records)
    }

    pub fn track_installing(&self, identity: &InstallIdentity, owner: Owner) -> Result<()> {
        self.guarded(false, || self.track_in(Slot::Installing, identity, owner))
    }

    pub fn track_installed(&self, identity: &InstallIdentity, owner: Owner) -> Result<()> {
        self.guarded(false, || self.track_in(Slot::Installed, identity, owner))
    }

    pub fn untrack_installing(&self, identity: &InstallIdentity, owner: &Owner) -> Result<()> {
        self.guarded(false, || self.untrack_in(Slot::Installing, identity, owner))
    }

    pub fn untrack_installed(&self, identity: &InstallIdentity, owner: &Owner) -> Result<()> {
        self.guarded(false, || self.untrack_in(Slot::Installed, identity, owner))
    }

    /// Moves one owner's claim on an install from `installing` to
    /// `installed` in a single lock hold. Other owners still mid-install for
    /// the same identity keep their `installing` entries; each caller's
    /// transition is independent.
    pub fn reclassify_installing_to_installed(
        &self,
        identity: &InstallIdentity,
        owner: Owner,
    ) -> Result<()> {
        self.guarded(false, || {
            self.untrack_in(Slot::Installing, identity, &owner)?;
            self.track_in(Slot::Installed, identity, owner)
        })
    }

    fn track_in(&self, slot: Slot, identity: &InstallIdentity, owner: Owner) -> Result<()> {
        let mut records = self.read_normalized(slot)?;
        let key = identity.key();
        match records.iter_mut().find(|record| record.key() == key) {
            Some(record) => {
                if record.owners.contains(&owner) {
                    return Ok(());
                }
                record.owners.push(owner);
            }
            None => records.push(InstallRecord::new(identity.clone(), owner)),
        }
        self.store.save(slot, &records)
    }

    fn untrack_in(&self, slot: Slot, identity: &InstallIdentity, owner: &Owner) -> Result<()> {
        let mut records = self.read_normalized(slot)?;
        let key = identity.key();

        let matches = records
            .iter()
            .filter(|record| record.key() == key)
            .count();
        if matches > 1 {
            warn!(
                slot = slot.as_str(),
                key = %key,
                count = matches,
                "duplicate install records for one key; operating on the first match"
            );
        }

        let Some(position) = records.iter().position(|record| record.key() == key) else {
            return Ok(());
        };
        let record = &mut records[position];
        let Some(owner_position) = record.owners.iter().position(|entry| entry == owner) else {
            return Ok(());
        };
        record.owners.remove(owner_position);
        if record.owners.is_empty() {
            records.remove(position);
        }
        self.store.save(slot, &records)
    }

    /// Clears all local-scope records from both slots. Global installs are
    /// managed by the OS-level installer lifecycle and are preserved.
    pub fn uninstall_all_records(&self) -> Result<()> {
        self.guarded(false, || {
            for slot in [Slot::Installing, Slot::Installed] {
                let mut records = self.read_normalized(slot)?;
                let before = records.len();
                records.retain(|record| matches!(record.install.scope, InstallScope::Global));
                if records.len() != before {
                    self.store.save(slot, &records)?;
                }
            }
            Ok(())
        })
    }

    /// Backfills `installed` records for directories present under the
    /// install root but absent from the store: installs made by an earlier
    /// tool version or bundled with the machine. Backfilled records carry
    /// the untracked owner.
    pub fn scan_unrecorded_local_installs(&self, install_root: &Path) -> Result<()> {
        self.guarded(false, || {
            let mut records = self.read_normalized(Slot::Installed)?;
            let mut changed = false;

            let entries = match fs::read_dir(install_root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to scan install root: {}", install_root.display())
                    });
                }
            };

            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                // Directory names follow the local key shape.
                let identity = parse_legacy_key(&name);
                let key = identity.key();
                if records.iter().any(|record| record.key() == key) {
                    continue;
                }
                debug!(key = %key, "backfilling unrecorded install");
                records.push(InstallRecord::new(identity, None));
                changed = true;
            }

            if changed {
                self.store.save(Slot::Installed, &records)?;
            }
            Ok(())
        })
    }
}
