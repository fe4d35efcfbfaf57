mod records;
mod store;
mod tracker;

pub use records::{InstallRecord, Owner, StoredRecord};
pub use store::{JsonStateStore, Slot, StateStore};
pub use tracker::{InstallTracker, REGISTRY_LOCK_NAME};
