use serde::{Deserialize, Serialize};

use dotup_core::{parse_legacy_key, InstallIdentity};

/// A caller that depends on an install. `None` is the untracked/legacy owner
/// recorded when the real requester is unknown; the end user's own direct
/// requests use [`dotup_core::USER_OWNER`].
pub type Owner = Option<String>;

/// One persisted install and the callers depending on it. The owners list is
/// never empty while the record exists; the record is deleted instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRecord {
    pub install: InstallIdentity,
    pub owners: Vec<Owner>,
}

impl InstallRecord {
    pub fn new(install: InstallIdentity, owner: Owner) -> Self {
        Self {
            install,
            owners: vec![owner],
        }
    }

    pub fn key(&self) -> String {
        self.install.key()
    }
}

/// Persisted entry shape: either a full record or a bare key string written
/// by historical versions. Resolved into [`InstallRecord`] by [`upgrade`]
/// at the store boundary, never inspected ad hoc at call sites.
///
/// `Record` is listed first so objects deserialize as records and only bare
/// strings fall through to `Legacy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredRecord {
    Record(InstallRecord),
    Legacy(String),
}

impl StoredRecord {
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// Converts a legacy bare key into a full record owned by the untracked
    /// owner. Full records pass through unchanged, so upgrading twice is the
    /// same as upgrading once.
    pub fn upgrade(self) -> InstallRecord {
        match self {
            Self::Record(record) => record,
            Self::Legacy(key) => InstallRecord {
                install: parse_legacy_key(&key),
                owners: vec![None],
            },
        }
    }
}
