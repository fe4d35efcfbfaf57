mod config;
mod error;
mod identity;
mod layout;

pub use config::Config;
pub use error::InstallError;
pub use identity::{
    native_architecture, parse_legacy_key, InstallIdentity, InstallMode, InstallScope,
    ASPNETCORE_SUFFIX, GLOBAL_MARKER, SEGMENT_SEPARATOR, USER_OWNER,
};
pub use layout::{default_storage_root, global_install_root, InstallLayout, INSTALL_DIR_NAME_ENV};

#[cfg(test)]
mod tests;
