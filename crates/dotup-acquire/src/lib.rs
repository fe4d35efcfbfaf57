mod acquire;
mod installer;

pub use acquire::{AcquireError, Acquirer};
pub use installer::{Installer, ScriptInstaller};
