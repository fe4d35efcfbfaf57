use thiserror::Error;

/// Failure categories surfaced by an installer invocation. The orchestrator
/// never interprets installer output beyond this classification.
#[derive(Debug, Clone, Error)]
pub enum InstallError {
    #[error("no network connection while downloading the install")]
    Offline,
    #[error("installer timed out after {0} seconds")]
    Timeout(u64),
    #[error("script execution was blocked by system policy")]
    ScriptPolicy,
    #[error("{0}")]
    Failed(String),
}
