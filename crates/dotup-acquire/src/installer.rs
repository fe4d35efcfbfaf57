use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use dotup_core::{InstallError, InstallIdentity, InstallMode};

/// How an install is materialized on disk. The orchestrator only sees the
/// four-way [`InstallError`] classification; everything else about the
/// installer is opaque.
pub trait Installer {
    fn install(
        &self,
        identity: &InstallIdentity,
        target_dir: &Path,
        timeout: Duration,
    ) -> Result<(), InstallError>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shells out to the standard dotnet-install script.
#[derive(Debug, Default)]
pub struct ScriptInstaller {
    script_path: Option<PathBuf>,
}

impl ScriptInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an explicit script instead of the platform default on PATH.
    pub fn with_script(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: Some(script_path.into()),
        }
    }

    fn command(&self, identity: &InstallIdentity, target_dir: &Path) -> Command {
        let mut command = if cfg!(windows) {
            let script = self
                .script_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("dotnet-install.ps1"));
            let mut command = Command::new("powershell");
            command
                .arg("-NoProfile")
                .arg("-ExecutionPolicy")
                .arg("Bypass")
                .arg("-File")
                .arg(script);
            command
        } else {
            let script = self
                .script_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("dotnet-install.sh"));
            let mut command = Command::new("bash");
            command.arg(script);
            command
        };

        command
            .arg("--version")
            .arg(&identity.version)
            .arg("--install-dir")
            .arg(target_dir);
        if let Some(architecture) = &identity.architecture {
            command.arg("--architecture").arg(architecture);
        }
        match identity.mode {
            InstallMode::Sdk => {}
            InstallMode::Runtime => {
                command.arg("--runtime").arg("dotnet");
            }
            InstallMode::AspNetCore => {
                command.arg("--runtime").arg("aspnetcore");
            }
        }
        command
    }
}

impl Installer for ScriptInstaller {
    fn install(
        &self,
        identity: &InstallIdentity,
        target_dir: &Path,
        timeout: Duration,
    ) -> Result<(), InstallError> {
        let mut command = self.command(identity, target_dir);
        debug!(key = %identity.key(), "invoking install script");

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| InstallError::Failed(format!("install script failed to start: {err}")))?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(InstallError::Timeout(timeout.as_secs()));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(InstallError::Failed(format!(
                        "failed waiting for install script: {err}"
                    )));
                }
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if status.success() {
            return Ok(());
        }
        Err(classify_failure(&stderr, status.code()))
    }
}

/// Maps script stderr and exit status onto the failure taxonomy. The match is
/// on text the install script is known to emit; anything unrecognized is a
/// generic failure carrying the script's own words.
fn classify_failure(stderr: &str, code: Option<i32>) -> InstallError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("could not resolve host")
        || lowered.contains("couldn't connect to server")
        || lowered.contains("unable to connect")
        || lowered.contains("network is unreachable")
    {
        return InstallError::Offline;
    }
    if lowered.contains("execution policy") || lowered.contains("unauthorizedaccess") {
        return InstallError::ScriptPolicy;
    }

    let detail = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("install script exited with status {code}"),
            None => "install script was terminated by a signal".to_string(),
        });
    InstallError::Failed(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_classify_as_offline() {
        let err = classify_failure("curl: (6) Could not resolve host: builds.dotnet", Some(1));
        assert!(matches!(err, InstallError::Offline));
    }

    #[test]
    fn policy_failures_classify_as_script_policy() {
        let err = classify_failure(
            "File cannot be loaded because running scripts is disabled; check your execution policy settings.",
            Some(1),
        );
        assert!(matches!(err, InstallError::ScriptPolicy));
    }

    #[test]
    fn unrecognized_stderr_becomes_generic_failure_with_detail() {
        let err = classify_failure("  \nspecified version not found\n", Some(1));
        match err {
            InstallError::Failed(detail) => assert_eq!(detail, "specified version not found"),
            other => panic!("expected generic failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_stderr_reports_exit_status() {
        let err = classify_failure("", Some(3));
        match err {
            InstallError::Failed(detail) => {
                assert_eq!(detail, "install script exited with status 3");
            }
            other => panic!("expected generic failure, got {other:?}"),
        }
    }

    #[test]
    fn script_command_carries_mode_and_architecture() {
        let installer = ScriptInstaller::with_script("/opt/dotnet-install.sh");
        let identity = InstallIdentity::new(
            "8.0",
            Some("x64"),
            InstallMode::AspNetCore,
            dotup_core::InstallScope::Local,
        );
        let command = installer.command(&identity, Path::new("/tmp/target"));
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--version".to_string()));
        assert!(args.contains(&"8.0".to_string()));
        assert!(args.contains(&"--architecture".to_string()));
        assert!(args.contains(&"aspnetcore".to_string()));
    }
}
