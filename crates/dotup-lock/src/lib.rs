use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const SENTINEL_VERSION: u32 = 1;

/// Lock names are embedded in the lock file name; keep the result inside OS
/// path limits even for long storage-root-derived names.
const MAX_LOCK_NAME_LEN: usize = 80;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for lock '{name}' after {waited_ms} ms")]
    TimedOut { name: String, waited_ms: u64 },
    #[error("lock '{name}' is held by another process (pid {holder_pid:?})")]
    Contended {
        name: String,
        holder_pid: Option<u32>,
    },
    #[error("lock '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// What the probe learned about the current holder of a contended lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolderState {
    /// A process is alive and holding the lock; back off and retry.
    Live { pid: u32 },
    /// The recorded holder is gone; the sentinel can be removed.
    Stale { pid: Option<u32> },
    /// The sentinel exists but cannot be read or parsed. Usually a
    /// half-written sentinel from a holder mid-acquisition; stale only if it
    /// stays unreadable across a retry window.
    Unknown,
}

/// Identity of a lock holder, written into the sentinel file at acquisition.
#[derive(Debug, Serialize, Deserialize)]
struct Sentinel {
    version: u32,
    pid: u32,
    hostname: String,
    created_at_ms: u64,
}

impl Sentinel {
    fn current() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            version: SENTINEL_VERSION,
            pid: std::process::id(),
            hostname: hostname(),
            created_at_ms: now,
        }
    }
}

/// Exclusive cross-process lock held for the lifetime of this value.
///
/// The sentinel file is claimed atomically with `create_new`, so two
/// processes (or two threads of one process) can never both hold the same
/// lock. A holder that dies leaves its sentinel behind; the next acquirer
/// detects the dead pid and recovers without waiting out the timeout.
#[derive(Debug)]
pub struct LockFile {
    name: String,
    path: PathBuf,
}

impl LockFile {
    /// Acquires the named lock, retrying every `retry_delay` until `timeout`
    /// has elapsed. Never returns successfully without holding the lock.
    pub fn acquire(
        locks_dir: &Path,
        name: &str,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let name = sanitized_lock_name(name);
        fs::create_dir_all(locks_dir).map_err(|source| LockError::Io {
            name: name.clone(),
            source,
        })?;
        let path = locks_dir.join(format!("{name}.lock"));

        let started = Instant::now();
        let mut unknown_seen = false;
        loop {
            match try_claim(&path) {
                Ok(true) => {
                    debug!(lock = %name, "lock acquired");
                    return Ok(Self { name, path });
                }
                Ok(false) => {}
                Err(source) => return Err(LockError::Io { name, source }),
            }

            match probe_holder(&path) {
                HolderState::Stale { pid } => {
                    warn!(lock = %name, holder_pid = ?pid, "recovering stale lock sentinel");
                    match remove_sentinel(&path) {
                        Ok(()) => continue,
                        // Some platforms retain partial ownership of the
                        // holder's file; fall back to the retry budget.
                        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                            debug!(lock = %name, "stale sentinel not removable; retrying");
                        }
                        Err(source) => return Err(LockError::Io { name, source }),
                    }
                }
                HolderState::Live { .. } => {}
                HolderState::Unknown => {
                    if unknown_seen {
                        warn!(lock = %name, "recovering unreadable lock sentinel");
                        match remove_sentinel(&path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {}
                            Err(source) => return Err(LockError::Io { name, source }),
                        }
                    }
                    unknown_seen = true;
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::TimedOut {
                    name,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(retry_delay.min(timeout - waited));
        }
    }

    /// Single non-blocking attempt. A held lock is reported as `Contended`
    /// with the holder's pid when the sentinel names one; a stale sentinel
    /// is recovered before the attempt fails.
    pub fn try_acquire(locks_dir: &Path, name: &str) -> Result<Self, LockError> {
        let name = sanitized_lock_name(name);
        fs::create_dir_all(locks_dir).map_err(|source| LockError::Io {
            name: name.clone(),
            source,
        })?;
        let path = locks_dir.join(format!("{name}.lock"));

        for _ in 0..2 {
            match try_claim(&path) {
                Ok(true) => {
                    debug!(lock = %name, "lock acquired");
                    return Ok(Self { name, path });
                }
                Ok(false) => {}
                Err(source) => return Err(LockError::Io { name, source }),
            }

            match probe_holder(&path) {
                HolderState::Stale { pid } => {
                    warn!(lock = %name, holder_pid = ?pid, "recovering stale lock sentinel");
                    match remove_sentinel(&path) {
                        Ok(()) => continue,
                        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                            return Err(LockError::Contended {
                                name,
                                holder_pid: pid,
                            });
                        }
                        Err(source) => return Err(LockError::Io { name, source }),
                    }
                }
                HolderState::Live { pid } => {
                    return Err(LockError::Contended {
                        name,
                        holder_pid: Some(pid),
                    });
                }
                HolderState::Unknown => {
                    return Err(LockError::Contended {
                        name,
                        holder_pid: None,
                    });
                }
            }
        }

        Err(LockError::Contended {
            name,
            holder_pid: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = remove_sentinel(&self.path) {
            warn!(lock = %self.name, error = %err, "failed to release lock sentinel");
        } else {
            debug!(lock = %self.name, "lock released");
        }
    }
}

/// Runs `action` while holding the named lock and returns its result.
pub fn with_lock<T>(
    locks_dir: &Path,
    name: &str,
    retry_delay: Duration,
    timeout: Duration,
    action: impl FnOnce() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let guard = LockFile::acquire(locks_dir, name, retry_delay, timeout)?;
    let result = action();
    drop(guard);
    result
}

/// Attempts to atomically claim the sentinel file. `Ok(false)` means another
/// holder exists.
fn try_claim(path: &Path) -> io::Result<bool> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    };

    let payload = serde_json::to_string_pretty(&Sentinel::current())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    file.write_all(payload.as_bytes())?;
    file.flush()?;
    Ok(true)
}

/// Probes the holder recorded in an existing sentinel.
pub fn probe_holder(path: &Path) -> HolderState {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        // The holder released between our claim attempt and the probe.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return HolderState::Stale { pid: None },
        Err(_) => return HolderState::Unknown,
    };

    let sentinel = match serde_json::from_str::<Sentinel>(&raw) {
        Ok(sentinel) => sentinel,
        Err(_) => return HolderState::Unknown,
    };

    // Cross-host sentinels cannot be probed; assume the holder is alive.
    if sentinel.hostname != hostname() {
        return HolderState::Live { pid: sentinel.pid };
    }
    if is_pid_alive(sentinel.pid) {
        HolderState::Live { pid: sentinel.pid }
    } else {
        HolderState::Stale {
            pid: Some(sentinel.pid),
        }
    }
}

fn remove_sentinel(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn sanitized_lock_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(MAX_LOCK_NAME_LEN);
    sanitized
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(target_os = "linux")]
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// No safe liveness probe elsewhere; treat holders as live and rely on the
// caller's retry budget.
#[cfg(not(target_os = "linux"))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_locks_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "dotup-lock-tests-{}-{}",
            std::process::id(),
            nanos
        ));
        fs::create_dir_all(&dir).expect("must create locks dir");
        dir
    }

    fn short(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn acquire_creates_and_drop_removes_sentinel() {
        let dir = test_locks_dir();
        let sentinel_path = dir.join("registry.lock");

        {
            let guard = LockFile::acquire(&dir, "registry", short(10), short(500))
                .expect("must acquire lock");
            assert!(sentinel_path.exists());
            assert_eq!(guard.path(), sentinel_path);
        }
        assert!(!sentinel_path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reacquire_succeeds_after_release() {
        let dir = test_locks_dir();

        drop(LockFile::acquire(&dir, "registry", short(10), short(500)).expect("first acquire"));
        LockFile::acquire(&dir, "registry", short(10), short(500)).expect("second acquire");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn contended_acquire_times_out_against_live_holder() {
        let dir = test_locks_dir();

        let _guard = LockFile::acquire(&dir, "registry", short(10), short(500))
            .expect("holder must acquire");
        let err = LockFile::acquire(&dir, "registry", short(10), short(100))
            .expect_err("second acquire must time out");
        match err {
            LockError::TimedOut { name, waited_ms } => {
                assert_eq!(name, "registry");
                assert!(waited_ms >= 100);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn contended_acquire_succeeds_once_holder_releases() {
        let dir = test_locks_dir();
        let holder = LockFile::acquire(&dir, "registry", short(5), short(500))
            .expect("holder must acquire");

        thread::scope(|scope| {
            let waiter = scope.spawn(|| LockFile::acquire(&dir, "registry", short(5), short(2000)));
            thread::sleep(short(50));
            drop(holder);
            waiter
                .join()
                .expect("waiter thread")
                .expect("waiter must acquire after release");
        });

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_holder_sentinel_is_recovered_without_full_timeout() {
        let dir = test_locks_dir();
        let path = dir.join("registry.lock");

        // Unlikely to be a live pid.
        let dead = Sentinel {
            version: SENTINEL_VERSION,
            pid: 999_999_999,
            hostname: hostname(),
            created_at_ms: 0,
        };
        fs::write(&path, serde_json::to_string(&dead).expect("serialize sentinel"))
            .expect("must write sentinel");
        assert_eq!(
            probe_holder(&path),
            HolderState::Stale {
                pid: Some(999_999_999)
            }
        );

        let started = Instant::now();
        let _guard = LockFile::acquire(&dir, "registry", short(50), short(5000))
            .expect("must recover stale lock");
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "stale recovery must not wait out the timeout"
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn live_holder_probe_reports_live() {
        let dir = test_locks_dir();
        let guard =
            LockFile::acquire(&dir, "registry", short(10), short(500)).expect("must acquire");
        assert_eq!(
            probe_holder(guard.path()),
            HolderState::Live {
                pid: std::process::id()
            }
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_sentinel_is_recovered_after_one_retry_window() {
        let dir = test_locks_dir();
        let path = dir.join("registry.lock");
        fs::write(&path, "not json").expect("must write corrupt sentinel");
        assert_eq!(probe_holder(&path), HolderState::Unknown);

        LockFile::acquire(&dir, "registry", short(10), short(2000))
            .expect("must recover corrupt sentinel");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_sentinel_probe_reports_stale_without_pid() {
        let dir = test_locks_dir();
        assert_eq!(
            probe_holder(&dir.join("absent.lock")),
            HolderState::Stale { pid: None }
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn try_acquire_reports_contention_with_holder_pid() {
        let dir = test_locks_dir();
        let _guard =
            LockFile::acquire(&dir, "registry", short(10), short(500)).expect("must acquire");

        let err = LockFile::try_acquire(&dir, "registry")
            .expect_err("non-blocking attempt must report contention");
        match err {
            LockError::Contended { name, holder_pid } => {
                assert_eq!(name, "registry");
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("expected contention, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn try_acquire_succeeds_on_free_lock() {
        let dir = test_locks_dir();
        let sentinel_path = dir.join("registry.lock");

        {
            let _guard = LockFile::try_acquire(&dir, "registry").expect("must acquire");
            assert!(sentinel_path.exists());
        }
        assert!(!sentinel_path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lock_names_are_sanitized_and_truncated() {
        let long = "a/b".repeat(100);
        let name = sanitized_lock_name(&long);
        assert_eq!(name.len(), MAX_LOCK_NAME_LEN);
        assert!(!name.contains('/'));
    }

    #[test]
    fn with_lock_returns_action_result_and_releases() {
        let dir = test_locks_dir();
        let sentinel_path = dir.join("registry.lock");

        let value = with_lock(&dir, "registry", short(10), short(500), || {
            assert!(sentinel_path.exists());
            Ok(41 + 1)
        })
        .expect("action must run under lock");
        assert_eq!(value, 42);
        assert!(!sentinel_path.exists());

        let err = with_lock(&dir, "registry", short(10), short(500), || {
            Err::<(), _>(anyhow::anyhow!("action failed"))
        })
        .expect_err("action error must propagate");
        assert!(format!("{err:#}").contains("action failed"));
        assert!(!sentinel_path.exists(), "lock must release on action failure");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn distinct_lock_names_do_not_contend() {
        let dir = test_locks_dir();

        let _a = LockFile::acquire(&dir, "records", short(10), short(500)).expect("lock records");
        LockFile::acquire(&dir, "scan", short(10), short(500)).expect("lock scan");

        let _ = fs::remove_dir_all(&dir);
    }
}
