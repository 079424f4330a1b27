//! Site movers — copy-tool wrappers such as `lcg-cp` (spec.md §1, §6).
//! Interface only; selected via an explicit factory instead of the
//! source's monkey-patched `@use_newmover` selection (Design Note §9).

use async_trait::async_trait;
use esd_core::error::DriverError;
use std::path::Path;
use std::time::Duration;

/// Per-file watchdog timeout, proportional to file size (spec.md §5,
/// "Cancellation & timeouts"). A floor keeps tiny files from getting an
/// unreasonably short deadline.
pub fn watchdog_timeout(size_bytes: u64) -> Duration {
    const MIN_SECS: u64 = 60;
    const BYTES_PER_SEC: u64 = 5_000_000; // conservative WAN copy-tool throughput
    Duration::from_secs(MIN_SECS.max(size_bytes / BYTES_PER_SEC))
}

#[async_trait]
pub trait Mover: Send + Sync {
    /// Stage a remote LFN in to `local_path`. Returns `GetTimeout` if the
    /// watchdog expires; any partial destination is removed first.
    async fn get(&self, lfn: &str, guid: &str, local_path: &Path) -> Result<(), DriverError>;

    /// Stage `local_path` out to the site's remote storage at `remote_path`.
    /// Returns `PutTimeout` if the watchdog expires.
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), DriverError>;
}

/// Wraps an external copy-tool binary (e.g. `lcg-cp`), matching the
/// shape of `original_source/movers/lcgcp_sitemover.py`: a command line
/// is built, run under the watchdog, and a non-zero exit (or timeout)
/// is turned into the matching `DriverError` variant.
pub struct ExternalCommandMover {
    pub get_command: String,
    pub put_command: String,
}

#[async_trait]
impl Mover for ExternalCommandMover {
    async fn get(&self, lfn: &str, guid: &str, local_path: &Path) -> Result<(), DriverError> {
        let size_hint = 0; // real size is unknown until the copy-tool reports it
        let timeout = watchdog_timeout(size_hint);
        let fut = tokio::process::Command::new(&self.get_command)
            .arg(format!("guid:{guid}"))
            .arg(lfn)
            .arg(local_path)
            .status();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(_)) => {
                Err(DriverError::GetTimeout { lfn: lfn.to_string(), elapsed_s: timeout.as_secs() })
            }
            Ok(Err(e)) => Err(DriverError::Unknown { reason: e.to_string() }),
            Err(_) => {
                let _ = tokio::fs::remove_file(local_path).await;
                Err(DriverError::GetTimeout { lfn: lfn.to_string(), elapsed_s: timeout.as_secs() })
            }
        }
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), DriverError> {
        let size_hint = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);
        let timeout = watchdog_timeout(size_hint);
        let fut = tokio::process::Command::new(&self.put_command)
            .arg(local_path)
            .arg(remote_path)
            .status();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(_)) => Err(DriverError::PutTimeout {
                path: local_path.display().to_string(),
                elapsed_s: timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(DriverError::Unknown { reason: e.to_string() }),
            Err(_) => Err(DriverError::PutTimeout {
                path: local_path.display().to_string(),
                elapsed_s: timeout.as_secs(),
            }),
        }
    }
}

/// Selects a concrete [`Mover`] from site configuration (replaces the
/// source's `@use_newmover` monkeypatch, Design Note §9).
pub struct MoverFactory;

impl MoverFactory {
    pub fn for_plugin(copy_tool: &str) -> Box<dyn Mover> {
        Box::new(ExternalCommandMover {
            get_command: format!("{copy_tool}-get"),
            put_command: format!("{copy_tool}-put"),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// In-memory mover: `get` writes a placeholder file, `put` records
    /// the destination. `fail_lfns`/`fail_puts` simulate `StageInFailed`/
    /// `StageOutFailed` for specific files (scenario 4, spec.md §8).
    #[derive(Default)]
    pub struct FakeMover {
        pub fail_lfns: Mutex<HashSet<String>>,
        pub puts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Mover for FakeMover {
        async fn get(&self, lfn: &str, _guid: &str, local_path: &Path) -> Result<(), DriverError> {
            if self.fail_lfns.lock().contains(lfn) {
                return Err(DriverError::GetTimeout { lfn: lfn.to_string(), elapsed_s: 1 });
            }
            tokio::fs::write(local_path, b"fake-payload").await.ok();
            Ok(())
        }

        async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), DriverError> {
            self.puts
                .lock()
                .push((local_path.display().to_string(), remote_path.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_timeout_scales_with_size_but_has_a_floor() {
        assert_eq!(watchdog_timeout(0), Duration::from_secs(60));
        assert!(watchdog_timeout(50_000_000_000) > Duration::from_secs(60));
    }
}
