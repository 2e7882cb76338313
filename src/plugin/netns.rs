use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, error};

use crate::error::{CniError, Result};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";
const PROCESS_NETNS: &str = "/proc/self/ns/net";

/// Scoped switch into another network namespace.
///
/// The calling thread's original namespace is restored by [`NetnsGuard::restore`]
/// or, failing that, when the guard is dropped.
pub struct NetnsGuard {
    original: Option<File>,
    target: String,
}

impl NetnsGuard {
    pub fn enter(netns_path: &str) -> Result<Self> {
        let original = File::open(THREAD_NETNS)
            .or_else(|_| File::open(PROCESS_NETNS))
            .map_err(|err| {
                CniError::Namespace(format!("failed to open current network namespace: {err}"))
            })?;
        if !Path::new(netns_path).exists() {
            return Err(CniError::Namespace(format!(
                "network namespace {netns_path} does not exist"
            )));
        }
        let target = File::open(netns_path).map_err(|err| {
            CniError::Namespace(format!("failed to open network namespace {netns_path}: {err}"))
        })?;
        setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|err| {
            CniError::Namespace(format!("failed to enter network namespace {netns_path}: {err}"))
        })?;
        debug!(netns = netns_path, "entered network namespace");
        Ok(Self {
            original: Some(original),
            target: netns_path.to_string(),
        })
    }

    /// Switch back, reporting failure.
    pub fn restore(mut self) -> Result<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<()> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };
        setns(original.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|err| {
            CniError::Namespace(format!(
                "failed to leave network namespace {}: {err}",
                self.target
            ))
        })?;
        debug!(netns = %self.target, "restored original network namespace");
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            error!("{}", err);
        }
    }
}

/// Run `f` inside `netns_path`; the original namespace is always restored.
pub fn with_netns(netns_path: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
    let guard = NetnsGuard::enter(netns_path)?;
    let outcome = f();
    let restored = guard.restore();
    match (outcome, restored) {
        (Err(err), Err(restore_err)) => {
            error!("{}", restore_err);
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), restored) => restored,
    }
}
