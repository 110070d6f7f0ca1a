//! The OS capability the watcher polls: list by name, fetch by id,
//! window readiness and bounded exit waits

use std::future::Future;
use std::time::Duration;
use tracing::trace;

use crate::process::errors::ProcessError;

/// A live process observed in the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Read access to the OS process table.
///
/// Implementations must be cheap to call repeatedly; the watcher polls
/// them several times per second while waiting.
pub trait ProcessTable: Send + Sync + 'static {
    /// First running process whose name matches `name`, if any.
    ///
    /// When several processes share the name, which one is returned is up
    /// to the implementation.
    fn find_by_name(&self, name: &str) -> Result<Option<ProcessInfo>, ProcessError>;

    /// First running process matching any of `names`, earlier names first.
    ///
    /// A name whose query fails is skipped; the error is returned only when
    /// no other name matched. Implementations that read the whole table at
    /// once should override this to take a single snapshot.
    fn find_first(&self, names: &[String]) -> Result<Option<ProcessInfo>, ProcessError> {
        let mut failure = None;
        for name in names {
            match self.find_by_name(name) {
                Ok(Some(info)) => return Ok(Some(info)),
                Ok(None) => {}
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// The running process with this id, if it still exists
    fn find_by_id(&self, pid: u32) -> Result<Option<ProcessInfo>, ProcessError>;

    /// Whether the process currently exposes a usable top-level window
    fn has_main_window(&self, pid: u32) -> Result<bool, ProcessError>;

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Resolves to `true` once the process is gone and `false` if it is
    /// still running when the timeout elapses. Implementations may resolve
    /// early with `false`.
    fn wait_for_exit(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, ProcessError>> + Send;
}

/// The process a watch session currently believes is its target.
///
/// Exactly one of these lives in a session's slot at a time; replacing it
/// drops the previous one.
#[derive(Debug)]
pub struct ProcessHandle {
    info: ProcessInfo,
}

impl ProcessHandle {
    pub(crate) fn acquire(info: ProcessInfo) -> Self {
        trace!(event = "process_handle.acquired", pid = info.pid, name = %info.name);
        Self { info }
    }

    pub fn id(&self) -> u32 {
        self.info.pid
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        trace!(event = "process_handle.released", pid = self.info.pid);
    }
}

/// Whether a process called `actual` answers to the candidate name.
///
/// A trailing `.exe` is ignored on either side, and on Windows the
/// comparison ignores ASCII case.
pub fn name_matches(candidate: &str, actual: &str) -> bool {
    let candidate = strip_exe(candidate);
    let actual = strip_exe(actual);

    if candidate.is_empty() {
        return false;
    }

    if cfg!(windows) {
        candidate.eq_ignore_ascii_case(actual)
    } else {
        candidate == actual
    }
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}
