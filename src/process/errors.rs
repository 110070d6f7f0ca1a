//! Errors raised by the OS process capability

use thiserror::Error;

/// Failure while querying the OS about a process.
///
/// The watcher treats every one of these as transient: it logs them and
/// polls again rather than handing them to the caller.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process list could not be read. `sysinfo` never reports this;
    /// it exists for tables backed by sources that can fail.
    #[error("Failed to query processes named '{name}': {message}")]
    Query { name: String, message: String },

    /// Enumerating top-level windows failed (Windows `EnumWindows`)
    #[error("Failed to query top-level window of process {pid}: {message}")]
    WindowQuery { pid: u32, message: String },

    #[error("Failed to wait for process {pid} to exit: {message}")]
    ExitWait { pid: u32, message: String },
}

impl ProcessError {
    /// Stable code for log fields and programmatic matching
    pub fn error_code(&self) -> &'static str {
        match self {
            ProcessError::Query { .. } => "PROCESS_QUERY_FAILED",
            ProcessError::WindowQuery { .. } => "WINDOW_QUERY_FAILED",
            ProcessError::ExitWait { .. } => "EXIT_WAIT_FAILED",
        }
    }
}
