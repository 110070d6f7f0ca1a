//! process-lurker library - wait for a process you don't own to start,
//! show its window, and exit

pub mod config;
pub mod logging;
pub mod process;

// Re-export commonly used types
pub use config::{Config, RetryPolicy, WatcherConfig};
pub use process::{
    ExitWatchOutcome, ProcessClosed, ProcessInfo, ProcessTable, ProcessWatcher, WaitOptions,
};
