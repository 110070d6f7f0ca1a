//! Watching externally launched processes

pub mod errors;
pub mod system;
pub mod table;
pub mod watcher;

pub use errors::ProcessError;
pub use system::SystemProcessTable;
pub use table::{name_matches, ProcessHandle, ProcessInfo, ProcessTable};
pub use watcher::{
    ExitHook, ExitWatchOutcome, ProcessClosed, ProcessWatcher, WaitOptions, WatcherBuilder,
};
