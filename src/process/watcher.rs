//! Watch session for a process this program did not launch
//!
//! A [`ProcessWatcher`] is bound to an ordered list of candidate process
//! names. [`ProcessWatcher::wait`] polls until one of them is running,
//! optionally starts a background watch that announces when every matching
//! process has exited, and optionally keeps polling until the process shows
//! its top-level window.
//!
//! Nothing in here treats an OS query failure as fatal. Failures are logged
//! and the affected loop polls again.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::WatcherConfig;
use crate::process::errors::ProcessError;
use crate::process::system::SystemProcessTable;
use crate::process::table::{ProcessHandle, ProcessInfo, ProcessTable};

/// Callback run by the exit watch right before [`ProcessClosed`] is sent
pub type ExitHook = Box<dyn Fn() + Send + Sync>;

/// Sent to subscribers once no process matching the candidate names remains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessClosed;

/// How a background exit watch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitWatchOutcome {
    /// Every matching process exited and subscribers were notified
    Closed,
    /// The session was disposed first; nobody was notified
    Cancelled,
}

/// Options for a single [`ProcessWatcher::wait`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Start a background exit watch once the process is found
    pub wait_for_exit: bool,
    /// Return only once the process has a usable top-level window
    pub wait_for_window: bool,
    /// Bounds the wait for the process to appear. `None` or zero waits forever.
    pub timeout: Option<Duration>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_watch(mut self) -> Self {
        self.wait_for_exit = true;
        self
    }

    pub fn with_window(mut self) -> Self {
        self.wait_for_window = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Builder for a [`ProcessWatcher`] with a custom table, timing or exit hook
pub struct WatcherBuilder<T: ProcessTable> {
    names: Vec<String>,
    table: T,
    config: WatcherConfig,
    exit_hook: Option<ExitHook>,
}

impl<T: ProcessTable> WatcherBuilder<T> {
    /// Query a different process table
    pub fn table<U: ProcessTable>(self, table: U) -> WatcherBuilder<U> {
        WatcherBuilder {
            names: self.names,
            table,
            config: self.config,
            exit_hook: self.exit_hook,
        }
    }

    pub fn config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `hook` whenever an exit watch declares the process closed
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.exit_hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> ProcessWatcher<T> {
        let (closed_tx, _) = broadcast::channel(self.config.event_capacity.max(1));

        ProcessWatcher {
            inner: Arc::new(Inner {
                names: self.names,
                table: self.table,
                config: self.config,
                cancel: CancellationToken::new(),
                active: Mutex::new(None),
                resolved_id: Mutex::new(None),
                closed_tx,
                exit_hook: self.exit_hook,
                exit_watch: Mutex::new(None),
            }),
        }
    }
}

/// A watch session bound to an ordered list of candidate process names.
///
/// Dropping the watcher disposes it: pending waits return `None` and a
/// running exit watch stops without notifying anyone.
pub struct ProcessWatcher<T: ProcessTable = SystemProcessTable> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    names: Vec<String>,
    table: T,
    config: WatcherConfig,
    cancel: CancellationToken,
    /// The one process handle this session owns
    active: Mutex<Option<ProcessHandle>>,
    resolved_id: Mutex<Option<u32>>,
    closed_tx: broadcast::Sender<ProcessClosed>,
    exit_hook: Option<ExitHook>,
    exit_watch: Mutex<Option<JoinHandle<ExitWatchOutcome>>>,
}

enum WindowPoll {
    Ready(u32),
    Lost,
    Cancelled,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ProcessWatcher<SystemProcessTable> {
    /// Watch for a single process name
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder([name.into()]).build()
    }

    /// Watch for any of `names`, earlier names taking priority
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder(names).build()
    }

    pub fn builder<I, S>(names: I) -> WatcherBuilder<SystemProcessTable>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WatcherBuilder {
            names: names.into_iter().map(Into::into).collect(),
            table: SystemProcessTable::new(),
            config: WatcherConfig::default(),
            exit_hook: None,
        }
    }

    /// The running process with this id, or `None` if it no longer exists
    pub fn process_by_id(pid: u32) -> Option<ProcessInfo> {
        match SystemProcessTable::new().find_by_id(pid) {
            Ok(found) => found,
            Err(e) => {
                debug!(event = "watcher.process_by_id.failed", pid, error = %e);
                None
            }
        }
    }

    pub fn current_process_id() -> u32 {
        std::process::id()
    }
}

impl<T: ProcessTable> ProcessWatcher<T> {
    /// Candidate names in priority order
    pub fn names(&self) -> &[String] {
        &self.inner.names
    }

    /// Resolve the candidate names to a running process right now.
    ///
    /// Releases the previously held handle first. Returns `None` when no
    /// candidate is running or the OS query failed.
    pub fn lookup(&self) -> Option<ProcessInfo> {
        self.inner.lookup()
    }

    /// The process currently held by the session, as of the last lookup
    pub fn active_process(&self) -> Option<ProcessInfo> {
        lock(&self.inner.active).as_ref().map(|h| h.info().clone())
    }

    /// Id of the last process that reported a ready window
    pub fn resolved_id(&self) -> Option<u32> {
        *lock(&self.inner.resolved_id)
    }

    /// Receive every [`ProcessClosed`] sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessClosed> {
        self.inner.closed_tx.subscribe()
    }

    /// Wait for the process to appear, with no timeout, exit watch or window
    pub async fn wait_for_process(&self) -> Option<u32> {
        self.wait(WaitOptions::new()).await
    }

    pub async fn wait_for_process_with_timeout(&self, timeout: Duration) -> Option<u32> {
        self.wait(WaitOptions::new().with_timeout(timeout)).await
    }

    /// Wait for one of the candidate processes.
    ///
    /// Returns the id of the matched process, or of the window-ready process
    /// when `wait_for_window` is set. Returns `None` when the timeout elapses
    /// before any candidate appears, when the window wait runs out of
    /// retries, or when the session is disposed.
    ///
    /// The timeout covers only the appearance phase. Once a process is
    /// found, the window wait runs until it succeeds or the session is
    /// disposed.
    pub async fn wait(&self, options: WaitOptions) -> Option<u32> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            debug!(event = "watcher.wait.disposed", names = ?inner.names);
            return None;
        }

        let timeout = options.timeout.filter(|t| !t.is_zero());
        info!(
            event = "watcher.wait.started",
            names = ?inner.names,
            wait_for_exit = options.wait_for_exit,
            wait_for_window = options.wait_for_window,
            timeout_ms = timeout.map(|t| t.as_millis() as u64)
        );

        // A timeout cancels this call only, never the session
        let call_token = inner.cancel.child_token();
        // A deadline past the clock's range is no deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let found = inner.await_appearance(&call_token, deadline).await?;
        info!(
            event = "watcher.wait.found",
            pid = found.pid,
            name = %found.name
        );

        if options.wait_for_exit {
            self.start_exit_watch();
        }

        if options.wait_for_window {
            inner.await_window_ready().await
        } else {
            Some(found.pid)
        }
    }

    /// Outcome of the most recent exit watch, waiting for it to finish.
    ///
    /// Returns `None` if no exit watch was started since the last call, or
    /// if the watch task panicked.
    pub async fn exit_watch_outcome(&self) -> Option<ExitWatchOutcome> {
        let handle = lock(&self.inner.exit_watch).take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(event = "watcher.exit.task_failed", error = %e);
                None
            }
        }
    }

    /// Cancel every pending wait and release the owned process handle.
    ///
    /// Safe to call more than once.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }

        inner.cancel.cancel();
        lock(&inner.active).take();
        debug!(event = "watcher.disposed", names = ?inner.names);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn start_exit_watch(&self) {
        let mut slot = lock(&self.inner.exit_watch);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(event = "watcher.exit.already_running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move { inner.await_exit().await }));
    }
}

impl<T: ProcessTable> Drop for ProcessWatcher<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: ProcessTable> Inner<T> {
    /// Lookup that reports failures instead of logging them
    fn try_lookup(&self) -> Result<Option<ProcessInfo>, ProcessError> {
        let mut slot = lock(&self.active);
        slot.take();

        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let found = self.table.find_first(&self.names)?;
        if let Some(info) = &found {
            trace!(event = "watcher.lookup.matched", name = %info.name, pid = info.pid);
            *slot = Some(ProcessHandle::acquire(info.clone()));
        }
        Ok(found)
    }

    fn lookup(&self) -> Option<ProcessInfo> {
        match self.try_lookup() {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    event = "watcher.lookup.query_failed",
                    code = e.error_code(),
                    error = %e
                );
                None
            }
        }
    }

    async fn await_appearance(
        &self,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Option<ProcessInfo> {
        let interval = self.config.poll_interval();

        loop {
            if token.is_cancelled() {
                debug!(event = "watcher.appearance.cancelled", names = ?self.names);
                return None;
            }

            if let Some(info) = self.lookup() {
                return Some(info);
            }

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(event = "watcher.appearance.cancelled", names = ?self.names);
                    return None;
                }
                _ = deadline_reached(deadline) => {
                    token.cancel();
                    info!(event = "watcher.appearance.timed_out", names = ?self.names);
                    return None;
                }
                _ = sleep(interval) => {}
            }
        }
    }

    async fn await_exit(&self) -> ExitWatchOutcome {
        let interval = self.config.exit_block_interval();
        debug!(event = "watcher.exit.started", names = ?self.names);

        loop {
            if self.cancel.is_cancelled() {
                debug!(event = "watcher.exit.cancelled", names = ?self.names);
                return ExitWatchOutcome::Cancelled;
            }

            let deadline = Instant::now() + interval;

            match self.try_lookup() {
                Ok(Some(info)) => {
                    let waited = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            debug!(event = "watcher.exit.cancelled", names = ?self.names);
                            return ExitWatchOutcome::Cancelled;
                        }
                        waited = self.table.wait_for_exit(info.pid, interval) => waited,
                    };

                    match waited {
                        Ok(true) => trace!(event = "watcher.exit.instance_gone", pid = info.pid),
                        Ok(false) => {}
                        Err(e) => warn!(
                            event = "watcher.exit.wait_failed",
                            pid = info.pid,
                            code = e.error_code(),
                            error = %e
                        ),
                    }
                }
                Ok(None) => {
                    // Lookup reports nothing once the session is disposed
                    if self.cancel.is_cancelled() {
                        debug!(event = "watcher.exit.cancelled", names = ?self.names);
                        return ExitWatchOutcome::Cancelled;
                    }
                    break;
                }
                Err(e) => warn!(
                    event = "watcher.exit.lookup_failed",
                    code = e.error_code(),
                    error = %e
                ),
            }

            // Re-resolve only on interval boundaries so a successor that
            // starts right after its predecessor exits is still seen
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(event = "watcher.exit.cancelled", names = ?self.names);
                    return ExitWatchOutcome::Cancelled;
                }
                _ = sleep_until(deadline) => {}
            }
        }

        info!(event = "watcher.exit.closed", names = ?self.names);
        if let Some(hook) = &self.exit_hook {
            // A failing hook must not swallow the notification
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                error!(
                    event = "watcher.exit.hook_panicked",
                    names = ?self.names,
                    message = panic_message(payload.as_ref())
                );
            }
        }

        let notified = self.closed_tx.send(ProcessClosed).unwrap_or(0);
        debug!(event = "watcher.exit.notified", subscribers = notified);
        ExitWatchOutcome::Closed
    }

    async fn await_window_ready(&self) -> Option<u32> {
        let policy = &self.config.window_retry;
        let mut restarts: u32 = 0;

        loop {
            match self.poll_window().await {
                WindowPoll::Ready(pid) => {
                    *lock(&self.resolved_id) = Some(pid);
                    info!(event = "watcher.window.ready", pid, restarts);
                    return Some(pid);
                }
                WindowPoll::Cancelled => {
                    debug!(event = "watcher.window.cancelled", names = ?self.names);
                    return None;
                }
                WindowPoll::Lost => {
                    restarts = restarts.saturating_add(1);
                    if !policy.allows(restarts) {
                        warn!(
                            event = "watcher.window.gave_up",
                            names = ?self.names,
                            restarts = restarts - 1
                        );
                        return None;
                    }

                    let backoff = policy.backoff(restarts);
                    if restarts == 1 {
                        warn!(
                            event = "watcher.window.transient_loss",
                            names = ?self.names,
                            backoff_ms = backoff.as_millis() as u64
                        );
                    } else {
                        debug!(
                            event = "watcher.window.transient_loss",
                            restart = restarts,
                            backoff_ms = backoff.as_millis() as u64
                        );
                    }

                    if !backoff.is_zero() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                debug!(event = "watcher.window.cancelled", names = ?self.names);
                                return None;
                            }
                            _ = sleep(backoff) => {}
                        }
                    }
                }
            }
        }
    }

    /// One pass of the window wait, ending when the window is ready or the
    /// process can no longer be resolved
    async fn poll_window(&self) -> WindowPoll {
        let interval = self.config.window_poll_interval();

        loop {
            let current = self.try_lookup();

            tokio::select! {
                _ = self.cancel.cancelled() => return WindowPoll::Cancelled,
                _ = sleep(interval) => {}
            }

            let info = match current {
                Ok(Some(info)) => info,
                Ok(None) => return WindowPoll::Lost,
                Err(e) => {
                    warn!(
                        event = "watcher.window.lookup_failed",
                        code = e.error_code(),
                        error = %e
                    );
                    return WindowPoll::Lost;
                }
            };

            match self.table.has_main_window(info.pid) {
                Ok(true) => return WindowPoll::Ready(info.pid),
                Ok(false) => trace!(event = "watcher.window.not_ready", pid = info.pid),
                Err(e) => {
                    warn!(
                        event = "watcher.window.query_failed",
                        pid = info.pid,
                        code = e.error_code(),
                        error = %e
                    );
                    return WindowPoll::Lost;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_options_builders() {
        let options = WaitOptions::new()
            .with_exit_watch()
            .with_window()
            .with_timeout(Duration::from_secs(2));
        assert!(options.wait_for_exit);
        assert!(options.wait_for_window);
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(WaitOptions::default(), WaitOptions::new());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let watcher = ProcessWatcher::new("nonexistent-process-xyz");
        assert!(!watcher.is_disposed());
        watcher.dispose();
        watcher.dispose();
        assert!(watcher.is_disposed());
        assert!(watcher.active_process().is_none());
    }

    #[test]
    fn test_names_keep_priority_order() {
        let watcher = ProcessWatcher::with_names(["first", "second", "third"]);
        assert_eq!(watcher.names(), ["first", "second", "third"]);
    }

    #[test]
    fn test_current_process_id_matches_std() {
        assert_eq!(ProcessWatcher::current_process_id(), std::process::id());
    }

    #[test]
    fn test_process_by_id_missing_returns_none() {
        assert!(ProcessWatcher::process_by_id(999_999).is_none());
    }

    #[tokio::test]
    async fn test_wait_after_dispose_returns_none() {
        let watcher = ProcessWatcher::new("nonexistent-process-xyz");
        watcher.dispose();
        assert_eq!(watcher.wait_for_process().await, None);
    }
}
