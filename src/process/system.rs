//! Process table backed by the running OS

use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::trace;

use crate::process::errors::ProcessError;
use crate::process::table::{name_matches, ProcessInfo, ProcessTable};

/// Granularity of the blocking exit check
const EXIT_CHECK_STEP: Duration = Duration::from_millis(50);

/// Longest process name the kernel reports; longer names are cut to this
const COMM_LEN: usize = 15;

/// [`ProcessTable`] that reads the real process list through `sysinfo`.
///
/// Window readiness is answered by the window manager on Windows. Other
/// platforms have no single notion of a process's main window, so a live
/// process is reported as window-ready there.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }
}

/// Refresh kind that also loads what long-name matching needs
fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::new()
        .with_exe(UpdateKind::OnlyIfNotSet)
        .with_cmd(UpdateKind::OnlyIfNotSet)
}

fn snapshot() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(refresh_kind());
    system
}

fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// File names of the executable and of argv[0]
fn executable_names(process: &Process) -> impl Iterator<Item = &str> {
    let exe = process.exe().and_then(Path::file_name);
    let argv0 = process
        .cmd()
        .first()
        .map(Path::new)
        .and_then(Path::file_name);
    exe.into_iter().chain(argv0).filter_map(OsStr::to_str)
}

fn process_matches(candidate: &str, process: &Process) -> bool {
    if name_matches(candidate, process.name()) {
        return true;
    }
    if process.name().len() < COMM_LEN {
        return false;
    }

    executable_names(process).any(|n| name_matches(candidate, n))
}

/// Full process name, recovered from the executable when the reported one
/// was truncated
fn full_name(process: &Process) -> String {
    let name = process.name();
    if name.len() >= COMM_LEN {
        if let Some(full) = executable_names(process).find(|n| n.starts_with(name)) {
            return full.to_string();
        }
    }
    name.to_string()
}

fn to_info(process: &Process) -> ProcessInfo {
    ProcessInfo {
        pid: process.pid().as_u32(),
        name: full_name(process),
    }
}

/// Lowest pid keeps the answer stable while several instances run
fn first_match(system: &System, name: &str) -> Option<ProcessInfo> {
    system
        .processes()
        .values()
        .filter(|p| is_live(p) && process_matches(name, p))
        .min_by_key(|p| p.pid().as_u32())
        .map(to_info)
}

impl ProcessTable for SystemProcessTable {
    fn find_by_name(&self, name: &str) -> Result<Option<ProcessInfo>, ProcessError> {
        let found = first_match(&snapshot(), name);
        trace!(event = "system.find_by_name", name, found = found.is_some());
        Ok(found)
    }

    fn find_first(&self, names: &[String]) -> Result<Option<ProcessInfo>, ProcessError> {
        let system = snapshot();
        let found = names.iter().find_map(|name| first_match(&system, name));
        trace!(event = "system.find_first", names = ?names, found = found.is_some());
        Ok(found)
    }

    fn find_by_id(&self, pid: u32) -> Result<Option<ProcessInfo>, ProcessError> {
        let mut system = System::new();
        let pid_obj = Pid::from_u32(pid);
        if !system.refresh_process_specifics(pid_obj, refresh_kind()) {
            return Ok(None);
        }

        Ok(system.process(pid_obj).filter(|p| is_live(p)).map(to_info))
    }

    #[cfg(windows)]
    fn has_main_window(&self, pid: u32) -> Result<bool, ProcessError> {
        win32::has_visible_top_level_window(pid)
    }

    #[cfg(not(windows))]
    fn has_main_window(&self, pid: u32) -> Result<bool, ProcessError> {
        Ok(self.find_by_id(pid)?.is_some())
    }

    fn wait_for_exit(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, ProcessError>> + Send {
        async move {
            tokio::task::spawn_blocking(move || block_until_exit(pid, timeout))
                .await
                .map_err(|e| ProcessError::ExitWait {
                    pid,
                    message: e.to_string(),
                })
        }
    }
}

/// Block the current thread until `pid` is gone or `timeout` elapses
fn block_until_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    let pid_obj = Pid::from_u32(pid);
    let mut system = System::new();

    loop {
        let alive = system.refresh_process_specifics(pid_obj, ProcessRefreshKind::new())
            && system.process(pid_obj).is_some_and(is_live);
        if !alive {
            return true;
        }

        let step = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                EXIT_CHECK_STEP.min(deadline - now)
            }
            None => EXIT_CHECK_STEP,
        };
        std::thread::sleep(step);
    }
}

#[cfg(windows)]
mod win32 {
    use windows_sys::Win32::Foundation::{GetLastError, BOOL, HWND, LPARAM};
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindow, GetWindowThreadProcessId, IsWindowVisible, GW_OWNER,
    };

    use crate::process::errors::ProcessError;

    struct Search {
        pid: u32,
        found: bool,
    }

    unsafe extern "system" fn visit(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam as *mut Search);

        let mut owner_pid = 0u32;
        GetWindowThreadProcessId(hwnd, &mut owner_pid);

        // Visible and unowned: what the shell treats as an app's main window
        if owner_pid == search.pid
            && IsWindowVisible(hwnd) != 0
            && GetWindow(hwnd, GW_OWNER).is_null()
        {
            search.found = true;
            return 0;
        }
        1
    }

    pub fn has_visible_top_level_window(pid: u32) -> Result<bool, ProcessError> {
        let mut search = Search { pid, found: false };
        let completed = unsafe { EnumWindows(Some(visit), &mut search as *mut Search as LPARAM) };

        // Stopping early on a match also reports failure
        if completed == 0 && !search.found {
            let code = unsafe { GetLastError() };
            if code != 0 {
                return Err(ProcessError::WindowQuery {
                    pid,
                    message: format!("EnumWindows failed with error {code}"),
                });
            }
        }
        Ok(search.found)
    }
}
