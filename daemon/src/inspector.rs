/// Resolves a creation notification's pid into a verified, still-running process.
///
/// Opening a process yields a handle that stays open for both inspection and
/// classification of one notification and is closed when it is dropped, on
/// every path.
///
/// On Windows the handle is a real `OpenProcess` handle with
/// `PROCESS_QUERY_LIMITED_INFORMATION` rights. Elsewhere it is a `sysinfo`
/// view of the process captured at open time.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// An open, queryable reference to one process.
pub trait ProcessHandle {
    fn pid(&self) -> u32;
    /// `Ok(true)` while the process has not exited.
    fn is_running(&self) -> io::Result<bool>;
    /// Full path of the process image.
    fn image_path(&self) -> io::Result<PathBuf>;
    /// Terminal-services session the process belongs to, if it can be determined.
    fn session_id(&self) -> Option<u32>;
}

/// Opens handles to live processes by pid.
pub trait ProcessSource {
    type Handle: ProcessHandle;

    fn open(&mut self, pid: u32) -> io::Result<Self::Handle>;
}

#[derive(Debug, Error)]
pub enum InspectError {
    /// The process is already gone or access was denied.
    #[error("process {pid} could not be opened: {source}")]
    Unavailable {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("process {pid} exited before it could be inspected")]
    AlreadyExited { pid: u32 },
    #[error("image path of process {pid} is unavailable: {source}")]
    PathUnavailable {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// A process that passed inspection, together with the handle it was inspected through.
#[derive(Debug)]
pub struct Inspected<H> {
    pub handle: H,
    pub path: PathBuf,
}

/// Opens `pid`, checks that it is still running and reads its image path.
///
/// A failing exit-status query is treated the same as an exited process: the
/// process cannot be shown to be running.
pub fn inspect<S: ProcessSource>(source: &mut S, pid: u32) -> Result<Inspected<S::Handle>, InspectError> {
    let handle = source
        .open(pid)
        .map_err(|source| InspectError::Unavailable { pid, source })?;

    match handle.is_running() {
        Ok(true) => {}
        Ok(false) | Err(_) => return Err(InspectError::AlreadyExited { pid }),
    }

    let path = handle
        .image_path()
        .map_err(|source| InspectError::PathUnavailable { pid, source })?;

    Ok(Inspected { handle, path })
}

pub use imp::OsProcesses;

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::io;
    use std::path::PathBuf;

    use windows::core::PWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
    use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
        PROCESS_QUERY_LIMITED_INFORMATION,
    };

    use super::{ProcessHandle, ProcessSource};

    /// Long-path aware buffer size for `QueryFullProcessImageNameW`, in UTF-16 units.
    const IMAGE_PATH_CAPACITY: usize = 32_768;

    fn to_io(e: windows::core::Error) -> io::Error {
        io::Error::other(e)
    }

    /// Owned process handle; closed on drop.
    #[derive(Debug)]
    pub struct OsProcessHandle {
        pid: u32,
        handle: HANDLE,
    }

    impl Drop for OsProcessHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }

    impl ProcessHandle for OsProcessHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_running(&self) -> io::Result<bool> {
            let mut code = 0u32;
            unsafe { GetExitCodeProcess(self.handle, &mut code) }.map_err(to_io)?;
            Ok(code == STILL_ACTIVE.0 as u32)
        }

        fn image_path(&self) -> io::Result<PathBuf> {
            let mut buf = vec![0u16; IMAGE_PATH_CAPACITY];
            let mut len = buf.len() as u32;
            unsafe {
                QueryFullProcessImageNameW(
                    self.handle,
                    PROCESS_NAME_WIN32,
                    PWSTR(buf.as_mut_ptr()),
                    &mut len,
                )
            }
            .map_err(to_io)?;
            Ok(PathBuf::from(String::from_utf16_lossy(&buf[..len as usize])))
        }

        fn session_id(&self) -> Option<u32> {
            let mut session = 0u32;
            unsafe { ProcessIdToSessionId(self.pid, &mut session) }
                .ok()
                .map(|()| session)
        }
    }

    /// Opens handles with least-privilege query rights.
    #[derive(Debug, Default)]
    pub struct OsProcesses;

    impl OsProcesses {
        pub fn new() -> Self {
            Self
        }
    }

    impl ProcessSource for OsProcesses {
        type Handle = OsProcessHandle;

        fn open(&mut self, pid: u32) -> io::Result<OsProcessHandle> {
            let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }
                .map_err(to_io)?;
            Ok(OsProcessHandle { pid, handle })
        }
    }
}

// ── Portable implementation ───────────────────────────────────────────────────

#[cfg(not(windows))]
mod imp {
    use std::io;
    use std::path::PathBuf;

    use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

    use super::{ProcessHandle, ProcessSource};

    /// State of one process as read from the process table at open time.
    #[derive(Debug)]
    pub struct OsProcessHandle {
        pid: u32,
        status: ProcessStatus,
        exe: Option<PathBuf>,
    }

    impl ProcessHandle for OsProcessHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_running(&self) -> io::Result<bool> {
            Ok(!matches!(self.status, ProcessStatus::Zombie | ProcessStatus::Dead))
        }

        fn image_path(&self) -> io::Result<PathBuf> {
            self.exe.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::PermissionDenied, "executable path not readable")
            })
        }

        /// Unix sessions are not terminal-services sessions.
        fn session_id(&self) -> Option<u32> {
            None
        }
    }

    pub struct OsProcesses {
        sys: System,
    }

    fn not_found(pid: u32) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("no process with pid {pid}"))
    }

    impl OsProcesses {
        pub fn new() -> Self {
            Self { sys: System::new() }
        }
    }

    impl ProcessSource for OsProcesses {
        type Handle = OsProcessHandle;

        fn open(&mut self, pid: u32) -> io::Result<OsProcessHandle> {
            let target = Pid::from_u32(pid);
            // A thread id resolves like a pid when asked for directly, so the
            // id must first show up in the process listing, which holds only
            // thread-group leaders once tasks are excluded.
            self.sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().without_tasks(),
            );
            let listed = self
                .sys
                .process(target)
                .is_some_and(|process| process.thread_kind().is_none());
            if !listed {
                return Err(not_found(pid));
            }

            // Pids get reused, so the exe is re-read on every open.
            self.sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[target]),
                true,
                ProcessRefreshKind::nothing()
                    .without_tasks()
                    .with_exe(UpdateKind::Always),
            );
            let process = self
                .sys
                .process(target)
                .filter(|process| process.thread_kind().is_none())
                .ok_or_else(|| not_found(pid))?;
            Ok(OsProcessHandle {
                pid,
                status: process.status(),
                exe: process.exe().map(|p| p.to_path_buf()),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeProcess, FakeProcesses};
    use super::*;

    #[test]
    fn inspect_running_process_returns_path() {
        let mut source = FakeProcesses::default().running(100, r"C:\a.exe", 1);
        let inspected = inspect(&mut source, 100).unwrap();
        assert_eq!(inspected.path, PathBuf::from(r"C:\a.exe"));
        assert_eq!(inspected.handle.pid(), 100);
    }

    #[test]
    fn inspect_missing_process_is_unavailable() {
        let mut source = FakeProcesses::default();
        let err = inspect(&mut source, 42).unwrap_err();
        assert!(matches!(err, InspectError::Unavailable { pid: 42, .. }));
    }

    #[test]
    fn inspect_denied_process_is_unavailable() {
        let mut source = FakeProcesses::default().with(7, FakeProcess::Denied);
        let err = inspect(&mut source, 7).unwrap_err();
        match err {
            InspectError::Unavailable { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn inspect_exited_process_is_dropped() {
        let mut source = FakeProcesses::default().with(200, FakeProcess::Exited);
        let err = inspect(&mut source, 200).unwrap_err();
        assert!(matches!(err, InspectError::AlreadyExited { pid: 200 }));
    }

    #[test]
    fn inspect_without_path_is_path_unavailable() {
        let mut source = FakeProcesses::default().with(300, FakeProcess::NoPath);
        let err = inspect(&mut source, 300).unwrap_err();
        assert!(matches!(err, InspectError::PathUnavailable { pid: 300, .. }));
    }

    #[test]
    fn handle_is_closed_on_every_path() {
        let mut source = FakeProcesses::default()
            .running(1, "/bin/a", 1)
            .with(2, FakeProcess::Exited)
            .with(3, FakeProcess::NoPath);

        let ok = inspect(&mut source, 1).unwrap();
        assert_eq!(source.live_handles(), 1);
        drop(ok);
        assert_eq!(source.live_handles(), 0);

        assert!(inspect(&mut source, 2).is_err());
        assert!(inspect(&mut source, 3).is_err());
        assert_eq!(source.live_handles(), 0);
    }

    #[test]
    fn error_messages_name_the_pid() {
        let err = InspectError::AlreadyExited { pid: 55 };
        assert!(err.to_string().contains("55"));
    }

    #[cfg(not(windows))]
    #[test]
    fn os_processes_can_inspect_current_process() {
        let mut source = OsProcesses::new();
        let inspected = inspect(&mut source, std::process::id()).unwrap();
        assert!(inspected.path.is_absolute());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thread_id_is_not_inspected_as_a_process() {
        let own_pid = std::process::id();
        let (park_tx, park_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = park_rx.recv();
        });

        let tids: Vec<u32> = std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .filter(|&tid| tid != own_pid)
            .collect();
        assert!(!tids.is_empty());

        let mut source = OsProcesses::new();
        for tid in tids {
            let err = inspect(&mut source, tid).unwrap_err();
            assert!(
                matches!(err, InspectError::Unavailable { pid, .. } if pid == tid),
                "thread {tid}: {err}"
            );
        }

        drop(park_tx);
        thread.join().unwrap();
    }
}
