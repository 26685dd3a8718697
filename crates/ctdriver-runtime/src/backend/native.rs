//! Native Linux backend built directly on `clone(2)`.
//!
//! The child created by [`ContainerHandle::run`] performs, in order: slave
//! propagation for `/` (new mount namespaces only), the bind mounts, the
//! root change, the `/proc` mount, stdio installation and `execve(2)`. Any
//! failure on the way is written to a close-on-exec pipe as a stage code and
//! an errno, so the parent learns about it before returning a pid.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use ctdriver_common::constants::{CONSOLE_MOUNT, EXIT_COMMAND_NOT_FOUND};
use ctdriver_common::error::{DriverError, Result};
use ctdriver_common::types::{ContainerId, ExitStatus, RunState};
use ctdriver_core::cgroup::CgroupManager;
use ctdriver_core::filesystem::mount::{
    bind_mount, create_missing_dirs, make_private, make_root_rslave, mount_proc, prepare_target,
    remove_mount_points, resolve_target,
};
use ctdriver_core::filesystem::root::change_root;
use ctdriver_core::namespace::NamespaceConfig;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use super::{ContainerHandle, CtOption, Session};
use crate::command::Mount;
use crate::terminal::ChildStdio;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Where the child was when it gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum Stage {
    Propagation = 1,
    Mount = 2,
    Root = 3,
    Proc = 4,
    Stdio = 5,
    Console = 6,
    Exec = 7,
}

impl Stage {
    const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Propagation),
            2 => Some(Self::Mount),
            3 => Some(Self::Root),
            4 => Some(Self::Proc),
            5 => Some(Self::Stdio),
            6 => Some(Self::Console),
            7 => Some(Self::Exec),
            _ => None,
        }
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::Propagation => "making / a slave mount",
            Self::Mount => "bind mounting",
            Self::Root => "changing root",
            Self::Proc => "mounting /proc",
            Self::Stdio => "installing stdio",
            Self::Console => "attaching console",
            Self::Exec => "executing",
        }
    }
}

#[derive(Debug, Default)]
struct CtState {
    mounts: Vec<Mount>,
    root: Option<PathBuf>,
    ns_mask: NamespaceConfig,
    auto_proc: bool,
    pid: Option<Pid>,
    exit: Option<ExitStatus>,
    cgroup: Option<CgroupManager>,
    created: Vec<PathBuf>,
}

#[derive(Debug)]
struct CtRecord {
    id: ContainerId,
    state: Mutex<CtState>,
}

type Registry = Arc<Mutex<HashMap<ContainerId, Arc<CtRecord>>>>;

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| DriverError::Config {
        message: format!("{what} lock poisoned"),
    })
}

/// Session over the native backend. Handles live in an in-process registry.
#[derive(Debug, Clone, Default)]
pub struct NativeSession {
    registry: Registry,
}

impl NativeSession {
    /// Opens an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Session for NativeSession {
    fn create_ct(&self, id: &ContainerId) -> Result<Box<dyn ContainerHandle>> {
        let mut registry = lock(&self.registry, "session")?;
        if registry.contains_key(id) {
            return Err(DriverError::AlreadyExists {
                kind: "container",
                id: id.to_string(),
            });
        }
        let record = Arc::new(CtRecord {
            id: id.clone(),
            state: Mutex::new(CtState::default()),
        });
        let _ = registry.insert(id.clone(), Arc::clone(&record));
        tracing::debug!(id = %id, "container handle created");
        Ok(Box::new(NativeHandle {
            record,
            registry: Arc::clone(&self.registry),
        }))
    }

    fn open_ct(&self, id: &ContainerId) -> Result<Box<dyn ContainerHandle>> {
        let registry = lock(&self.registry, "session")?;
        let record = registry.get(id).ok_or_else(|| DriverError::NotFound {
            kind: "container",
            id: id.to_string(),
        })?;
        Ok(Box::new(NativeHandle {
            record: Arc::clone(record),
            registry: Arc::clone(&self.registry),
        }))
    }
}

struct NativeHandle {
    record: Arc<CtRecord>,
    registry: Registry,
}

impl NativeHandle {
    fn configure<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CtState),
    {
        let mut state = lock(&self.record.state, "container")?;
        if state.pid.is_some() {
            return Err(DriverError::Backend {
                operation: "configure",
                message: format!("container {} already launched", self.record.id),
            });
        }
        apply(&mut state);
        Ok(())
    }
}

/// Everything the child needs, prepared before `clone(2)`.
struct LaunchPlan {
    root: PathBuf,
    binds: Vec<(PathBuf, PathBuf, bool, bool)>,
    slave_root: bool,
    auto_proc: bool,
    console: bool,
    path: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| DriverError::Config {
        message: format!("invalid launch string {value:?}: {e}"),
    })
}

impl LaunchPlan {
    /// Prepares mount points on the host, recording every path it creates
    /// in `created` even when a later step fails.
    fn build(
        state: &CtState,
        path: &Path,
        argv: &[String],
        env: &[String],
        created: &mut Vec<PathBuf>,
    ) -> Result<Self> {
        let root = state.root.clone().ok_or_else(|| DriverError::Config {
            message: "no filesystem root set".into(),
        })?;

        let mut binds = Vec::with_capacity(state.mounts.len());
        for mount in &state.mounts {
            let target = resolve_target(&root, &mount.destination)?;
            created.extend(prepare_target(&mount.source, &target)?);
            binds.push((mount.source.clone(), target, mount.writable, mount.private));
        }
        if state.auto_proc {
            create_missing_dirs(&root.join("proc"), created)?;
        }

        Ok(Self {
            binds,
            slave_root: state.ns_mask.mount,
            auto_proc: state.auto_proc,
            console: state
                .mounts
                .iter()
                .any(|m| m.destination == Path::new(CONSOLE_MOUNT)),
            path: c_string(&path.to_string_lossy())?,
            argv: argv.iter().map(|a| c_string(a)).collect::<Result<_>>()?,
            env: env.iter().map(|e| c_string(e)).collect::<Result<_>>()?,
            root,
        })
    }
}

fn dup_onto(fd: i32, target: i32) -> nix::Result<()> {
    // SAFETY: `fd` is open for the duration of the call; dup2 only edits the
    // descriptor table.
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

fn install_stdio(stdio: &ChildStdio) -> nix::Result<()> {
    dup_onto(stdio.stdin.as_raw_fd(), libc::STDIN_FILENO)?;
    dup_onto(stdio.stdout.as_raw_fd(), libc::STDOUT_FILENO)?;
    dup_onto(stdio.stderr.as_raw_fd(), libc::STDERR_FILENO)
}

fn attach_console() -> nix::Result<()> {
    let _ = nix::unistd::setsid()?;
    let console = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(CONSOLE_MOUNT)
        .map_err(|e| e.raw_os_error().map_or(Errno::EIO, Errno::from_raw))?;
    // SAFETY: the console fd is open; TIOCSCTTY takes an integer argument.
    if unsafe { libc::ioctl(console.as_raw_fd(), libc::TIOCSCTTY, 0) } < 0 {
        return Err(Errno::last());
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup_onto(console.as_raw_fd(), target)?;
    }
    Ok(())
}

/// Runs in the cloned child. Returns only on failure.
fn exec_child(
    plan: &LaunchPlan,
    stdio: Option<&ChildStdio>,
) -> std::result::Result<Infallible, (Stage, Errno)> {
    if plan.slave_root {
        make_root_rslave().map_err(|e| (Stage::Propagation, e))?;
    }
    for (source, target, writable, private) in &plan.binds {
        bind_mount(source, target, *writable).map_err(|e| (Stage::Mount, e))?;
        if *private {
            make_private(target).map_err(|e| (Stage::Mount, e))?;
        }
    }
    change_root(&plan.root).map_err(|e| (Stage::Root, e))?;
    if plan.auto_proc {
        mount_proc(Path::new("/proc")).map_err(|e| (Stage::Proc, e))?;
    }
    match stdio {
        Some(stdio) => install_stdio(stdio).map_err(|e| (Stage::Stdio, e))?,
        None if plan.console => attach_console().map_err(|e| (Stage::Console, e))?,
        None => {}
    }
    nix::unistd::execve(&plan.path, &plan.argv, &plan.env).map_err(|e| (Stage::Exec, e))
}

fn report_failure(pipe: &OwnedFd, stage: Stage, errno: Errno) {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
    buf[4..].copy_from_slice(&(errno as i32).to_ne_bytes());
    let _ = nix::unistd::write(pipe, &buf);
}

fn decode_failure(buf: &[u8]) -> Option<(Stage, Errno)> {
    let stage = i32::from_ne_bytes(buf.get(..4)?.try_into().ok()?);
    let errno = i32::from_ne_bytes(buf.get(4..8)?.try_into().ok()?);
    Some((Stage::from_code(stage)?, Errno::from_raw(errno)))
}

fn backend_error(operation: &'static str, message: impl Into<String>) -> DriverError {
    DriverError::Backend {
        operation,
        message: message.into(),
    }
}

fn pid_to_u32(pid: Pid) -> Result<u32> {
    u32::try_from(pid.as_raw()).map_err(|_| backend_error("clone", format!("invalid pid {pid}")))
}

/// Parses the state letter out of a `/proc/<pid>/stat` line.
fn stat_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

fn is_zombie(pid: Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat_state(&stat))
        == Some('Z')
}

impl ContainerHandle for NativeHandle {
    fn id(&self) -> &ContainerId {
        &self.record.id
    }

    fn add_mount(&self, mount: &Mount) -> Result<()> {
        if !mount.destination.is_absolute() {
            return Err(DriverError::Config {
                message: format!(
                    "mount destination must be absolute: {}",
                    mount.destination.display()
                ),
            });
        }
        self.configure(|state| state.mounts.push(mount.clone()))
    }

    fn set_option(&self, option: CtOption) -> Result<()> {
        self.configure(|state| match option {
            CtOption::AutoProcMount => state.auto_proc = true,
        })
    }

    fn set_fs_root(&self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            return Err(DriverError::Config {
                message: format!("filesystem root is not a directory: {}", root.display()),
            });
        }
        self.configure(|state| state.root = Some(root.to_path_buf()))
    }

    fn set_ns_mask(&self, mask: NamespaceConfig) -> Result<()> {
        self.configure(|state| state.ns_mask = mask)
    }

    fn run(
        &self,
        path: &Path,
        argv: &[String],
        env: &[String],
        stdio: Option<ChildStdio>,
    ) -> Result<u32> {
        let id = &self.record.id;
        let mut state = lock(&self.record.state, "container")?;
        if state.pid.is_some() {
            return Err(backend_error("run", format!("container {id} already launched")));
        }
        let mut created = Vec::new();
        let plan = LaunchPlan::build(&state, path, argv, env, &mut created);
        state.created.append(&mut created);
        let plan = plan?;
        let (err_read, err_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| backend_error("run", format!("creating error pipe: {e}")))?;
        let mut stack = vec![0u8; CHILD_STACK_SIZE];

        let child = Box::new(|| -> isize {
            match exec_child(&plan, stdio.as_ref()) {
                Ok(never) => match never {},
                Err((stage, errno)) => {
                    report_failure(&err_write, stage, errno);
                    EXIT_COMMAND_NOT_FOUND as isize
                }
            }
        });
        // SAFETY: the child only runs the prepared plan and then execs or
        // exits; it does not touch locks held by other threads.
        let pid = unsafe {
            nix::sched::clone(
                child,
                &mut stack,
                state.ns_mask.clone_flags(),
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| backend_error("clone", e.to_string()))?;

        // The child owns its copies now; the read below ends at exec or exit.
        drop(err_write);
        drop(stdio);
        let mut report = Vec::new();
        let _ = File::from(err_read)
            .read_to_end(&mut report)
            .map_err(|e| backend_error("run", format!("reading error pipe: {e}")))?;
        if !report.is_empty() {
            let _ = waitpid(pid, None);
            let message = decode_failure(&report).map_or_else(
                || "child failed before exec".to_string(),
                |(stage, errno)| format!("{}: {errno}", stage.describe()),
            );
            return Err(backend_error("run", message));
        }

        let raw = pid_to_u32(pid)?;
        state.pid = Some(pid);
        state.cgroup = match CgroupManager::create(id.as_str()) {
            Ok(cgroup) => {
                if let Err(e) = cgroup.add_process(raw) {
                    tracing::warn!(id = %id, error = %e, "could not join container cgroup");
                }
                Some(cgroup)
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "no container cgroup");
                None
            }
        };
        tracing::info!(id = %id, pid = raw, ns = %state.ns_mask, "container process started");
        Ok(raw)
    }

    fn wait(&self) -> Result<ExitStatus> {
        let pid = {
            let state = lock(&self.record.state, "container")?;
            if let Some(exit) = state.exit {
                return Ok(exit);
            }
            state
                .pid
                .ok_or_else(|| backend_error("wait", "container not launched"))?
        };

        let exit = loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break ExitStatus::Signaled(signal as i32),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(backend_error("wait", e.to_string())),
            }
        };
        lock(&self.record.state, "container")?.exit = Some(exit);
        tracing::info!(id = %self.record.id, pid = %pid, status = %exit, "container process exited");
        Ok(exit)
    }

    fn state(&self) -> Result<RunState> {
        let state = lock(&self.record.state, "container")?;
        let Some(pid) = state.pid else {
            return Ok(RunState::Stopped);
        };
        if state.exit.is_some() {
            return Ok(RunState::Stopped);
        }
        match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) if !is_zombie(pid) => Ok(RunState::Running),
            Ok(()) | Err(Errno::EPERM | Errno::ESRCH) => Ok(RunState::Stopped),
            Err(e) => Err(backend_error("state", e.to_string())),
        }
    }

    fn kill(&self) -> Result<()> {
        let state = lock(&self.record.state, "container")?;
        let pid = state
            .pid
            .ok_or_else(|| backend_error("kill", "container not launched"))?;
        if state.exit.is_some() {
            return Ok(());
        }
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {
                tracing::info!(id = %self.record.id, pid = %pid, "container killed");
                Ok(())
            }
            Err(e) => Err(backend_error("kill", e.to_string())),
        }
    }

    fn destroy(&self) -> Result<()> {
        {
            let mut registry = lock(&self.registry, "session")?;
            if registry
                .get(&self.record.id)
                .is_some_and(|r| Arc::ptr_eq(r, &self.record))
            {
                let _ = registry.remove(&self.record.id);
            }
        }
        let (cgroup, created) = {
            let mut state = lock(&self.record.state, "container")?;
            (state.cgroup.take(), std::mem::take(&mut state.created))
        };
        remove_mount_points(&created);
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.destroy() {
                tracing::warn!(id = %self.record.id, error = %e, "container cgroup left behind");
            }
        }
        tracing::debug!(id = %self.record.id, "container handle destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ContainerId {
        ContainerId::new(raw)
    }

    #[test]
    fn create_twice_fails() {
        let session = NativeSession::new();
        let _ct = session.create_ct(&id("dup")).expect("create");
        let err = session.create_ct(&id("dup")).err().expect("duplicate");
        assert!(matches!(err, DriverError::AlreadyExists { .. }));
    }

    #[test]
    fn open_unknown_is_not_found() {
        let session = NativeSession::new();
        let err = session.open_ct(&id("ghost")).err().expect("unknown");
        assert!(err.is_not_found());
    }

    #[test]
    fn reopened_handle_shares_state_and_destroy_unregisters() {
        let session = NativeSession::new();
        let ct = session.create_ct(&id("c1")).expect("create");
        let reopened = session.open_ct(&id("c1")).expect("open");
        assert_eq!(reopened.id(), ct.id());
        assert_eq!(reopened.state().expect("state"), RunState::Stopped);

        reopened.destroy().expect("destroy");
        assert!(session.open_ct(&id("c1")).is_err());
        let _again = session.create_ct(&id("c1")).expect("id reusable");
    }

    #[test]
    fn unlaunched_handle_rejects_wait_and_kill() {
        let session = NativeSession::new();
        let ct = session.create_ct(&id("idle")).expect("create");
        assert!(ct.wait().is_err());
        assert!(ct.kill().is_err());
    }

    #[test]
    fn relative_mount_destination_is_rejected() {
        let session = NativeSession::new();
        let ct = session.create_ct(&id("m")).expect("create");
        let err = ct.add_mount(&Mount::new("/tmp", "tmp", true)).unwrap_err();
        assert!(matches!(err, DriverError::Config { .. }));
    }

    #[test]
    fn run_without_root_is_a_config_error() {
        let session = NativeSession::new();
        let ct = session.create_ct(&id("noroot")).expect("create");
        let err = ct
            .run(Path::new("/bin/true"), &["true".into()], &[], None)
            .unwrap_err();
        assert!(matches!(err, DriverError::Config { .. }));
    }

    #[test]
    fn fs_root_must_be_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("file");
        std::fs::write(&file, "").expect("write");
        let session = NativeSession::new();
        let ct = session.create_ct(&id("fsroot")).expect("create");
        assert!(ct.set_fs_root(&file).is_err());
        ct.set_fs_root(dir.path()).expect("dir root");
    }

    #[test]
    fn destroy_removes_created_mount_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).expect("rootfs");
        let source = dir.path().join("config.env");
        std::fs::write(&source, "A=1\n").expect("source");

        let session = NativeSession::new();
        let ct = session.create_ct(&id("points")).expect("create");
        ct.set_fs_root(&rootfs).expect("root");
        ct.add_mount(&Mount::new(&source, "/etc/ct/env", false)).expect("mount");
        ct.set_option(CtOption::AutoProcMount).expect("proc");
        // The NUL byte fails the launch after mount points are prepared.
        let err = ct
            .run(Path::new("/sbin/init"), &["bad\0arg".into()], &[], None)
            .unwrap_err();
        assert!(matches!(err, DriverError::Config { .. }));
        assert!(rootfs.join("etc/ct/env").is_file());
        assert!(rootfs.join("proc").is_dir());

        ct.destroy().expect("destroy");
        assert!(!rootfs.join("etc").exists());
        assert!(!rootfs.join("proc").exists());
        assert!(source.exists());
    }

    #[test]
    fn stat_state_handles_spaces_in_comm() {
        assert_eq!(stat_state("42 (my proc) Z 1 42"), Some('Z'));
        assert_eq!(stat_state("7 (sh) S 1 7"), Some('S'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn failure_report_round_trip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(Stage::Exec as i32).to_ne_bytes());
        buf.extend_from_slice(&(Errno::ENOENT as i32).to_ne_bytes());
        assert_eq!(decode_failure(&buf), Some((Stage::Exec, Errno::ENOENT)));
        assert_eq!(decode_failure(&buf[..3]), None);
    }

    fn can_launch() -> bool {
        nix::unistd::geteuid().is_root() && Path::new("/bin/sh").exists()
    }

    #[test]
    fn launches_and_reaps_in_host_root() {
        if !can_launch() {
            return;
        }
        let session = NativeSession::new();
        let ct = session.create_ct(&id("native-exit")).expect("create");
        ct.set_fs_root(Path::new("/")).expect("root");
        ct.set_ns_mask(NamespaceConfig::default()).expect("mask");

        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let pid = ct.run(Path::new("/bin/sh"), &argv, &[], None).expect("run");
        assert!(pid > 0);
        assert_eq!(ct.wait().expect("wait"), ExitStatus::Exited(3));
        assert_eq!(ct.state().expect("state"), RunState::Stopped);
        ct.destroy().expect("destroy");
    }

    #[test]
    fn exec_failure_is_reported_by_run() {
        if !can_launch() {
            return;
        }
        let session = NativeSession::new();
        let ct = session.create_ct(&id("native-missing")).expect("create");
        ct.set_fs_root(Path::new("/")).expect("root");
        let err = ct
            .run(Path::new("/no/such/binary"), &["x".into()], &[], None)
            .unwrap_err();
        assert!(err.to_string().contains("executing"), "{err}");
        ct.destroy().expect("destroy");
    }

    #[test]
    fn kill_stops_a_running_process() {
        if !can_launch() {
            return;
        }
        let session = NativeSession::new();
        let ct = session.create_ct(&id("native-kill")).expect("create");
        ct.set_fs_root(Path::new("/")).expect("root");
        let argv = vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let _pid = ct.run(Path::new("/bin/sh"), &argv, &[], None).expect("run");
        assert_eq!(ct.state().expect("state"), RunState::Running);

        ct.kill().expect("kill");
        assert_eq!(
            ct.wait().expect("wait"),
            ExitStatus::Signaled(Signal::SIGKILL as i32)
        );
        ct.destroy().expect("destroy");
    }
}
