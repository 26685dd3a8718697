//! Stdio attachment for a spawned container process.
//!
//! Two variants share the [`Terminal`] contract. [`TtyTerminal`] relays
//! between the caller and a pseudo-terminal master whose slave is mounted
//! into the container as its console. [`StdTerminal`] allocates three pipe
//! pairs and hands the child-facing ends to the backend.
//!
//! Relays are detached threads that end when either side of their stream
//! closes. Nothing joins them.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;

use ctdriver_common::error::{DriverError, Result};
use nix::fcntl::OFlag;

use crate::command::{Command, Pipes};

/// Child-facing stdio endpoints, installed as fds 0, 1 and 2 of the
/// container process.
#[derive(Debug)]
pub struct ChildStdio {
    /// Read end of the stdin pipe.
    pub stdin: OwnedFd,
    /// Write end of the stdout pipe.
    pub stdout: OwnedFd,
    /// Write end of the stderr pipe.
    pub stderr: OwnedFd,
}

/// Stdio wiring for one launch.
pub trait Terminal: Send + fmt::Debug {
    /// Starts the relays. Returns the endpoints the backend must install as
    /// the child's stdio, or `None` when the child uses its console.
    ///
    /// # Errors
    ///
    /// Returns an error on a second attach or if pipes or relay threads
    /// cannot be created.
    fn attach(&mut self) -> Result<Option<ChildStdio>>;

    /// Sets the pseudo-terminal master the relays read and write.
    fn set_master(&mut self, master: File);

    /// Resizes the terminal window.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant has no resizable terminal or the
    /// ioctl fails.
    fn resize(&self, height: u16, width: u16) -> Result<()>;

    /// Releases the host-side endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be released.
    fn close(&mut self) -> Result<()>;
}

fn terminal_error(message: impl Into<String>) -> DriverError {
    DriverError::Terminal {
        message: message.into(),
    }
}

fn spawn_relay<R, W>(name: &str, mut from: R, mut to: W) -> Result<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let relay = name.to_string();
    let _detached = std::thread::Builder::new()
        .name(relay.clone())
        .spawn(move || {
            match std::io::copy(&mut from, &mut to) {
                Ok(bytes) => tracing::trace!(relay = %relay, bytes, "relay finished"),
                Err(e) => tracing::debug!(relay = %relay, error = %e, "relay stopped"),
            }
            let _ = to.flush();
        })
        .map_err(|e| terminal_error(format!("spawning {name} relay: {e}")))?;
    Ok(())
}

/// Interactive terminal backed by a pseudo-terminal master.
pub struct TtyTerminal {
    pipes: Option<Pipes>,
    master: Option<File>,
}

impl TtyTerminal {
    /// Creates an unattached terminal around the caller's endpoints.
    #[must_use]
    pub const fn new(pipes: Pipes) -> Self {
        Self {
            pipes: Some(pipes),
            master: None,
        }
    }
}

impl fmt::Debug for TtyTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtyTerminal")
            .field("attached", &self.pipes.is_none())
            .field("master", &self.master.as_ref().map(AsRawFd::as_raw_fd))
            .finish()
    }
}

impl Terminal for TtyTerminal {
    fn attach(&mut self) -> Result<Option<ChildStdio>> {
        let pipes = self
            .pipes
            .take()
            .ok_or_else(|| terminal_error("terminal already attached"))?;
        let Some(master) = &self.master else {
            // An externally allocated console: its owner does the relaying.
            tracing::debug!("no pty master set, skipping relays");
            return Ok(None);
        };

        let reader = master
            .try_clone()
            .map_err(|e| terminal_error(format!("cloning pty master: {e}")))?;
        spawn_relay("pty-stdout", reader, pipes.stdout)?;

        if let Some(stdin) = pipes.stdin {
            let writer = master
                .try_clone()
                .map_err(|e| terminal_error(format!("cloning pty master: {e}")))?;
            spawn_relay("pty-stdin", stdin, writer)?;
        }
        Ok(None)
    }

    fn set_master(&mut self, master: File) {
        self.master = Some(master);
    }

    fn resize(&self, height: u16, width: u16) -> Result<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| terminal_error("no pty master to resize"))?;
        let size = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: the fd is a live pty master and `size` outlives the call.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &raw const size) };
        if rc < 0 {
            return Err(terminal_error(format!(
                "resizing pty: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.master = None;
        Ok(())
    }
}

/// Non-interactive terminal backed by three pipe pairs.
pub struct StdTerminal {
    pipes: Option<Pipes>,
}

impl StdTerminal {
    /// Creates an unattached terminal around the caller's endpoints.
    #[must_use]
    pub const fn new(pipes: Pipes) -> Self {
        Self { pipes: Some(pipes) }
    }
}

impl fmt::Debug for StdTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdTerminal")
            .field("attached", &self.pipes.is_none())
            .finish()
    }
}

fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| terminal_error(format!("creating pipe: {e}")))
}

impl Terminal for StdTerminal {
    fn attach(&mut self) -> Result<Option<ChildStdio>> {
        let pipes = self
            .pipes
            .take()
            .ok_or_else(|| terminal_error("terminal already attached"))?;

        let (stdin_read, stdin_write) = cloexec_pipe()?;
        let (stdout_read, stdout_write) = cloexec_pipe()?;
        let (stderr_read, stderr_write) = cloexec_pipe()?;

        match pipes.stdin {
            Some(stdin) => spawn_relay("stdin", stdin, File::from(stdin_write))?,
            // The child reads EOF instead of blocking.
            None => drop(stdin_write),
        }
        spawn_relay("stdout", File::from(stdout_read), pipes.stdout)?;
        spawn_relay("stderr", File::from(stderr_read), pipes.stderr)?;

        Ok(Some(ChildStdio {
            stdin: stdin_read,
            stdout: stdout_write,
            stderr: stderr_write,
        }))
    }

    fn set_master(&mut self, _master: File) {
        tracing::debug!("ignoring pty master for pipe terminal");
    }

    fn resize(&self, _height: u16, _width: u16) -> Result<()> {
        Err(terminal_error("pipe terminal cannot be resized"))
    }

    fn close(&mut self) -> Result<()> {
        self.pipes = None;
        Ok(())
    }
}

/// Allocates a pseudo-terminal pair, returning the master and the slave's
/// device path.
///
/// # Errors
///
/// Returns an error if any pty syscall fails.
pub fn open_pty() -> Result<(File, PathBuf)> {
    let pty = |step: &str, e: nix::Error| terminal_error(format!("{step}: {e}"));
    let master = nix::pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
        .map_err(|e| pty("posix_openpt", e))?;
    nix::pty::grantpt(&master).map_err(|e| pty("grantpt", e))?;
    nix::pty::unlockpt(&master).map_err(|e| pty("unlockpt", e))?;
    let slave = nix::pty::ptsname_r(&master).map_err(|e| pty("ptsname", e))?;

    // SAFETY: `into_raw_fd` hands over sole ownership of the master fd.
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    Ok((master, PathBuf::from(slave)))
}

/// Chooses and installs the terminal for `command`.
///
/// Interactive commands without a console get a fresh pty whose slave
/// becomes the console device. A console supplied by the caller is used as
/// is, with the caller relaying through its own master.
///
/// # Errors
///
/// Returns an error if a pty cannot be allocated.
pub fn set_terminal(command: &mut Command, pipes: Pipes) -> Result<()> {
    let terminal: Box<dyn Terminal> = if command.tty {
        let mut tty = TtyTerminal::new(pipes);
        if command.console.is_none() {
            let (master, slave) = open_pty()?;
            tracing::debug!(id = %command.id, console = %slave.display(), "pty allocated");
            tty.set_master(master);
            command.console = Some(slave);
        }
        Box::new(tty)
    } else {
        Box::new(StdTerminal::new(pipes))
    };
    command.terminal = Some(terminal);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctdriver_common::types::ContainerId;

    fn pipe_sink() -> (File, Box<dyn Write + Send>) {
        let (read, write) = cloexec_pipe().expect("pipe");
        (File::from(read), Box::new(File::from(write)))
    }

    #[test]
    fn std_terminal_without_stdin_gives_child_eof() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let mut terminal = StdTerminal::new(Pipes::new(None, stdout, stderr));
        let stdio = terminal.attach().expect("attach").expect("child stdio");

        let mut child_stdin = File::from(stdio.stdin);
        let mut buf = Vec::new();
        let n = child_stdin.read_to_end(&mut buf).expect("read");
        assert_eq!(n, 0);
    }

    #[test]
    fn std_terminal_relays_stdin_and_output() {
        let (mut out, stdout) = pipe_sink();
        let (mut err, stderr) = pipe_sink();
        let stdin: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(b"input".to_vec()));
        let mut terminal = StdTerminal::new(Pipes::new(Some(stdin), stdout, stderr));
        let stdio = terminal.attach().expect("attach").expect("child stdio");

        let mut child_in = String::new();
        let _ = File::from(stdio.stdin)
            .read_to_string(&mut child_in)
            .expect("read stdin");
        assert_eq!(child_in, "input");

        File::from(stdio.stdout).write_all(b"out").expect("write stdout");
        File::from(stdio.stderr).write_all(b"err").expect("write stderr");

        let mut relayed = String::new();
        let _ = out.read_to_string(&mut relayed).expect("read out");
        assert_eq!(relayed, "out");
        relayed.clear();
        let _ = err.read_to_string(&mut relayed).expect("read err");
        assert_eq!(relayed, "err");
    }

    #[test]
    fn second_attach_fails() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let mut terminal = StdTerminal::new(Pipes::new(None, stdout, stderr));
        let _stdio = terminal.attach().expect("attach");
        assert!(matches!(terminal.attach(), Err(DriverError::Terminal { .. })));
    }

    #[test]
    fn std_terminal_cannot_resize() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let terminal = StdTerminal::new(Pipes::new(None, stdout, stderr));
        assert!(terminal.resize(24, 80).is_err());
    }

    #[test]
    fn set_terminal_uses_pipes_for_non_interactive() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let mut cmd = Command::new(ContainerId::new("c1"), "/rootfs", "true", vec![]);
        set_terminal(&mut cmd, Pipes::new(None, stdout, stderr)).expect("set terminal");
        assert!(cmd.console.is_none());
        let mut terminal = cmd.terminal.take().expect("terminal");
        assert!(terminal.attach().expect("attach").is_some());
    }

    #[test]
    fn set_terminal_allocates_console_for_tty() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let mut cmd = Command::new(ContainerId::new("c1"), "/rootfs", "sh", vec![]);
        cmd.tty = true;
        if set_terminal(&mut cmd, Pipes::new(None, stdout, stderr)).is_err() {
            // No pty support in this environment.
            return;
        }
        let console = cmd.console.clone().expect("console");
        assert!(console.starts_with("/dev/pts"));
        let terminal = cmd.terminal.as_ref().expect("terminal");
        terminal.resize(40, 120).expect("resize");
    }

    #[test]
    fn tty_with_external_console_attaches_without_relays() {
        let (_out, stdout) = pipe_sink();
        let (_err, stderr) = pipe_sink();
        let mut cmd = Command::new(ContainerId::new("c1"), "/rootfs", "sh", vec![]);
        cmd.tty = true;
        cmd.console = Some(PathBuf::from("/dev/pts/77"));
        set_terminal(&mut cmd, Pipes::new(None, stdout, stderr)).expect("set terminal");
        assert_eq!(cmd.console.as_deref(), Some(std::path::Path::new("/dev/pts/77")));
        let mut terminal = cmd.terminal.take().expect("terminal");
        assert!(terminal.attach().expect("attach").is_none());
    }
}
