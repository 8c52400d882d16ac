//! The long-lived shell subprocess and its command protocol.

use crate::pipes::{AuxPipes, PipeError};
use crate::protocol::{ReturnCode, frame_auxiliary, frame_command, return_code_query};
use crate::tee::{Stream, TeeOutput, TeeSinks, TeeTargets, tee};
use chrono::Utc;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Shell used when `$SHELL` is unset.
const FALLBACK_SHELL: &str = "/bin/sh";

/// How long the shell gets to exit on its own after stdin is closed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn shell {}: {source}", shell.display())]
    Spawn {
        shell: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open output file {}: {source}", path.display())]
    SinkFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "There was a problem running the command `{command}`. This is a fatal error and we \
         cannot continue. Ensure that the syntax of the command is correct."
    )]
    CommandFailed {
        command: String,
        #[source]
        source: PipeError,
    },
    #[error("auxiliary channel closed while running `{command}`")]
    AuxiliaryClosed {
        command: String,
        #[source]
        source: PipeError,
    },
    #[error("shell session is closed or broken")]
    Broken,
    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Console writers used for live passthrough.
///
/// Either side defaults to the process's own stdout/stderr when `None`.
#[derive(Default)]
pub struct SessionIo {
    pub stdout: Option<Box<dyn Write + Send>>,
    pub stderr: Option<Box<dyn Write + Send>>,
}

/// Sinks and stdin handling for one [`ShellSession::run`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub stdout: TeeSinks,
    pub stderr: TeeSinks,
    /// Run the command with stdin redirected from `/dev/null`.
    pub devnull_stdin: bool,
}

/// Outcome of one framed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// The command text as written to the shell.
    pub args: String,
    pub returncode: ReturnCode,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub start: i64,
    pub finish: i64,
    /// Wall-clock duration in milliseconds.
    pub wall: i64,
}

/// Output of an auxiliary query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The shell's own output pipes together with the console writers they
/// are echoed to. Held for the whole of a `run` call.
struct MainStreams {
    stdout: ChildStdout,
    stderr: ChildStderr,
    console_out: Box<dyn Write + Send>,
    console_err: Box<dyn Write + Send>,
}

/// A persistent shell that runs one command at a time.
///
/// Commands go to the shell's stdin and their output is read back from the
/// shell's stdout and stderr up to an end-of-read marker. Introspection
/// queries use a separate pair of auxiliary pipes so they never mix with a
/// command's output. Auxiliary queries may be issued from another thread
/// while a command runs; they are answered once the command finishes.
pub struct ShellSession {
    shell: PathBuf,
    pid: u32,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    main: Mutex<Option<MainStreams>>,
    aux: Mutex<Option<AuxPipes>>,
    broken: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clear `FD_CLOEXEC` in the forked child so the shell inherits `fd`.
///
/// Only called between fork and exec.
fn inherit_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: the descriptor is one of the auxiliary write ends, which stay
    // open in the parent until the spawn has returned.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = FdFlag::from_bits_truncate(
        fcntl(borrowed, FcntlArg::F_GETFD).map_err(|_| io::Error::last_os_error())?,
    );
    let mut new_flags = flags;
    new_flags.remove(FdFlag::FD_CLOEXEC);
    if new_flags != flags {
        fcntl(borrowed, FcntlArg::F_SETFD(new_flags)).map_err(|_| io::Error::last_os_error())?;
    }
    Ok(())
}

impl ShellSession {
    /// Spawn `$SHELL` (or `/bin/sh`) in `pwd`, echoing to the real console.
    pub fn spawn(pwd: impl AsRef<Path>, login_shell: bool) -> Result<Self, SessionError> {
        Self::spawn_with_io(pwd, login_shell, SessionIo::default())
    }

    /// Spawn the shell with custom console writers.
    pub fn spawn_with_io(
        pwd: impl AsRef<Path>,
        login_shell: bool,
        console: SessionIo,
    ) -> Result<Self, SessionError> {
        let shell = std::env::var_os("SHELL")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL));

        let mut aux = AuxPipes::open()?;
        let (aux_out, aux_err) = aux.child_fds();

        let mut cmd = Command::new(&shell);
        if login_shell {
            cmd.arg("-l");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                inherit_fd(aux_out)?;
                inherit_fd(aux_err)
            });
        }

        let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
            shell: shell.clone(),
            source,
        })?;
        aux.release_write_ends();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::Spawn {
                shell,
                source: io::Error::other("shell stdio was not captured"),
            });
        };

        let pid = child.id();
        tracing::debug!(shell = %shell.display(), pid, login_shell, "spawned shell session");

        let session = Self {
            shell,
            pid,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            main: Mutex::new(Some(MainStreams {
                stdout,
                stderr,
                console_out: console.stdout.unwrap_or_else(|| Box::new(io::stdout())),
                console_err: console.stderr.unwrap_or_else(|| Box::new(io::stderr())),
            })),
            aux: Mutex::new(Some(aux)),
            broken: AtomicBool::new(false),
        };
        session.shell_cd(pwd.as_ref())?;
        Ok(session)
    }

    /// Path of the spawned shell executable.
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Process id of the spawned shell.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the session can still run commands.
    pub fn is_usable(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && lock(&self.stdin).is_some()
    }

    /// Run `command` in the shell and wait for its output on both streams.
    ///
    /// A non-zero exit status is reported in the result, not as an error.
    /// If either stream closes before its end-of-read marker the shell is
    /// considered dead: the session is marked broken and every later call
    /// fails with [`SessionError::Broken`].
    pub fn run(&self, command: &str, options: &RunOptions) -> Result<RunOutput, SessionError> {
        self.ensure_usable()?;

        let open = |sinks: &TeeSinks| {
            sinks.open_file().map_err(|source| SessionError::SinkFile {
                path: sinks.file.clone().unwrap_or_default(),
                source,
            })
        };
        let stdout_file = open(&options.stdout)?;
        let stderr_file = open(&options.stderr)?;

        let mut main = lock(&self.main);
        let Some(MainStreams {
            stdout,
            stderr,
            console_out,
            console_err,
        }) = main.as_mut()
        else {
            return Err(SessionError::Broken);
        };
        let start = Utc::now().timestamp_millis();
        tracing::debug!(command, "running command");
        self.write_stdin(&frame_command(command, options.devnull_stdin))?;

        let console_out: &mut (dyn Write + Send) = &mut **console_out;
        let console_err: &mut (dyn Write + Send) = &mut **console_err;
        let out_targets = TeeTargets {
            console: options.stdout.console.then_some(console_out),
            capture: options.stdout.capture,
            file: stdout_file,
        };
        let err_targets = TeeTargets {
            console: options.stderr.console.then_some(console_err),
            capture: options.stderr.capture,
            file: stderr_file,
        };

        let (out, err) = thread::scope(|s| {
            let out = s.spawn(move || tee(stdout, Stream::Stdout, out_targets));
            let err = s.spawn(move || tee(stderr, Stream::Stderr, err_targets));
            (join_tee(out.join()), join_tee(err.join()))
        });
        drop(main);

        let (out, err) = match (out, err) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(source), _) | (_, Err(source)) => {
                tracing::error!(command, "shell stream failed: {}", source);
                self.mark_broken();
                return Err(SessionError::CommandFailed {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let reply = self.auxiliary_command(&return_code_query(), true)?;
        let returncode = ReturnCode::parse(&reply.stdout);
        if returncode == ReturnCode::Unknown {
            tracing::warn!(command, reply = %reply.stdout, "could not parse return code");
        }

        let finish = Utc::now().timestamp_millis();
        tracing::debug!(
            command,
            %returncode,
            stdout_bytes = out.bytes,
            stderr_bytes = err.bytes,
            wall = finish - start,
            "command finished"
        );

        Ok(RunOutput {
            args: command.to_string(),
            returncode,
            stdout: out.captured,
            stderr: err.captured,
            start,
            finish,
            wall: finish - start,
        })
    }

    /// Run an introspection command over the auxiliary channel.
    ///
    /// The reply is decoded leniently and trimmed when `strip` is set.
    pub fn auxiliary_command(&self, command: &str, strip: bool) -> Result<AuxOutput, SessionError> {
        self.ensure_usable()?;

        let mut aux = lock(&self.aux);
        let Some(aux) = aux.as_mut() else {
            return Err(SessionError::Broken);
        };
        let (out_fd, err_fd) = aux.child_fds();
        tracing::trace!(command, "auxiliary command");
        self.write_stdin(&frame_auxiliary(command, out_fd, err_fd))?;

        let (stdout, stderr) = aux.read_reply().map_err(|source| {
            tracing::error!(command, "auxiliary channel failed: {}", source);
            self.mark_broken();
            SessionError::AuxiliaryClosed {
                command: command.to_string(),
                source,
            }
        })?;

        let decode = |bytes: Vec<u8>| {
            let text = String::from_utf8_lossy(&bytes);
            if strip {
                text.trim().to_string()
            } else {
                text.into_owned()
            }
        };
        Ok(AuxOutput {
            stdout: decode(stdout),
            stderr: decode(stderr),
        })
    }

    /// Change directory in both this process and the shell.
    pub fn cd(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        std::env::set_current_dir(path)?;
        self.shell_cd(path)
    }

    /// The shell's current working directory.
    pub fn pwd(&self) -> Result<String, SessionError> {
        Ok(self.auxiliary_command("pwd", true)?.stdout)
    }

    /// Close the shell's stdin, reap it and release every pipe the session
    /// holds. Safe to call more than once.
    pub fn close(&self) {
        self.broken.store(true, Ordering::SeqCst);
        drop(lock(&self.stdin).take());
        if let Some(child) = lock(&self.child).take() {
            self.reap(child);
        }
        drop(lock(&self.main).take());
        drop(lock(&self.aux).take());
    }

    /// Wait for the shell to exit after stdin closed, terminating it if it
    /// does not.
    fn reap(&self, mut child: Child) {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid = self.pid, %status, "shell exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(pid = self.pid, "failed to poll shell: {}", e);
                    break;
                }
            }
        }

        tracing::warn!(pid = self.pid, "shell did not exit after stdin closed, terminating");
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid = self.pid, "SIGTERM failed: {}", e);
        }
        thread::sleep(Duration::from_millis(50));
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }

    fn shell_cd(&self, path: &Path) -> Result<(), SessionError> {
        let escaped = shell_escape::escape(Cow::from(path.to_string_lossy()));
        let reply = self.auxiliary_command(&format!("cd {escaped}"), true)?;
        if !reply.stderr.is_empty() {
            tracing::warn!(path = %path.display(), "shell cd failed: {}", reply.stderr);
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SessionError::Broken);
        }
        Ok(())
    }

    fn write_stdin(&self, text: &str) -> Result<(), SessionError> {
        let mut stdin = lock(&self.stdin);
        let Some(writer) = stdin.as_mut() else {
            return Err(SessionError::Broken);
        };
        if let Err(e) = writer.write_all(text.as_bytes()).and_then(|_| writer.flush()) {
            tracing::error!("failed to write to shell stdin: {}", e);
            *stdin = None;
            self.broken.store(true, Ordering::SeqCst);
            return Err(SessionError::Io(e));
        }
        Ok(())
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
        drop(lock(&self.stdin).take());
    }
}

fn join_tee(
    joined: thread::Result<Result<TeeOutput, PipeError>>,
) -> Result<TeeOutput, PipeError> {
    joined.unwrap_or_else(|_| Err(PipeError::Io(io::Error::other("tee worker panicked"))))
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl PartialEq for ShellSession {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (self.pwd(), other.pwd()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("broken", &self.broken.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_names_command() {
        let err = SessionError::CommandFailed {
            command: "echo (oops".into(),
            source: PipeError::Closed { stream: "stdout" },
        };
        assert!(err.to_string().contains("`echo (oops`"));
        assert!(err.to_string().contains("fatal error"));
    }

    #[test]
    fn test_close_releases_pipes() {
        let dir = std::env::temp_dir();
        let session = ShellSession::spawn(&dir, false).unwrap();
        assert!(lock(&session.main).is_some());
        assert!(lock(&session.aux).is_some());

        session.close();
        assert!(lock(&session.stdin).is_none());
        assert!(lock(&session.child).is_none());
        assert!(lock(&session.main).is_none());
        assert!(lock(&session.aux).is_none());
    }

    #[test]
    fn test_run_options_default_is_silent() {
        let options = RunOptions::default();
        assert!(!options.stdout.console);
        assert!(!options.stdout.capture);
        assert!(options.stderr.file.is_none());
        assert!(!options.devnull_stdin);
    }
}
