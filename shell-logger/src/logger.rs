//! The log book: a named sequence of commands, messages and child loggers.

use crate::config::{LogOptions, LoggerConfig};
use crate::duration::{format_wall, strfdelta};
use crate::error::{Error, Result};
use crate::orchestrator::{CommandResult, Execution, Orchestrator};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use shell_logger_session::{ReturnCode, RunOptions, ShellSession, TeeSinks};
use shell_logger_stats::SamplerRegistry;
use shell_logger_trace::TracerRegistry;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DURATION_FORMAT: &str = "{hrs}h {min}m {sec}s";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Unique id for one logged command: `cmd_` and nine lowercase characters.
pub fn execution_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("cmd_{}", &id[..9])
}

/// A command run through [`ShellLogger::log`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub msg: String,
    pub cmd: String,
    pub cmd_id: String,
    pub timestamp: String,
    pub duration: String,
    pub cwd: Option<PathBuf>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub result: CommandResult,
}

impl CommandRecord {
    pub fn return_code(&self) -> ReturnCode {
        self.result.returncode
    }
}

/// A message recorded with [`ShellLogger::print`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub msg: String,
    pub timestamp: String,
}

#[derive(Debug)]
pub enum LogEntry {
    Command(Box<CommandRecord>),
    Message(MessageRecord),
    Child(ShellLogger),
}

/// What [`ShellLogger::log`] hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub return_code: ReturnCode,
    /// Only kept when `return_info` was requested.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub trace: Option<String>,
}

/// Runs commands in its own shell session and records each one.
///
/// Output streams are written to files under [`ShellLogger::stream_dir`]
/// as they are produced, so a record stays complete even when the
/// captured text is not kept in memory.
#[derive(Debug)]
pub struct ShellLogger {
    name: String,
    log_dir: PathBuf,
    stream_dir: PathBuf,
    indent: usize,
    login_shell: bool,
    interval: f64,
    init_time: DateTime<Local>,
    done_time: DateTime<Local>,
    duration: Option<String>,
    log_book: Vec<LogEntry>,
    session: ShellSession,
    samplers: SamplerRegistry,
    tracers: TracerRegistry,
}

impl ShellLogger {
    /// Create a top-level logger with its own stream directory.
    pub fn new(name: impl Into<String>, config: &LoggerConfig) -> Result<Self> {
        let init_time = Local::now();
        let log_dir = create_dir(&config.log_dir)?;

        let prefix = format!("{}_", init_time.format(TIMESTAMP_FORMAT));
        let stream_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&log_dir)
            .map_err(|source| Error::CreateDir {
                path: log_dir.clone(),
                source,
            })?
            .keep();
        tracing::debug!(stream_dir = %stream_dir.display(), "created stream directory");

        Self::build(
            name.into(),
            log_dir,
            stream_dir,
            0,
            config.login_shell,
            config.interval,
            init_time,
        )
    }

    fn build(
        name: String,
        log_dir: PathBuf,
        stream_dir: PathBuf,
        indent: usize,
        login_shell: bool,
        interval: f64,
        init_time: DateTime<Local>,
    ) -> Result<Self> {
        let session = ShellSession::spawn(std::env::current_dir()?, login_shell)?;
        Ok(Self {
            name,
            log_dir,
            stream_dir,
            indent,
            login_shell,
            interval,
            init_time,
            done_time: init_time,
            duration: None,
            log_book: Vec::new(),
            session,
            samplers: SamplerRegistry::with_defaults(),
            tracers: TracerRegistry::with_defaults(),
        })
    }

    /// Replace the sampler registry, e.g. to add custom collectors.
    pub fn with_samplers(mut self, samplers: SamplerRegistry) -> Self {
        self.samplers = samplers;
        self
    }

    /// Replace the tracer registry.
    pub fn with_tracers(mut self, tracers: TracerRegistry) -> Self {
        self.tracers = tracers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn stream_dir(&self) -> &Path {
        &self.stream_dir
    }

    pub fn indent(&self) -> usize {
        self.indent
    }

    pub fn login_shell(&self) -> bool {
        self.login_shell
    }

    /// Whether this is the top-level logger.
    pub fn is_parent(&self) -> bool {
        self.indent == 0
    }

    pub fn init_time(&self) -> DateTime<Local> {
        self.init_time
    }

    pub fn done_time(&self) -> DateTime<Local> {
        self.done_time
    }

    /// Total duration, set by [`ShellLogger::finalize`].
    pub fn duration(&self) -> Option<&str> {
        self.duration.as_deref()
    }

    pub fn log_book(&self) -> &[LogEntry] {
        &self.log_book
    }

    pub fn session(&self) -> &ShellSession {
        &self.session
    }

    /// Run `cmd` and record it under `msg`.
    ///
    /// A non-zero exit status is recorded and returned, not raised. Errors
    /// are bad sampler or tracer requests, which fail before the command
    /// is sent, and failures of the shell session itself.
    pub fn log(&mut self, msg: &str, cmd: &str, options: &LogOptions) -> Result<LogSummary> {
        let start = Local::now();
        let cmd_id = execution_id();
        let timestamp = start.format(TIMESTAMP_FORMAT).to_string();

        let stdout_path = self.stream_dir.join(format!("{timestamp}_{cmd_id}_stdout"));
        let stderr_path = self.stream_dir.join(format!("{timestamp}_{cmd_id}_stderr"));
        let trace_path = options
            .trace
            .as_ref()
            .map(|_| self.stream_dir.join(format!("{timestamp}_{cmd_id}_trace")));

        // The stream files exist even for commands that print nothing.
        for path in [&stdout_path, &stderr_path] {
            File::options().create(true).append(true).open(path)?;
        }

        if options.verbose {
            println!("{cmd}");
        }

        let execution = Execution {
            command: cmd,
            cwd: options.cwd.as_deref(),
            run: RunOptions {
                stdout: TeeSinks {
                    console: options.live_stdout,
                    capture: options.return_info,
                    file: Some(stdout_path.clone()),
                },
                stderr: TeeSinks {
                    console: options.live_stderr,
                    capture: options.return_info,
                    file: Some(stderr_path.clone()),
                },
                devnull_stdin: options.stdin_redirect,
            },
            measure: &options.measure,
            interval: options.interval.unwrap_or(self.interval),
            trace: options
                .trace
                .as_ref()
                .zip(trace_path.as_ref())
                .map(|(trace, path)| trace.to_spec(path)),
            keep_trace: options.return_info,
        };

        tracing::debug!(cmd_id = %cmd_id, command = cmd, logger = %self.name, "logging command");
        let result =
            Orchestrator::new(&self.session, &self.samplers, &self.tracers).execute(&execution)?;

        let summary = LogSummary {
            return_code: result.returncode,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            trace: result.trace.clone(),
        };
        self.log_book.push(LogEntry::Command(Box::new(CommandRecord {
            msg: msg.to_string(),
            cmd: cmd.to_string(),
            cmd_id,
            timestamp,
            duration: format_wall(result.wall),
            cwd: options.cwd.clone(),
            stdout_path,
            stderr_path,
            result,
        })));
        Ok(summary)
    }

    /// Print `msg` and record it.
    pub fn print(&mut self, msg: &str) {
        println!("{msg}");
        self.log_book.push(LogEntry::Message(MessageRecord {
            msg: msg.to_string(),
            timestamp: Local::now().to_string(),
        }));
    }

    /// Add a child logger one level deeper, sharing this logger's
    /// directories and running its own shell.
    pub fn add_child(&mut self, name: impl Into<String>) -> Result<&mut ShellLogger> {
        let child = Self::build(
            name.into(),
            self.log_dir.clone(),
            self.stream_dir.clone(),
            self.indent + 1,
            self.login_shell,
            self.interval,
            Local::now(),
        )?;
        tracing::debug!(parent = %self.name, child = %child.name, "added child logger");
        let name = child.name.clone();
        self.log_book.push(LogEntry::Child(child));
        let Some(LogEntry::Child(child)) = self.log_book.last_mut() else {
            return Err(Error::MissingChild { name });
        };
        Ok(child)
    }

    /// Move the log directory and everything in it to `new_log_dir`.
    ///
    /// Stream directories and recorded file paths of this logger and all
    /// of its children follow. Children share their parent's directory, so
    /// only the top-level logger may be moved.
    pub fn change_log_dir(&mut self, new_log_dir: impl AsRef<Path>) -> Result<()> {
        if !self.is_parent() {
            return Err(Error::ChildLogDir {
                name: self.name.clone(),
            });
        }

        let from = self.log_dir.clone();
        let to = std::path::absolute(new_log_dir.as_ref())?;
        let move_error = |source| Error::MoveLogDir {
            from: from.clone(),
            to: to.clone(),
            source,
        };
        if to == from {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(move_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the new log directory is inside the current one",
            )));
        }

        if from.exists() {
            copy_tree(&from, &to).map_err(move_error)?;
            std::fs::remove_dir_all(&from).map_err(move_error)?;
        }
        let to = create_dir(&to)?;
        self.relocate(&from, &to);
        tracing::debug!(from = %from.display(), to = %to.display(), "moved log directory");
        Ok(())
    }

    fn relocate(&mut self, from: &Path, to: &Path) {
        rebase(&mut self.stream_dir, from, to);
        self.log_dir = to.to_path_buf();
        for entry in &mut self.log_book {
            match entry {
                LogEntry::Command(record) => {
                    rebase(&mut record.stdout_path, from, to);
                    rebase(&mut record.stderr_path, from, to);
                    if let Some(path) = record.result.trace_path.as_mut() {
                        rebase(path, from, to);
                    }
                }
                LogEntry::Child(child) => child.relocate(from, to),
                LogEntry::Message(_) => {}
            }
        }
    }

    pub fn update_done_time(&mut self) {
        self.done_time = Local::now();
    }

    /// Time elapsed since this logger was created.
    pub fn check_duration(&self) -> String {
        strfdelta(Local::now() - self.init_time, DURATION_FORMAT)
    }

    fn update_duration(&mut self) {
        self.update_done_time();
        self.duration = Some(strfdelta(self.done_time - self.init_time, DURATION_FORMAT));
    }

    /// Close out this logger and any children that were not finalized.
    pub fn finalize(&mut self) {
        for entry in &mut self.log_book {
            if let LogEntry::Child(child) = entry
                && child.duration.is_none()
            {
                child.finalize();
            }
        }
        self.update_duration();
        tracing::debug!(logger = %self.name, duration = ?self.duration, "finalized");
    }
}

/// Point `path` at `to` if it lives under `from`.
fn rebase(path: &mut PathBuf, from: &Path, to: &Path) {
    if let Ok(relative) = path.strip_prefix(from) {
        *path = to.join(relative);
    }
}

/// Copy the directory tree at `from` into `to`, merging with what is there.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Create `path` if needed and return it in absolute form.
fn create_dir(path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(path).map_err(|source| Error::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(path.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase() {
        let mut inside = PathBuf::from("/logs/run_1/cmd_stdout");
        rebase(&mut inside, Path::new("/logs"), Path::new("/archive"));
        assert_eq!(inside, PathBuf::from("/archive/run_1/cmd_stdout"));

        let mut outside = PathBuf::from("/elsewhere/trace");
        rebase(&mut outside, Path::new("/logs"), Path::new("/archive"));
        assert_eq!(outside, PathBuf::from("/elsewhere/trace"));
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("nested")).unwrap();
        std::fs::write(from.join("nested/file"), "content").unwrap();

        let to = dir.path().join("to");
        copy_tree(&from, &to).unwrap();
        assert_eq!(
            std::fs::read_to_string(to.join("nested/file")).unwrap(),
            "content"
        );
    }

    #[test]
    fn test_execution_id_shape() {
        let id = execution_id();
        assert_eq!(id.len(), 13);
        assert!(id.starts_with("cmd_"));
        assert!(
            id[4..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
        assert_ne!(execution_id(), execution_id());
    }
}
