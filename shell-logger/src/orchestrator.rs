//! Sequencing of one instrumented command.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use shell_logger_session::{ReturnCode, RunOptions, RunOutput, SessionError, ShellSession};
use shell_logger_stats::{Sampler, SamplerRegistry, Samples, finish_all, start_all};
use shell_logger_trace::{TraceSpec, Tracer, TracerRegistry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Shell state captured over the auxiliary channel before a command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryInfo {
    pub pwd: String,
    pub environment: String,
    pub umask: String,
    pub hostname: String,
    pub user: String,
    pub group: String,
    pub shell: String,
    pub ulimit: String,
}

impl AuxiliaryInfo {
    pub fn gather(session: &ShellSession) -> Result<Self, SessionError> {
        let query = |command: &str, strip: bool| {
            let reply = session.auxiliary_command(command, strip)?;
            if !reply.stderr.trim().is_empty() {
                tracing::warn!(
                    command,
                    "auxiliary query reported an error, its output may be incomplete: {}",
                    reply.stderr.trim()
                );
            }
            Ok::<_, SessionError>(reply.stdout)
        };
        Ok(Self {
            pwd: query("pwd", true)?,
            environment: query("env", false)?,
            umask: query("umask", true)?,
            hostname: query("hostname", true)?,
            user: query("whoami", true)?,
            group: query("id -gn", true)?,
            shell: query("printenv SHELL", true)?,
            ulimit: query("ulimit -a", false)?,
        })
    }
}

/// Everything recorded about one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command as run by the shell, including any tracer wrapper.
    pub args: String,
    pub returncode: ReturnCode,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub start: i64,
    pub finish: i64,
    pub wall: i64,
    #[serde(flatten)]
    pub aux: AuxiliaryInfo,
    pub stats: Option<BTreeMap<String, Samples>>,
    pub trace: Option<String>,
    pub trace_path: Option<PathBuf>,
}

impl CommandResult {
    fn assemble(
        run: RunOutput,
        aux: AuxiliaryInfo,
        stats: Option<BTreeMap<String, Samples>>,
        trace: Option<String>,
        trace_path: Option<PathBuf>,
    ) -> Self {
        Self {
            args: run.args,
            returncode: run.returncode,
            stdout: run.stdout,
            stderr: run.stderr,
            start: run.start,
            finish: run.finish,
            wall: run.wall,
            aux,
            stats,
            trace,
            trace_path,
        }
    }
}

/// What to run and how to instrument it.
#[derive(Debug, Clone, Default)]
pub struct Execution<'a> {
    pub command: &'a str,
    /// Directory to run in; the current one is restored afterwards.
    pub cwd: Option<&'a Path>,
    pub run: RunOptions,
    pub measure: &'a [String],
    /// Sampling interval in seconds.
    pub interval: f64,
    pub trace: Option<TraceSpec>,
    /// Read the trace file back into [`CommandResult::trace`].
    pub keep_trace: bool,
}

/// Runs commands in a session with samplers and tracers attached.
pub struct Orchestrator<'a> {
    session: &'a ShellSession,
    samplers: &'a SamplerRegistry,
    tracers: &'a TracerRegistry,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        session: &'a ShellSession,
        samplers: &'a SamplerRegistry,
        tracers: &'a TracerRegistry,
    ) -> Self {
        Self {
            session,
            samplers,
            tracers,
        }
    }

    /// Run one command and assemble its record.
    ///
    /// Unknown samplers and tracers are rejected before anything is sent
    /// to the shell. A non-zero exit status is part of the result. The
    /// previous working directory is restored on every path once the
    /// session has moved.
    pub fn execute(&self, execution: &Execution<'_>) -> Result<CommandResult> {
        let samplers = if execution.measure.is_empty() {
            Vec::new()
        } else {
            self.samplers
                .create_all(execution.measure, execution.interval)?
        };
        let tracer = execution
            .trace
            .as_ref()
            .map(|spec| self.tracers.create(spec))
            .transpose()?;

        let old_pwd = std::env::current_dir()?;
        let moved = match execution.cwd {
            Some(cwd) if cwd != old_pwd => {
                tracing::debug!(cwd = %cwd.display(), "changing directory");
                if let Err(e) = self.session.cd(cwd) {
                    self.restore_dir(&old_pwd);
                    return Err(e.into());
                }
                true
            }
            _ => false,
        };

        let result = self.execute_here(execution, samplers, tracer.as_deref());
        if moved {
            self.restore_dir(&old_pwd);
        }
        result
    }

    /// Steps that run inside the target directory.
    fn execute_here(
        &self,
        execution: &Execution<'_>,
        samplers: Vec<Sampler>,
        tracer: Option<&dyn Tracer>,
    ) -> Result<CommandResult> {
        let aux = AuxiliaryInfo::gather(self.session)?;

        let running = start_all(samplers)?;
        let command = match tracer {
            Some(tracer) => tracer.command(execution.command),
            None => execution.command.to_string(),
        };

        // On failure the samplers are dropped, which stops them.
        let run = self.session.run(&command, &execution.run)?;

        let stats = if running.is_empty() {
            None
        } else {
            match finish_all(running) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(command = %command, "discarding resource samples: {}", e);
                    None
                }
            }
        };

        let trace_path = tracer.map(|t| t.output_path().to_path_buf());
        let trace = match &trace_path {
            Some(path) if execution.keep_trace => read_trace(path),
            _ => None,
        };

        Ok(CommandResult::assemble(run, aux, stats, trace, trace_path))
    }

    /// Move the process, and the shell if it still answers, back to `dir`.
    fn restore_dir(&self, dir: &Path) {
        if self.session.is_usable() {
            match self.session.cd(dir) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), "failed to restore shell directory: {}", e)
                }
            }
        }
        if let Err(e) = std::env::set_current_dir(dir) {
            tracing::warn!(path = %dir.display(), "failed to restore working directory: {}", e);
        }
    }
}

/// Read a tracer's output, tolerating a missing file or invalid UTF-8.
fn read_trace(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read trace output: {}", e);
            None
        }
    }
}
