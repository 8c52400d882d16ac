//! Run shell commands under an OS-level tracer.
//!
//! A [`Tracer`] never runs anything itself. It rewrites a command line so
//! that, when the shell runs it, the original command executes under the
//! tracer with the raw trace written to [`Tracer::output_path`].

mod registry;
mod tracers;

pub use registry::{TracerConstructor, TracerRegistry};
pub use tracers::{Ltrace, Strace};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unsupported trace type `{name}` (available: {available})")]
    UnknownTracer { name: String, available: String },
    #[error("{count} trace types match `{name}`")]
    AmbiguousTracer { name: String, count: usize },
    #[error("`{executable}` was not found on PATH; install it to use the {name} tracer")]
    MissingExecutable {
        name: String,
        executable: String,
        #[source]
        source: which::Error,
    },
}

/// A request to trace one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSpec {
    /// Registered tracer name, e.g. `strace`.
    pub tracer: String,
    /// Where the raw trace goes. Defaults to `<tracer>.log`.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Filter expression passed to the tracer's `-e`.
    #[serde(default)]
    pub expression: Option<String>,
    /// Ask for a summary table instead of a full trace.
    #[serde(default)]
    pub summary: bool,
}

impl TraceSpec {
    pub fn new(tracer: impl Into<String>) -> Self {
        Self {
            tracer: tracer.into(),
            ..Default::default()
        }
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn summary(mut self, summary: bool) -> Self {
        self.summary = summary;
        self
    }

    /// The output path, falling back to `<tracer>.log` in the current directory.
    pub fn resolved_output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.log", self.tracer)))
    }
}

/// An external tracing tool a command can be wrapped with.
pub trait Tracer: Send + Sync {
    /// Name the tracer is registered under.
    fn name(&self) -> &'static str;

    /// Program that must be on `PATH` for the wrapped command to work.
    fn executable(&self) -> &'static str {
        self.name()
    }

    /// File the trace is written to.
    fn output_path(&self) -> &Path;

    /// The tracer invocation without the traced command,
    /// e.g. `strace -f -o strace.log -c`.
    fn trace_args(&self) -> String;

    /// The command line to run in place of `command`.
    fn command(&self, command: &str) -> String {
        format!("{} -- {}", self.trace_args(), command)
    }
}
