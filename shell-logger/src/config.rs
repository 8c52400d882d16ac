//! Logger-wide configuration and per-command options.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use shell_logger_trace::TraceSpec;
use std::path::{Path, PathBuf};

/// Tracer requested for a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceOptions {
    /// `strace` or `ltrace`.
    pub tracer: String,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub summary: bool,
}

impl TraceOptions {
    pub fn new(tracer: impl Into<String>) -> Self {
        Self {
            tracer: tracer.into(),
            ..Default::default()
        }
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn summary(mut self, summary: bool) -> Self {
        self.summary = summary;
        self
    }

    /// The tracer request writing to `output_path`.
    pub fn to_spec(&self, output_path: impl Into<PathBuf>) -> TraceSpec {
        TraceSpec {
            tracer: self.tracer.clone(),
            output_path: Some(output_path.into()),
            expression: self.expression.clone(),
            summary: self.summary,
        }
    }
}

/// Settings for a [`crate::ShellLogger`], usually read from YAML.
///
/// ```yaml
/// log_dir: ./logs
/// login_shell: false
/// interval: 0.5
/// measure: [cpu, memory]
/// trace:
///   tracer: strace
///   summary: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    /// Directory the stream directory is created in.
    pub log_dir: PathBuf,
    /// Start the shell as a login shell.
    pub login_shell: bool,
    /// Sampling interval in seconds.
    pub interval: f64,
    /// Run commands with stdin redirected from `/dev/null`.
    pub stdin_redirect: bool,
    /// Samplers attached to every command.
    pub measure: Vec<String>,
    /// Tracer attached to every command.
    pub trace: Option<TraceOptions>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            login_shell: false,
            interval: shell_logger_stats::DEFAULT_INTERVAL,
            stdin_redirect: true,
            measure: Vec::new(),
            trace: None,
        }
    }
}

impl LoggerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Self::from_yaml_str(&contents)
    }

    /// Per-command options seeded from this configuration.
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            stdin_redirect: self.stdin_redirect,
            measure: self.measure.clone(),
            interval: Some(self.interval),
            trace: self.trace.clone(),
            ..LogOptions::default()
        }
    }
}

/// Options for one [`crate::ShellLogger::log`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogOptions {
    /// Directory to run the command in; the previous one is restored afterwards.
    pub cwd: Option<PathBuf>,
    /// Echo stdout to the console as it is produced.
    pub live_stdout: bool,
    /// Echo stderr to the console as it is produced.
    pub live_stderr: bool,
    /// Keep stdout, stderr and trace text in memory and return them.
    pub return_info: bool,
    /// Print the command before running it.
    pub verbose: bool,
    pub stdin_redirect: bool,
    pub measure: Vec<String>,
    /// Sampling interval in seconds; the logger's default when unset.
    pub interval: Option<f64>,
    pub trace: Option<TraceOptions>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            live_stdout: false,
            live_stderr: false,
            return_info: false,
            verbose: false,
            stdin_redirect: true,
            measure: Vec::new(),
            interval: None,
            trace: None,
        }
    }
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn live_stdout(mut self, live: bool) -> Self {
        self.live_stdout = live;
        self
    }

    pub fn live_stderr(mut self, live: bool) -> Self {
        self.live_stderr = live;
        self
    }

    pub fn return_info(mut self, return_info: bool) -> Self {
        self.return_info = return_info;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn stdin_redirect(mut self, redirect: bool) -> Self {
        self.stdin_redirect = redirect;
        self
    }

    pub fn measure<I, S>(mut self, samplers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.measure = samplers.into_iter().map(Into::into).collect();
        self
    }

    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    pub fn trace(mut self, trace: TraceOptions) -> Self {
        self.trace = Some(trace);
        self
    }
}
