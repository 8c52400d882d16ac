use miette::Diagnostic;
use shell_logger_session::SessionError;
use shell_logger_stats::StatsError;
use shell_logger_trace::TraceError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(
        code(shell_logger::session),
        help("the shell session cannot be used any more; start a new logger")
    )]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(
        code(shell_logger::sampler),
        help("`measure` accepts cpu, memory and disk; `interval` must be positive")
    )]
    Stats(#[from] StatsError),

    #[error(transparent)]
    #[diagnostic(
        code(shell_logger::trace),
        help("`trace` accepts strace or ltrace, which must be installed and on PATH")
    )]
    Trace(#[from] TraceError),

    #[error("Failed to parse configuration: {0}")]
    #[diagnostic(code(shell_logger::config))]
    Config(#[from] serde_yaml::Error),

    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot change the log directory of child logger `{name}`")]
    #[diagnostic(
        code(shell_logger::child_log_dir),
        help("change the log directory of the top-level logger instead")
    )]
    ChildLogDir { name: String },

    #[error("Failed to move {} to {}: {source}", from.display(), to.display())]
    MoveLogDir {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("child logger `{name}` is missing from the log book")]
    MissingChild { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from bad configuration rather than a failed run.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Stats(_) | Error::Trace(_) | Error::Config(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
