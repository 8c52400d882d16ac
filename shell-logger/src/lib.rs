//! Run shell commands in a persistent session and keep a log book of
//! what ran, where, for how long and with what result.
//!
//! ```no_run
//! use shell_logger::{LogOptions, LoggerConfig, ShellLogger};
//!
//! # fn main() -> shell_logger::Result<()> {
//! let mut logger = ShellLogger::new("build", &LoggerConfig::default())?;
//! let summary = logger.log(
//!     "Configure",
//!     "./configure --prefix=/opt",
//!     &LogOptions::new().return_info(true).measure(["cpu", "memory"]),
//! )?;
//! println!("exit status {}", summary.return_code);
//! logger.finalize();
//! # Ok(())
//! # }
//! ```

mod config;
mod duration;
mod error;
pub mod log;
mod logger;
mod orchestrator;

pub use config::{LogOptions, LoggerConfig, TraceOptions};
pub use duration::{format_wall, strfdelta};
pub use error::{Error, Result};
pub use logger::{
    CommandRecord, LogEntry, LogSummary, MessageRecord, ShellLogger, execution_id,
};
pub use orchestrator::{AuxiliaryInfo, CommandResult, Execution, Orchestrator};

pub use shell_logger_session::{ReturnCode, RunOptions, SessionError, ShellSession, TeeSinks};
pub use shell_logger_stats::{SamplerRegistry, Samples, StatsCollector, StatsError};
pub use shell_logger_trace::{TraceError, TraceSpec, Tracer, TracerRegistry};
