//! Persistent shell session for shell-logger.
//!
//! This crate owns one long-lived shell subprocess and runs commands in it
//! using a sentinel-framed protocol over raw pipes, fanning the command's
//! output to console, memory and file sinks while it is produced.

mod pipes;
mod protocol;
mod session;
mod tee;

// Protocol constants and framing
pub use protocol::{END_OF_READ, Frame, ReturnCode, frame_auxiliary, frame_command, split_frame};

// Pipe management
pub use pipes::{AuxPipes, PipeError};

// Stream multiplexing
pub use tee::{Stream, TeeOutput, TeeSinks, TeeTargets, tee};

// Main session
pub use session::{AuxOutput, RunOptions, RunOutput, SessionError, SessionIo, ShellSession};
