//! Framing protocol spoken over the shell's stdin.
//!
//! The shell never exits between commands, so the end of a command's output
//! is marked in-band: after the command, the shell is told to print a single
//! EOT byte on every stream that is being read. Readers stop at that byte.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;

/// Sentinel byte marking the end of a frame on a pipe.
pub const END_OF_READ: u8 = 0x04;

/// Shell variable holding the exit status of the last framed command.
const RET_CODE_VAR: &str = "RET_CODE";

/// Build the text written to the shell's stdin to run `command`.
///
/// The command is wrapped in braces so that heredocs and multi-line
/// constructs are parsed as a single statement:
///
/// ```text
/// {
/// <command>
/// } </dev/null
/// RET_CODE=$?
/// printf '\4'
/// printf '\4' 1>&2
/// ```
pub fn frame_command(command: &str, devnull_stdin: bool) -> String {
    let redirect = if devnull_stdin { " </dev/null" } else { "" };
    format!(
        "{{\n{command}\n}}{redirect}\n{RET_CODE_VAR}=$?\nprintf '\\4'\nprintf '\\4' 1>&2\n"
    )
}

/// Build the text written to the shell's stdin for an auxiliary query.
///
/// The query is grouped in braces so the redirection covers every part of
/// a compound command. Output goes to the auxiliary descriptors, never to
/// the shell's own stdout/stderr, so queries cannot interleave with a
/// command's output. Redirections inside the query still work: `echo x 1>&2`
/// lands on the auxiliary stderr.
pub fn frame_auxiliary(command: &str, out_fd: RawFd, err_fd: RawFd) -> String {
    format!(
        "{{\n{command}\n}} 1>&{out_fd} 2>&{err_fd}\nprintf '\\4' 1>&{out_fd}\nprintf '\\4' 1>&{err_fd}\n"
    )
}

/// Auxiliary query that prints the status stored by [`frame_command`].
pub(crate) fn return_code_query() -> String {
    format!("echo ${RET_CODE_VAR}")
}

/// One chunk read from a framed pipe, classified against the sentinel.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// No sentinel in this chunk; all bytes belong to the frame.
    Data(&'a [u8]),
    /// The sentinel was found. `data` precedes it and belongs to the frame;
    /// `trailing` follows it and belongs to nothing.
    End { data: &'a [u8], trailing: &'a [u8] },
}

/// Classify a chunk by looking for the first sentinel byte anywhere in it.
///
/// The sentinel is usually the last byte of the last chunk, but a reader
/// must not rely on that: a late writer may append bytes after it in the
/// same read. Those bytes are reported as `trailing` and are not delivered.
pub fn split_frame(chunk: &[u8]) -> Frame<'_> {
    match chunk.iter().position(|&b| b == END_OF_READ) {
        Some(pos) => Frame::End {
            data: &chunk[..pos],
            trailing: &chunk[pos + 1..],
        },
        None => Frame::Data(chunk),
    }
}

/// Exit status of a command run in the shell.
///
/// The shell process itself keeps running, so the status is read back from
/// a shell variable. When that value cannot be parsed (for instance after
/// the command replaced the shell with a sub-shell) it is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnCode {
    Exited(i32),
    Unknown,
}

impl ReturnCode {
    /// Parse the output of the return code query.
    pub fn parse(text: &str) -> Self {
        text.trim()
            .parse::<i32>()
            .map(ReturnCode::Exited)
            .unwrap_or(ReturnCode::Unknown)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ReturnCode::Exited(code) => Some(*code),
            ReturnCode::Unknown => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ReturnCode::Exited(0))
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Exited(code) => write!(f, "{code}"),
            ReturnCode::Unknown => write!(f, "N/A"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_command_wraps_in_braces() {
        let framed = frame_command("echo hello", false);
        assert_eq!(
            framed,
            "{\necho hello\n}\nRET_CODE=$?\nprintf '\\4'\nprintf '\\4' 1>&2\n"
        );
    }

    #[test]
    fn test_frame_command_devnull_stdin() {
        let framed = frame_command("cat", true);
        assert!(framed.starts_with("{\ncat\n} </dev/null\n"));
    }

    #[test]
    fn test_frame_command_keeps_heredoc_lines() {
        let framed = frame_command("bash << EOF\necho hello\nEOF", false);
        assert!(framed.contains("\nEOF\n}\n"));
    }

    #[test]
    fn test_frame_auxiliary_redirects_both_streams() {
        let framed = frame_auxiliary("pwd", 7, 9);
        assert_eq!(
            framed,
            "{\npwd\n} 1>&7 2>&9\nprintf '\\4' 1>&7\nprintf '\\4' 1>&9\n"
        );
    }

    #[test]
    fn test_frame_auxiliary_groups_compound_commands() {
        let framed = frame_auxiliary("echo one; echo two", 7, 9);
        assert!(framed.starts_with("{\necho one; echo two\n} 1>&7 2>&9\n"));
    }

    #[test]
    fn test_split_frame_without_sentinel() {
        assert_eq!(split_frame(b"hello\n"), Frame::Data(b"hello\n"));
    }

    #[test]
    fn test_split_frame_sentinel_last() {
        assert_eq!(
            split_frame(b"hello\n\x04"),
            Frame::End {
                data: b"hello\n",
                trailing: b"",
            }
        );
    }

    #[test]
    fn test_split_frame_sentinel_only() {
        assert_eq!(
            split_frame(b"\x04"),
            Frame::End {
                data: b"",
                trailing: b"",
            }
        );
    }

    #[test]
    fn test_split_frame_bytes_after_sentinel() {
        assert_eq!(
            split_frame(b"out\x04late"),
            Frame::End {
                data: b"out",
                trailing: b"late",
            }
        );
    }

    #[test]
    fn test_return_code_parse() {
        assert_eq!(ReturnCode::parse("0\n"), ReturnCode::Exited(0));
        assert_eq!(ReturnCode::parse(" 127 "), ReturnCode::Exited(127));
        assert_eq!(ReturnCode::parse(""), ReturnCode::Unknown);
        assert_eq!(ReturnCode::parse("abc"), ReturnCode::Unknown);
    }

    #[test]
    fn test_return_code_display_and_serde() {
        assert_eq!(ReturnCode::Exited(2).to_string(), "2");
        assert_eq!(ReturnCode::Unknown.to_string(), "N/A");
        assert_eq!(serde_json::to_string(&ReturnCode::Exited(1)).unwrap(), "1");
        assert_eq!(serde_json::to_string(&ReturnCode::Unknown).unwrap(), "null");
        assert!(ReturnCode::Exited(0).success());
        assert!(!ReturnCode::Unknown.success());
        assert_eq!(ReturnCode::Unknown.code(), None);
    }
}
