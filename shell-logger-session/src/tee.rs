//! Fan a framed byte stream out to several sinks.
//!
//! One tee runs per stream (stdout and stderr) on its own thread. Each
//! chunk read from the shell is copied to every active sink until the
//! end-of-read marker arrives.

use crate::pipes::PipeError;
use crate::protocol::{Frame, split_frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

const CHUNK_SIZE: usize = 4096;

/// Which of the shell's output streams a tee is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn name(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sink configuration for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeeSinks {
    /// Echo output to the console while it is produced.
    #[serde(default)]
    pub console: bool,
    /// Keep the output in memory and return it.
    #[serde(default)]
    pub capture: bool,
    /// Append the output to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl TeeSinks {
    /// Open the file sink, if any, in append mode.
    pub(crate) fn open_file(&self) -> io::Result<Option<File>> {
        self.file
            .as_ref()
            .map(|path| File::options().create(true).append(true).open(path))
            .transpose()
    }
}

/// Opened sinks handed to a running tee.
pub struct TeeTargets<'a> {
    pub console: Option<&'a mut (dyn Write + Send)>,
    pub capture: bool,
    pub file: Option<File>,
}

/// What a tee produced.
#[derive(Debug, Default)]
pub struct TeeOutput {
    /// Captured output, decoded leniently, when capture was requested.
    pub captured: Option<String>,
    /// Number of bytes delivered to the sinks.
    pub bytes: u64,
}

/// Copy `input` to the targets until the end-of-read marker.
///
/// Invalid UTF-8 in the captured text is replaced rather than rejected.
/// A sink that fails to accept a write is dropped with a warning; reading
/// continues so the pipe stays in step with the shell. A pipe that closes
/// before the marker is an error: the shell is gone or wedged.
pub fn tee(
    input: &mut impl Read,
    stream: Stream,
    targets: TeeTargets<'_>,
) -> Result<TeeOutput, PipeError> {
    let TeeTargets {
        mut console,
        capture,
        mut file,
    } = targets;
    let mut captured = capture.then(Vec::new);
    let mut bytes = 0u64;
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = match input.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PipeError::Io(e)),
        };
        if n == 0 {
            tracing::debug!(%stream, bytes, "stream closed before end-of-read");
            return Err(PipeError::Closed {
                stream: stream.name(),
            });
        }

        let (data, done) = match split_frame(&buf[..n]) {
            Frame::Data(data) => (data, false),
            Frame::End { data, trailing } => {
                if !trailing.is_empty() {
                    tracing::warn!(
                        %stream,
                        bytes = trailing.len(),
                        "discarding bytes written after the end-of-read marker"
                    );
                }
                (data, true)
            }
        };

        tracing::trace!(%stream, n = data.len(), done, "tee chunk");
        bytes += data.len() as u64;

        if let Some(writer) = console.as_mut()
            && let Err(e) = writer.write_all(data).and_then(|_| writer.flush())
        {
            tracing::warn!(%stream, "console sink failed, disabling: {}", e);
            console = None;
        }
        if let Some(buffer) = captured.as_mut() {
            buffer.extend_from_slice(data);
        }
        if let Some(f) = file.as_mut()
            && let Err(e) = f.write_all(data)
        {
            tracing::warn!(%stream, "file sink failed, disabling: {}", e);
            file = None;
        }

        if done {
            break;
        }
    }

    if let Some(f) = file.as_mut()
        && let Err(e) = f.flush()
    {
        tracing::warn!(%stream, "failed to flush file sink: {}", e);
    }

    Ok(TeeOutput {
        captured: captured.map(|b| String::from_utf8_lossy(&b).into_owned()),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// Reader that hands out one predefined chunk per `read` call.
    struct Chunked(Vec<Vec<u8>>);

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn capture_only() -> TeeTargets<'static> {
        TeeTargets {
            console: None,
            capture: true,
            file: None,
        }
    }

    #[test]
    fn test_tee_captures_until_marker() {
        let mut input = Cursor::new(b"hello\n\x04".to_vec());
        let out = tee(&mut input, Stream::Stdout, capture_only()).unwrap();
        assert_eq!(out.captured.as_deref(), Some("hello\n"));
        assert_eq!(out.bytes, 6);
    }

    #[test]
    fn test_tee_marker_in_separate_chunk() {
        let mut input = Chunked(vec![b"first ".to_vec(), b"second".to_vec(), b"\x04".to_vec()]);
        let out = tee(&mut input, Stream::Stdout, capture_only()).unwrap();
        assert_eq!(out.captured.as_deref(), Some("first second"));
    }

    #[test]
    fn test_tee_drops_bytes_after_marker() {
        let mut input = Chunked(vec![b"data\x04stray".to_vec(), b"never read".to_vec()]);
        let out = tee(&mut input, Stream::Stderr, capture_only()).unwrap();
        assert_eq!(out.captured.as_deref(), Some("data"));
        assert_eq!(input.0.len(), 1);
    }

    #[test]
    fn test_tee_lenient_decoding() {
        let mut input = Cursor::new(b"ok \xff\xfe done\x04".to_vec());
        let out = tee(&mut input, Stream::Stdout, capture_only()).unwrap();
        let text = out.captured.unwrap();
        assert!(text.starts_with("ok "));
        assert!(text.ends_with(" done"));
    }

    #[test]
    fn test_tee_multibyte_split_across_chunks() {
        let snowman = "☃".as_bytes();
        let mut input = Chunked(vec![
            snowman[..1].to_vec(),
            snowman[1..].to_vec(),
            b"\x04".to_vec(),
        ]);
        let out = tee(&mut input, Stream::Stdout, capture_only()).unwrap();
        assert_eq!(out.captured.as_deref(), Some("☃"));
    }

    #[test]
    fn test_tee_closed_without_marker() {
        let mut input = Cursor::new(b"no marker".to_vec());
        let err = tee(&mut input, Stream::Stderr, capture_only()).unwrap_err();
        assert!(matches!(err, PipeError::Closed { stream: "stderr" }));
    }

    #[test]
    fn test_tee_all_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let mut console = Vec::new();
        let sinks = TeeSinks {
            console: true,
            capture: false,
            file: Some(path.clone()),
        };

        let mut input = Cursor::new(b"line one\nline two\n\x04".to_vec());
        let out = tee(
            &mut input,
            Stream::Stdout,
            TeeTargets {
                console: Some(&mut console),
                capture: sinks.capture,
                file: sinks.open_file().unwrap(),
            },
        )
        .unwrap();

        assert_eq!(out.captured, None);
        assert_eq!(console, b"line one\nline two\n");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "line one\nline two\n"
        );
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr");
        std::fs::write(&path, "before\n").unwrap();
        let sinks = TeeSinks {
            file: Some(path.clone()),
            ..Default::default()
        };

        let mut input = Cursor::new(b"after\n\x04".to_vec());
        tee(
            &mut input,
            Stream::Stderr,
            TeeTargets {
                console: None,
                capture: false,
                file: sinks.open_file().unwrap(),
            },
        )
        .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before\nafter\n");
    }
}
