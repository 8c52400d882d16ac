//! Raw OS pipes wiring the spawned shell.
//!
//! Besides the shell's own stdin, two auxiliary pipes carry the output of
//! introspection queries. Their write ends are handed to the shell under
//! the same descriptor numbers they have here, so query commands can
//! redirect into them with `1>&N 2>&M`.

use crate::protocol::{Frame, split_frame};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::thread;
use thiserror::Error;

/// Default capacity of an anonymous pipe on Linux, used as the read size.
const MAX_PIPE_BUFFER: usize = 65536;

/// Capacity requested for the auxiliary pipes. The shell writes to them
/// without blocking, so a reply only arrives whole if the reader keeps up
/// or it fits in the pipe. 1 MiB is the unprivileged limit on Linux.
const AUX_PIPE_CAPACITY: i32 = 1 << 20;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("failed to create pipe: {0}")]
    Create(Errno),
    #[error("failed to set descriptor flags: {0}")]
    Flags(Errno),
    #[error("{stream} pipe closed before the end-of-read marker")]
    Closed { stream: &'static str },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Open a pipe whose ends are both close-on-exec.
///
/// Ends that a child must inherit are opted back in around the spawn, so
/// no other child spawned by the embedding program can pick them up.
pub(crate) fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), PipeError> {
    let (read, write) = nix::unistd::pipe().map_err(PipeError::Create)?;
    set_cloexec(&read, true)?;
    set_cloexec(&write, true)?;
    Ok((read, write))
}

/// Set or clear `FD_CLOEXEC` on a descriptor.
pub(crate) fn set_cloexec(fd: impl AsFd, cloexec: bool) -> Result<(), PipeError> {
    let fd = fd.as_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).map_err(PipeError::Flags)?);
    let mut new_flags = flags;
    new_flags.set(FdFlag::FD_CLOEXEC, cloexec);
    if new_flags != flags {
        fcntl(fd, FcntlArg::F_SETFD(new_flags)).map_err(PipeError::Flags)?;
    }
    Ok(())
}

/// Grow a pipe's kernel buffer. Failure only costs headroom, so it is logged.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn grow_pipe(fd: impl AsFd, capacity: i32) {
    match fcntl(fd.as_fd(), FcntlArg::F_SETPIPE_SZ(capacity)) {
        Ok(size) => tracing::trace!(size, "resized auxiliary pipe"),
        Err(e) => tracing::debug!(capacity, "could not resize auxiliary pipe: {}", e),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn grow_pipe(_fd: impl AsFd, _capacity: i32) {}

/// Make writes to a descriptor non-blocking.
fn set_nonblocking(fd: impl AsFd) -> Result<(), PipeError> {
    let fd = fd.as_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(PipeError::Flags)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PipeError::Flags)?;
    Ok(())
}

/// The auxiliary stdout/stderr pipe pair.
///
/// The write ends are only held until the shell has been spawned. After
/// [`AuxPipes::release_write_ends`] the shell holds the only copies, so a
/// dead shell shows up as end-of-file on the read ends instead of a hang.
pub struct AuxPipes {
    stdout_read: File,
    stderr_read: File,
    stdout_write: Option<OwnedFd>,
    stderr_write: Option<OwnedFd>,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
}

impl AuxPipes {
    /// Open both auxiliary pipes with non-blocking write ends.
    pub fn open() -> Result<Self, PipeError> {
        let (stdout_read, stdout_write) = pipe_cloexec()?;
        let (stderr_read, stderr_write) = pipe_cloexec()?;
        set_nonblocking(&stdout_write)?;
        set_nonblocking(&stderr_write)?;
        grow_pipe(&stdout_write, AUX_PIPE_CAPACITY);
        grow_pipe(&stderr_write, AUX_PIPE_CAPACITY);

        let stdout_fd = stdout_write.as_raw_fd();
        let stderr_fd = stderr_write.as_raw_fd();
        tracing::trace!(stdout_fd, stderr_fd, "opened auxiliary pipes");

        Ok(Self {
            stdout_read: File::from(stdout_read),
            stderr_read: File::from(stderr_read),
            stdout_write: Some(stdout_write),
            stderr_write: Some(stderr_write),
            stdout_fd,
            stderr_fd,
        })
    }

    /// Descriptor numbers the shell writes auxiliary output to.
    pub fn child_fds(&self) -> (RawFd, RawFd) {
        (self.stdout_fd, self.stderr_fd)
    }

    /// Drop our copies of the write ends once the shell has inherited them.
    pub fn release_write_ends(&mut self) {
        self.stdout_write.take();
        self.stderr_write.take();
    }

    /// Read one framed reply from both auxiliary pipes.
    ///
    /// Both pipes are drained at the same time so a full stderr never
    /// stalls a reply on stdout. Returns the raw bytes of each.
    pub fn read_reply(&mut self) -> Result<(Vec<u8>, Vec<u8>), PipeError> {
        let Self {
            stdout_read,
            stderr_read,
            ..
        } = self;
        let (stdout, stderr) = thread::scope(|s| {
            let stderr = s.spawn(move || read_frame(stderr_read, "auxiliary stderr"));
            let stdout = read_frame(stdout_read, "auxiliary stdout");
            let stderr = stderr.join().unwrap_or_else(|_| {
                Err(PipeError::Io(io::Error::other("auxiliary reader panicked")))
            });
            (stdout, stderr)
        });
        Ok((stdout?, stderr?))
    }
}

/// Read from `reader` until the end-of-read marker, returning what preceded it.
fn read_frame(reader: &mut impl Read, stream: &'static str) -> Result<Vec<u8>, PipeError> {
    let mut collected = Vec::new();
    let mut buf = vec![0u8; MAX_PIPE_BUFFER];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PipeError::Io(e)),
        };
        if n == 0 {
            tracing::debug!(stream, "pipe closed while waiting for end-of-read");
            return Err(PipeError::Closed { stream });
        }
        match split_frame(&buf[..n]) {
            Frame::Data(data) => collected.extend_from_slice(data),
            Frame::End { data, trailing } => {
                collected.extend_from_slice(data);
                if !trailing.is_empty() {
                    tracing::warn!(
                        stream,
                        bytes = trailing.len(),
                        "discarding bytes written after the end-of-read marker"
                    );
                }
                return Ok(collected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pipe_cloexec_sets_flag() {
        let (read, write) = pipe_cloexec().unwrap();
        for fd in [&read, &write] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_set_cloexec_clears_flag() {
        let (read, _write) = pipe_cloexec().unwrap();
        set_cloexec(&read, false).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(read.as_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(!flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_aux_write_ends_are_nonblocking() {
        let pipes = AuxPipes::open().unwrap();
        let write = pipes.stdout_write.as_ref().unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(write.as_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
        let (out, err) = pipes.child_fds();
        assert_ne!(out, err);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_aux_pipes_are_enlarged() {
        let pipes = AuxPipes::open().unwrap();
        let write = pipes.stdout_write.as_ref().unwrap();
        let size = fcntl(write.as_fd(), FcntlArg::F_GETPIPE_SZ).unwrap();
        assert!(size > MAX_PIPE_BUFFER as i32, "pipe size {size}");
    }

    #[test]
    fn test_read_frame_stops_at_marker() {
        let mut input = Cursor::new(b"/home/user\n\x04".to_vec());
        let data = read_frame(&mut input, "test").unwrap();
        assert_eq!(data, b"/home/user\n");
    }

    #[test]
    fn test_read_frame_reports_closed_pipe() {
        let mut input = Cursor::new(b"partial output".to_vec());
        let err = read_frame(&mut input, "test").unwrap_err();
        assert!(matches!(err, PipeError::Closed { stream: "test" }));
    }

    #[test]
    fn test_read_reply_over_real_pipes() {
        use std::io::Write;

        let mut pipes = AuxPipes::open().unwrap();
        let mut out = File::from(pipes.stdout_write.take().unwrap());
        let mut err = File::from(pipes.stderr_write.take().unwrap());
        out.write_all(b"0022\n\x04").unwrap();
        err.write_all(b"\x04").unwrap();

        let (stdout, stderr) = pipes.read_reply().unwrap();
        assert_eq!(stdout, b"0022\n");
        assert!(stderr.is_empty());
    }
}
