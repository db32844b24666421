//! Line-oriented IPC primitives for the collector/worker pipes.
//!
//! One UTF-8 line per message, with EINTR-safe reads and writes at the fd
//! level.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size for pipe I/O.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// An owned pipe end implementing `Read`/`Write` with EINTR retries.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw file descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Pipes have no fd-level buffering to flush.
        Ok(())
    }
}

/// Buffered reader yielding one message line at a time.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER_SIZE, fd),
            buffer: String::with_capacity(4096),
        }
    }

    /// Read the next line, without its terminator. `None` means the peer
    /// closed the pipe.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.buffer.clear();
        match self.reader.read_line(&mut self.buffer) {
            Ok(0) => Ok(None),
            Ok(_) => {
                if self.buffer.ends_with('\n') {
                    self.buffer.pop();
                }
                Ok(Some(&self.buffer))
            }
            Err(e) => Err(e),
        }
    }
}

/// Buffered writer emitting one message line at a time.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Write a message followed by a newline and flush, so the peer never
    /// waits on a partial line.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
