//! Data-plane strategies for moving a file to the connected peer

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Channel;
use crate::error::TransferError;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Strategy {
    /// Read into a user buffer and encrypt through the rustls session
    #[serde(rename = "tls-write")]
    #[value(name = "tls-write")]
    TlsRecordWrite,
    /// Read into a user buffer and write(2) to the socket
    #[serde(rename = "send")]
    #[value(name = "send")]
    RawSocketSend,
    /// sendfile(2) straight from the page cache
    #[serde(rename = "sendfile")]
    #[value(name = "sendfile")]
    SendfileZeroCopy,
    /// splice(2) file -> pipe -> socket
    #[serde(rename = "splice")]
    #[value(name = "splice")]
    SpliceZeroCopy,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::TlsRecordWrite
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::TlsRecordWrite => "tls-write",
            Strategy::RawSocketSend => "send",
            Strategy::SendfileZeroCopy => "sendfile",
            Strategy::SpliceZeroCopy => "splice",
        })
    }
}

/// One file to send, opened for the duration of a round
pub struct TransferJob {
    source: File,
    path: PathBuf,
    total_length: u64,
    chunk_size: usize,
}

impl TransferJob {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let open_err = |source| TransferError::Open {
            path: path.to_path_buf(),
            source,
        };
        let source = File::open(path).map_err(open_err)?;
        let total_length = source.metadata().map_err(open_err)?.len();
        Ok(TransferJob {
            source,
            path: path.to_path_buf(),
            total_length,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn next_len(&self, moved: u64) -> usize {
        (self.total_length - moved).min(self.chunk_size as u64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferResult {
    pub bytes_moved: u64,
    pub elapsed: Duration,
}

impl TransferResult {
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_moved as f64 / (1024.0 * 1024.0) / secs
    }
}

impl Strategy {
    /// Only `TlsRecordWrite` encrypts in user space; the rest need a raw socket
    pub fn requires_user_tls(self) -> bool {
        matches!(self, Strategy::TlsRecordWrite)
    }

    /// Move `job.total_length` bytes from the source file to the peer
    pub fn send(
        self,
        channel: &mut Channel,
        job: &mut TransferJob,
    ) -> Result<TransferResult, TransferError> {
        let precondition = TransferError::Precondition {
            strategy: self,
            channel: channel.name(),
        };
        let start = Instant::now();

        let moved = match self {
            Strategy::TlsRecordWrite => {
                let session = channel.tls_session_mut().ok_or(precondition)?;
                let moved = copy_buffered(job, |buf| session.write_all(buf))?;
                session.flush().map_err(TransferError::Write)?;
                moved
            }
            Strategy::RawSocketSend => {
                let sock = channel.raw_socket_mut().ok_or(precondition)?;
                copy_buffered(job, |buf| sock.write_all(buf))?
            }
            Strategy::SendfileZeroCopy => {
                let sock = channel.raw_socket_mut().ok_or(precondition)?;
                zero_copy::sendfile(job, sock)?
            }
            Strategy::SpliceZeroCopy => {
                let sock = channel.raw_socket_mut().ok_or(precondition)?;
                zero_copy::splice(job, sock)?
            }
        };

        let result = TransferResult {
            bytes_moved: moved,
            elapsed: start.elapsed(),
        };
        debug!(
            strategy = %self,
            bytes = result.bytes_moved,
            elapsed_us = result.elapsed.as_micros() as u64,
            "transfer complete"
        );
        Ok(result)
    }
}

fn read_retrying(source: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Shared loop of the two user-buffer strategies
fn copy_buffered<W>(job: &mut TransferJob, mut write_all: W) -> Result<u64, TransferError>
where
    W: FnMut(&[u8]) -> io::Result<()>,
{
    let mut buf = vec![0u8; job.chunk_size];
    let mut moved = 0u64;
    while moved < job.total_length {
        let want = job.next_len(moved);
        let n = read_retrying(&mut job.source, &mut buf[..want]).map_err(TransferError::Read)?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: job.total_length,
                moved,
            });
        }
        write_all(&buf[..n]).map_err(TransferError::Write)?;
        moved += n as u64;
    }
    Ok(moved)
}

#[cfg(target_os = "linux")]
mod zero_copy {
    use std::io;
    use std::net::TcpStream;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use super::TransferJob;
    use crate::error::TransferError;

    const SPLICE_F_MOVE: libc::c_uint = 0x01;
    const SPLICE_F_MORE: libc::c_uint = 0x04;

    fn retry_eintr(mut op: impl FnMut() -> isize) -> io::Result<usize> {
        loop {
            let rc = op();
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub(super) fn sendfile(job: &mut TransferJob, sock: &TcpStream) -> Result<u64, TransferError> {
        let in_fd = job.source.as_raw_fd();
        let out_fd = sock.as_raw_fd();
        let mut offset: libc::off_t = 0;
        let mut moved = 0u64;
        while moved < job.total_length {
            let want = job.next_len(moved);
            let n = retry_eintr(|| unsafe { libc::sendfile(out_fd, in_fd, &mut offset, want) })
                .map_err(TransferError::Sendfile)?;
            if n == 0 {
                return Err(TransferError::Truncated {
                    expected: job.total_length,
                    moved,
                });
            }
            moved += n as u64;
        }
        Ok(moved)
    }

    /// Both ends close when dropped
    struct Pipe {
        rd: OwnedFd,
        wr: OwnedFd,
    }

    impl Pipe {
        fn new() -> io::Result<Self> {
            let mut fds: [libc::c_int; 2] = [-1; 2];
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
            Ok(Pipe { rd, wr })
        }
    }

    fn splice_once(
        fd_in: RawFd,
        off_in: Option<&mut libc::loff_t>,
        fd_out: RawFd,
        len: usize,
        flags: libc::c_uint,
    ) -> io::Result<usize> {
        let off_ptr = match off_in {
            Some(off) => off as *mut libc::loff_t,
            None => std::ptr::null_mut(),
        };
        retry_eintr(|| unsafe {
            libc::splice(fd_in, off_ptr, fd_out, std::ptr::null_mut(), len, flags)
        })
    }

    pub(super) fn splice(job: &mut TransferJob, sock: &TcpStream) -> Result<u64, TransferError> {
        let pipe = Pipe::new().map_err(TransferError::Pipe)?;
        let file_fd = job.source.as_raw_fd();
        let sock_fd = sock.as_raw_fd();
        let mut offset: libc::loff_t = 0;
        let mut moved = 0u64;

        while moved < job.total_length {
            let want = job.next_len(moved);
            let staged = splice_once(
                file_fd,
                Some(&mut offset),
                pipe.wr.as_raw_fd(),
                want,
                SPLICE_F_MOVE,
            )
            .map_err(TransferError::Splice)?;
            if staged == 0 {
                return Err(TransferError::Truncated {
                    expected: job.total_length,
                    moved,
                });
            }

            let last = moved + staged as u64 >= job.total_length;
            let flags = if last {
                SPLICE_F_MOVE
            } else {
                SPLICE_F_MOVE | SPLICE_F_MORE
            };
            let mut left = staged;
            while left > 0 {
                let n = splice_once(pipe.rd.as_raw_fd(), None, sock_fd, left, flags)
                    .map_err(TransferError::Splice)?;
                if n == 0 {
                    return Err(TransferError::Truncated {
                        expected: job.total_length,
                        moved: moved + (staged - left) as u64,
                    });
                }
                left -= n;
            }
            moved += staged as u64;
        }
        Ok(moved)
    }
}

#[cfg(not(target_os = "linux"))]
mod zero_copy {
    use std::net::TcpStream;

    use super::{Strategy, TransferJob};
    use crate::error::TransferError;

    pub(super) fn sendfile(_job: &mut TransferJob, _sock: &TcpStream) -> Result<u64, TransferError> {
        Err(TransferError::Unsupported(Strategy::SendfileZeroCopy))
    }

    pub(super) fn splice(_job: &mut TransferJob, _sock: &TcpStream) -> Result<u64, TransferError> {
        Err(TransferError::Unsupported(Strategy::SpliceZeroCopy))
    }
}
