//! Named-pipe (FIFO) endpoint: nonblocking read/write, no address
//! resolution, synchronous completion only — `submit` either moves bytes
//! immediately or reports the request pending; `complete` is never called
//! because a pipe never leaves a request outstanding past `submit`.
//!
//! Grounded on the original pipe collaborator: the same `open` +
//! `fstat`/`S_ISFIFO` validation, the same would-block-vs-eof-vs-error
//! triage on `read`/`write`.

use super::{ConsumerEndpoint, ProducerEndpoint, ReadinessEvent};
use crate::Result;
use anyhow::{bail, Context};
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

pub struct PipeEndpoint {
    filename: String,
    direction: Direction,
    fd: RawFd,
}

impl PipeEndpoint {
    pub fn reader(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), direction: Direction::Read, fd: -1 }
    }

    pub fn writer(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), direction: Direction::Write, fd: -1 }
    }

    fn do_init(&mut self) -> Result<()> {
        let mut flags = libc::O_NONBLOCK | libc::O_LARGEFILE;
        flags |= match self.direction {
            Direction::Read => libc::O_RDONLY,
            Direction::Write => libc::O_WRONLY | libc::O_CREAT,
        };

        let cfilename = std::ffi::CString::new(self.filename.as_str())
            .context("filename contains an interior NUL byte")?;

        let fd = unsafe { libc::open(cfilename.as_ptr(), flags, 0o600) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to open {}", self.filename));
        }
        self.fd = fd;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to fstat {}", self.filename));
        }
        if stat.st_mode & libc::S_IFMT != libc::S_IFIFO {
            bail!("{} is not a fifo", self.filename);
        }

        Ok(())
    }
}

fn would_block(rv: isize) -> bool {
    if rv != -1 {
        return false;
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if self.fd != -1 {
            if unsafe { libc::close(self.fd) } != 0 {
                eprintln!(
                    "warning: failed to close {}: {}",
                    self.filename,
                    std::io::Error::last_os_error()
                );
            }
            self.fd = -1;
        }
    }
}

impl ProducerEndpoint for PipeEndpoint {
    fn init(&mut self, _block_size: usize) -> Result<()> {
        self.do_init()
    }

    fn readiness_fd(&self) -> RawFd {
        self.fd
    }

    fn desired_event(&self) -> ReadinessEvent {
        ReadinessEvent::Readable
    }

    fn submit(&mut self, buf: &mut [u8], eof: &mut bool) -> Result<usize> {
        let rv = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if would_block(rv) {
            *eof = false;
            return Ok(0);
        }
        if rv == 0 {
            *eof = true;
            return Ok(0);
        }
        if rv < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("read failed for {}", self.filename));
        }
        *eof = false;
        Ok(rv as usize)
    }

    /// Pipes never perform real async completion: a pending `submit` only
    /// means the reactor saw `EAGAIN` and is waiting for the fd to become
    /// readable again. `complete` is the stub the reactor calls once that
    /// happens; it does nothing but clear the busy flag so the next cycle's
    /// `submit` retries the read with data actually available.
    fn complete(&mut self, _eof: &mut bool) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &str {
        &self.filename
    }
}

impl ConsumerEndpoint for PipeEndpoint {
    fn init(&mut self, _block_size: usize) -> Result<()> {
        self.do_init()
    }

    fn readiness_fd(&self) -> RawFd {
        self.fd
    }

    fn desired_event(&self) -> ReadinessEvent {
        ReadinessEvent::Writable
    }

    fn submit(&mut self, buf: &[u8]) -> Result<usize> {
        let rv = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if would_block(rv) {
            return Ok(0);
        }
        if rv < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("write failed for {}", self.filename));
        }
        Ok(rv as usize)
    }

    fn complete(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &str {
        &self.filename
    }
}
