//! File endpoint: kernel AIO (libaio) on a regular file, notified through an
//! eventfd. Always asynchronous — `submit` never moves bytes synchronously,
//! it only ever enqueues one outstanding request and reports it pending.
//!
//! Grounded on this codebase's own `engine::libaio` module: direct syscalls
//! rather than a binding crate, since the libaio userspace library is LGPL
//! and would be a licensing mismatch for an MIT crate.

use super::{ConsumerEndpoint, ProducerEndpoint, ReadinessEvent};
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;
const IOCB_FLAG_RESFD: u32 = 1 << 0;

const SYS_IO_SETUP: i64 = 206;
const SYS_IO_DESTROY: i64 = 207;
const SYS_IO_SUBMIT: i64 = 209;
const SYS_IO_GETEVENTS: i64 = 208;

#[repr(C)]
#[derive(Clone, Copy)]
struct IoControlBlock {
    data: u64,
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(SYS_IO_SETUP, maxevents as i64, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(SYS_IO_DESTROY, ctx) as libc::c_int
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_int {
    libc::syscall(SYS_IO_SUBMIT, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(SYS_IO_GETEVENTS, ctx, min_nr, nr, events, timeout) as libc::c_int
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// File endpoint shared by both producer and consumer roles; role is fixed at
/// construction by which trait is used to drive it.
pub struct FileEndpoint {
    filename: String,
    direction: Direction,
    fd: RawFd,
    notify_fd: RawFd,
    ctx: AioContext,
    iocb: IoControlBlock,
    offset: u64,
    /// Set once `submit` has enqueued a request, cleared on `complete`.
    pending: bool,
}

impl FileEndpoint {
    pub fn reader(filename: impl Into<String>) -> Self {
        Self::new(filename.into(), Direction::Read)
    }

    pub fn writer(filename: impl Into<String>) -> Self {
        Self::new(filename.into(), Direction::Write)
    }

    fn new(filename: String, direction: Direction) -> Self {
        Self {
            filename,
            direction,
            fd: -1,
            notify_fd: -1,
            ctx: 0,
            iocb: unsafe { std::mem::zeroed() },
            offset: 0,
            pending: false,
        }
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

        let notify_fd = unsafe { libc::eventfd(0, 0) };
        if notify_fd == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to create eventfd for {}", self.filename));
        }
        self.notify_fd = notify_fd;

        let mut ctx: AioContext = 0;
        let rc = unsafe { io_setup(1, &mut ctx) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_setup failed for {}", self.filename));
        }
        self.ctx = ctx;

        self.iocb = IoControlBlock {
            data: 0,
            key: 0,
            aio_rw_flags: 0,
            lio_opcode: match self.direction {
                Direction::Read => IOCB_CMD_PREAD,
                Direction::Write => IOCB_CMD_PWRITE,
            },
            aio_reqprio: 0,
            aio_fildes: self.fd as u32,
            buf: 0,
            nbytes: 0,
            offset: 0,
            aio_reserved2: 0,
            flags: IOCB_FLAG_RESFD,
            aio_resfd: self.notify_fd as u32,
        };

        Ok(())
    }

    fn do_submit(&mut self, buf: *mut u8, len: usize) -> Result<()> {
        self.iocb.buf = buf as u64;
        self.iocb.nbytes = len as u64;
        self.iocb.offset = self.offset as i64;

        let mut iocb_ptr = &mut self.iocb as *mut IoControlBlock;
        let rc = unsafe { io_submit(self.ctx, 1, &mut iocb_ptr) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_submit failed for {}", self.filename));
        }
        self.pending = true;
        Ok(())
    }

    fn do_complete(&mut self) -> Result<usize> {
        let mut event: IoEvent = unsafe { std::mem::zeroed() };
        let rc = unsafe { io_getevents(self.ctx, 1, 1, &mut event, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_getevents failed for {}", self.filename));
        }
        self.pending = false;

        if event.res < 0 {
            let errno = (-event.res) as i32;
            return Err(std::io::Error::from_raw_os_error(errno))
                .with_context(|| format!("async {:?} failed for {}", self.direction, self.filename));
        }

        let n = event.res as usize;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Drop for FileEndpoint {
    fn drop(&mut self) {
        if self.ctx != 0 {
            if unsafe { io_destroy(self.ctx) } < 0 {
                eprintln!(
                    "warning: failed to destroy aio context for {}: {}",
                    self.filename,
                    std::io::Error::last_os_error()
                );
            }
            self.ctx = 0;
        }
        if self.notify_fd != -1 {
            if unsafe { libc::close(self.notify_fd) } != 0 {
                eprintln!(
                    "warning: failed to close eventfd for {}: {}",
                    self.filename,
                    std::io::Error::last_os_error()
                );
            }
            self.notify_fd = -1;
        }
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

impl ProducerEndpoint for FileEndpoint {
    fn init(&mut self, _block_size: usize) -> Result<()> {
        self.do_init()
    }

    fn readiness_fd(&self) -> RawFd {
        self.notify_fd
    }

    fn desired_event(&self) -> ReadinessEvent {
        ReadinessEvent::Readable
    }

    fn submit(&mut self, buf: &mut [u8], eof: &mut bool) -> Result<usize> {
        *eof = false;
        self.do_submit(buf.as_mut_ptr(), buf.len())?;
        Ok(0)
    }

    fn complete(&mut self, eof: &mut bool) -> Result<usize> {
        let n = self.do_complete()?;
        *eof = n == 0;
        Ok(n)
    }

    fn name(&self) -> &str {
        &self.filename
    }
}

impl ConsumerEndpoint for FileEndpoint {
    fn init(&mut self, _block_size: usize) -> Result<()> {
        self.do_init()
    }

    fn readiness_fd(&self) -> RawFd {
        self.notify_fd
    }

    fn desired_event(&self) -> ReadinessEvent {
        ReadinessEvent::Readable
    }

    fn submit(&mut self, buf: &[u8]) -> Result<usize> {
        self.do_submit(buf.as_ptr() as *mut u8, buf.len())?;
        Ok(0)
    }

    fn complete(&mut self) -> Result<usize> {
        self.do_complete()
    }

    fn name(&self) -> &str {
        &self.filename
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn reader_reads_file_contents_via_aio() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.dat");
        let data = b"hello from the aio file endpoint";
        std::fs::write(&path, data).unwrap();

        let mut ep = FileEndpoint::reader(path.to_str().unwrap());
        ProducerEndpoint::init(&mut ep, 4096).unwrap();

        let mut buf = vec![0u8; 4096];
        let mut eof = false;
        let n = ProducerEndpoint::submit(&mut ep, &mut buf, &mut eof).unwrap();
        assert_eq!(n, 0);
        assert!(!eof);

        let n = ProducerEndpoint::complete(&mut ep, &mut eof).unwrap();
        assert_eq!(n, data.len());
        assert!(!eof);
        assert_eq!(&buf[..n], &data[..]);
    }

    #[test]
    fn reader_reports_eof_at_end_of_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.dat");
        std::fs::write(&path, b"").unwrap();

        let mut ep = FileEndpoint::reader(path.to_str().unwrap());
        ProducerEndpoint::init(&mut ep, 4096).unwrap();

        let mut buf = vec![0u8; 4096];
        let mut eof = false;
        ProducerEndpoint::submit(&mut ep, &mut buf, &mut eof).unwrap();
        let n = ProducerEndpoint::complete(&mut ep, &mut eof).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
    }

    #[test]
    fn writer_writes_bytes_at_increasing_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.dat");
        // writer requires O_CREAT target; file endpoint creates it.
        let mut ep = FileEndpoint::writer(path.to_str().unwrap());
        ConsumerEndpoint::init(&mut ep, 4096).unwrap();

        ConsumerEndpoint::submit(&mut ep, b"abc").unwrap();
        let n = ConsumerEndpoint::complete(&mut ep).unwrap();
        assert_eq!(n, 3);

        ConsumerEndpoint::submit(&mut ep, b"def").unwrap();
        let n = ConsumerEndpoint::complete(&mut ep).unwrap();
        assert_eq!(n, 3);

        drop(ep);
        let mut f = std::fs::File::open(&path).unwrap();
        let mut got = Vec::new();
        std::io::Read::read_to_end(&mut f, &mut got).unwrap();
        assert_eq!(got, b"abcdef");
        let _ = Write::flush(&mut f);
    }
}
