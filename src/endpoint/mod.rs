//! Endpoint contract
//!
//! An endpoint is either a producer (one per transfer) or a consumer (one to
//! [`MAX_CONSUMERS`]). Every endpoint implementation — file, socket, pipe —
//! goes through the same two traits so the reactor never branches on the
//! concrete type.
//!
//! # Return-value convention
//!
//! Both `submit` and `complete` share one convention across every endpoint:
//!
//! - `Ok(n)` with `n > 0` — `n` bytes were transferred synchronously; the
//!   endpoint is not busy.
//! - `Ok(0)` from `submit` — the request was accepted but completion is
//!   pending; the caller must mark the endpoint busy and wait for
//!   `readiness_fd` to fire before calling `complete`. Producers may also
//!   return `Ok(0)` with `eof` set to signal end of stream.
//! - `Err(_)` — a fatal I/O failure; the transfer must abort.

use crate::Result;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
pub mod file;
pub mod pipe;
pub mod socket;

/// Maximum number of consumers a single transfer may have.
pub const MAX_CONSUMERS: usize = 2;

/// Which readiness event an endpoint wants the reactor to watch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessEvent {
    Readable,
    Writable,
}

/// A byte-producing endpoint (the single source of the transfer).
pub trait ProducerEndpoint {
    /// Open descriptors, resolve addresses, perform any blocking setup.
    /// Called exactly once before the transfer loop starts.
    fn init(&mut self, block_size: usize) -> Result<()>;

    /// The descriptor the reactor should watch while this endpoint is busy.
    fn readiness_fd(&self) -> RawFd;

    /// The readiness event kind this endpoint wants to be woken on.
    fn desired_event(&self) -> ReadinessEvent;

    /// Attempt to fill `buf` (at most `buf.len()` bytes). Returns the number
    /// of bytes placed into `buf` synchronously, `0` with `*eof` unset if the
    /// request is now pending, or `0` with `*eof` set if end of stream was
    /// observed.
    fn submit(&mut self, buf: &mut [u8], eof: &mut bool) -> Result<usize>;

    /// Reap a previously pending `submit`. Only called after `readiness_fd`
    /// has fired. Returns the number of bytes transferred, signalling EOF via
    /// `*eof` the same way `submit` does.
    fn complete(&mut self, eof: &mut bool) -> Result<usize>;

    /// Display name used in statistics and diagnostics (file path, pipe path,
    /// or `host:port` spec).
    fn name(&self) -> &str;
}

/// A byte-consuming endpoint (one of up to [`MAX_CONSUMERS`] sinks).
pub trait ConsumerEndpoint {
    fn init(&mut self, block_size: usize) -> Result<()>;

    fn readiness_fd(&self) -> RawFd;

    fn desired_event(&self) -> ReadinessEvent;

    /// Attempt to drain `buf` into the sink. Returns the number of bytes
    /// consumed synchronously, or `0` if the request is now pending.
    fn submit(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reap a previously pending `submit`. Only called after `readiness_fd`
    /// has fired.
    fn complete(&mut self) -> Result<usize>;

    fn name(&self) -> &str;
}
