//! bytepump - single-producer, multi-consumer byte stream pump
//!
//! Moves bytes from one source endpoint (file, socket, or named pipe) to one
//! or more sink endpoints through a fixed-size ring buffer, driven by a
//! single-threaded, epoll-based reactor.
//!
//! # Architecture
//!
//! - **Ring buffer**: translates monotonic producer/consumer offsets into
//!   non-wrapping physical slices.
//! - **Endpoint contract**: `ProducerEndpoint`/`ConsumerEndpoint` traits
//!   implemented by the file (kernel AIO), socket, and pipe endpoints.
//! - **Reactor**: the cooperative transfer loop tying endpoints to the ring
//!   buffer via epoll readiness notification.

pub mod cli;
pub mod config;
pub mod endpoint;
pub mod reactor;
pub mod ring;
pub mod stats;

/// Result type used throughout bytepump.
pub type Result<T> = anyhow::Result<T>;
