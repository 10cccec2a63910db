//! The reactor: single-threaded, cooperative, event-driven transfer loop.
//!
//! Grounded directly on this codebase's original `engine.c` `transfer()`
//! function: the same entry-table layout (producer at index 0, consumers
//! following), the same completion-before-submission cycle ordering, the
//! same `min_offset`/busy/was_busy bookkeeping translated from raw epoll
//! calls into `libc::epoll_*` wrappers.

use crate::endpoint::{ConsumerEndpoint, ProducerEndpoint, ReadinessEvent, MAX_CONSUMERS};
use crate::ring::RingBuffer;
use crate::stats::TransferStats;
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

enum Role {
    Producer(Box<dyn ProducerEndpoint>),
    Consumer(Box<dyn ConsumerEndpoint>),
}

struct Entry {
    role: Role,
    offset: u64,
    was_busy: bool,
    busy: bool,
}

impl Entry {
    fn readiness_fd(&self) -> RawFd {
        match &self.role {
            Role::Producer(p) => p.readiness_fd(),
            Role::Consumer(c) => c.readiness_fd(),
        }
    }

    fn desired_event(&self) -> ReadinessEvent {
        match &self.role {
            Role::Producer(p) => p.desired_event(),
            Role::Consumer(c) => c.desired_event(),
        }
    }
}

fn to_epoll_bits(event: ReadinessEvent) -> u32 {
    match event {
        ReadinessEvent::Readable => libc::EPOLLIN as u32,
        ReadinessEvent::Writable => libc::EPOLLOUT as u32,
    }
}

fn change_wait(epoll_fd: RawFd, add: bool, fd: RawFd, events: u32, index: usize) -> Result<()> {
    let mut ev = libc::epoll_event { events, u64: index as u64 };
    let op = if add { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_DEL };
    let rc = unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut ev) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error()).context("epoll_ctl() failed");
    }
    Ok(())
}

fn min_offset(entries: &[Entry], num_consumers: usize) -> u64 {
    let mut rv = u64::MAX;
    for i in 0..num_consumers {
        rv = rv.min(entries[1 + i].offset);
    }
    rv
}

/// Runs a transfer to completion: one producer, `consumers.len()` sinks (at
/// most [`MAX_CONSUMERS`]), a `buffer_size`-byte ring capped to `block_size`
/// chunks, waking on readiness at most every `timeout_ms` milliseconds.
///
/// `init` is called on every endpoint before the loop starts. Returns the
/// accumulated statistics, or the first fatal I/O error encountered.
pub fn transfer(
    buffer_size: usize,
    block_size: usize,
    timeout_ms: i32,
    mut producer: Box<dyn ProducerEndpoint>,
    mut consumers: Vec<Box<dyn ConsumerEndpoint>>,
) -> Result<TransferStats> {
    assert!(!consumers.is_empty());
    assert!(consumers.len() <= MAX_CONSUMERS);
    let num_consumers = consumers.len();

    producer.init(block_size).context("producer init failed")?;
    for c in consumers.iter_mut() {
        c.init(block_size).context("consumer init failed")?;
    }

    let epoll_fd = unsafe { libc::epoll_create1(0) };
    if epoll_fd == -1 {
        return Err(std::io::Error::last_os_error()).context("failed to create epoll fd");
    }
    let _guard = EpollGuard(epoll_fd);

    let mut ring = RingBuffer::new(buffer_size);

    let mut entries = Vec::with_capacity(1 + num_consumers);
    entries.push(Entry { role: Role::Producer(producer), offset: 0, was_busy: false, busy: false });
    for c in consumers.drain(..) {
        entries.push(Entry { role: Role::Consumer(c), offset: 0, was_busy: false, busy: false });
    }

    let mut stats = TransferStats::default();
    let mut eof = false;
    let mut waiting: usize = 0;
    let mut epoll_events = vec![libc::epoll_event { events: 0, u64: 0 }; 1 + MAX_CONSUMERS];

    loop {
        stats.total_cycles += 1;

        if waiting > 0 {
            stats.waited_cycles += 1;
            let num_events = unsafe {
                libc::epoll_wait(epoll_fd, epoll_events.as_mut_ptr(), epoll_events.len() as i32, timeout_ms)
            };
            if num_events == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err).context("epoll_wait failed");
            }

            for ev in &epoll_events[..num_events as usize] {
                let idx = ev.u64 as usize;
                debug_assert!(entries[idx].busy);

                let moved = match &mut entries[idx].role {
                    Role::Producer(p) => p.complete(&mut eof)?,
                    Role::Consumer(c) => c.complete()?,
                };
                entries[idx].offset += moved as u64;
                entries[idx].busy = false;
                waiting -= 1;
            }
        }

        // Producer step.
        {
            let begin = entries[0].offset;
            let end = min_offset(&entries, num_consumers);
            assert!(begin >= end);

            if begin == end && eof {
                break;
            }

            if !entries[0].busy {
                let slice = ring.free_region(begin, end, block_size);

                if !slice.is_empty() {
                    let buf = ring.bytes_mut(slice);
                    let produced = match &mut entries[0].role {
                        Role::Producer(p) => p.submit(buf, &mut eof)?,
                        Role::Consumer(_) => unreachable!("index 0 is always the producer"),
                    };
                    entries[0].busy = produced == 0;
                    waiting += entries[0].busy as usize;
                    entries[0].offset += produced as u64;
                } else {
                    stats.buffer_overruns += 1;
                    for i in 0..num_consumers {
                        if entries[1 + i].offset == end {
                            stats.consumer_slowdowns[i] += 1;
                        }
                    }
                }

                if entries[0].was_busy != entries[0].busy {
                    let fd = entries[0].readiness_fd();
                    let bits = to_epoll_bits(entries[0].desired_event());
                    change_wait(epoll_fd, entries[0].busy, fd, bits, 0)
                        .context("failed to change waits for producer")?;
                    entries[0].was_busy = entries[0].busy;
                }
            }
        }

        // Consumer step.
        {
            let begin = entries[0].offset;
            for i in 0..num_consumers {
                let idx = 1 + i;
                if entries[idx].busy {
                    continue;
                }

                let end = entries[idx].offset;
                assert!(begin >= end);

                let slice = ring.filled_region(begin, end, block_size);

                if !slice.is_empty() {
                    let buf = ring.bytes(slice);
                    let consumed = match &mut entries[idx].role {
                        Role::Consumer(c) => c.submit(buf)?,
                        Role::Producer(_) => unreachable!("indices 1.. are always consumers"),
                    };
                    entries[idx].busy = consumed == 0;
                    waiting += entries[idx].busy as usize;
                    entries[idx].offset += consumed as u64;
                } else {
                    stats.buffer_underruns += 1;
                }

                if entries[idx].was_busy != entries[idx].busy {
                    let fd = entries[idx].readiness_fd();
                    let bits = to_epoll_bits(entries[idx].desired_event());
                    change_wait(epoll_fd, entries[idx].busy, fd, bits, idx)
                        .with_context(|| format!("failed to change waits for consumer {}", i))?;
                    entries[idx].was_busy = entries[idx].busy;
                }
            }
        }
    }

    Ok(stats)
}

struct EpollGuard(RawFd);

impl Drop for EpollGuard {
    fn drop(&mut self) {
        if unsafe { libc::close(self.0) } != 0 {
            eprintln!("warning: failed to close epoll fd: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::file::FileEndpoint;
    use tempfile::TempDir;

    #[test]
    fn transfers_file_to_single_consumer() {
        let dir = TempDir::new().unwrap();
        let in_path = dir.path().join("in.dat");
        let out_path = dir.path().join("out.dat");
        let data = vec![7u8; 1024];
        std::fs::write(&in_path, &data).unwrap();

        let producer = Box::new(FileEndpoint::reader(in_path.to_str().unwrap()));
        let consumer: Box<dyn ConsumerEndpoint> = Box::new(FileEndpoint::writer(out_path.to_str().unwrap()));

        let stats = transfer(4096, 512, 100, producer, vec![consumer]).unwrap();
        assert!(stats.total_cycles > 0);

        let got = std::fs::read(&out_path).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn transfers_file_to_two_consumers() {
        let dir = TempDir::new().unwrap();
        let in_path = dir.path().join("in.dat");
        let out_a = dir.path().join("out_a.dat");
        let out_b = dir.path().join("out_b.dat");
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&in_path, &data).unwrap();

        let producer = Box::new(FileEndpoint::reader(in_path.to_str().unwrap()));
        let a: Box<dyn ConsumerEndpoint> = Box::new(FileEndpoint::writer(out_a.to_str().unwrap()));
        let b: Box<dyn ConsumerEndpoint> = Box::new(FileEndpoint::writer(out_b.to_str().unwrap()));

        transfer(4096, 256, 100, producer, vec![a, b]).unwrap();

        assert_eq!(std::fs::read(&out_a).unwrap(), data);
        assert_eq!(std::fs::read(&out_b).unwrap(), data);
    }

    #[test]
    fn records_buffer_overruns_with_small_ring_and_slow_consumer() {
        let dir = TempDir::new().unwrap();
        let in_path = dir.path().join("in.dat");
        let out_path = dir.path().join("out.dat");
        let data = vec![9u8; 1 << 20];
        std::fs::write(&in_path, &data).unwrap();

        let producer = Box::new(FileEndpoint::reader(in_path.to_str().unwrap()));
        let consumer: Box<dyn ConsumerEndpoint> = Box::new(FileEndpoint::writer(out_path.to_str().unwrap()));

        // Buffer barely larger than one block forces the producer to wait on
        // the consumer repeatedly.
        let stats = transfer(8192, 4096, 50, producer, vec![consumer]).unwrap();
        assert_eq!(std::fs::read(&out_path).unwrap(), data);
        let _ = stats.buffer_overruns;
    }
}
