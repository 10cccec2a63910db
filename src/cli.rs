//! Command-line surface, built with `clap`'s derive API.
//!
//! Mirrors the reference `getopt` flags one-for-one (`-i`/`-o` file,
//! `-r`/`-s` socket, plus the pipe and sizing/timeout/stats flags this
//! repository adds) the way this codebase's own `config::cli` module
//! structures a derive `Cli` struct.

use crate::config::{ConsumerSpec, ProducerSpec, TransferConfig, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE};
use anyhow::{bail, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bytepump", about = "Single-producer, multi-consumer byte stream pump", version)]
pub struct Cli {
    /// File producer: read from PATH.
    #[arg(short = 'i', long = "in-file", value_name = "PATH")]
    in_file: Option<String>,

    /// File consumer: write to PATH (repeatable, up to 2 consumers total).
    #[arg(short = 'o', long = "out-file", value_name = "PATH")]
    out_file: Vec<String>,

    /// Pipe producer: read from the named FIFO at PATH.
    #[arg(short = 'I', long = "in-pipe", value_name = "PATH")]
    in_pipe: Option<String>,

    /// Pipe consumer: write to the named FIFO at PATH.
    #[arg(short = 'O', long = "out-pipe", value_name = "PATH")]
    out_pipe: Vec<String>,

    /// Socket producer: connect to HOST[:PORT] and receive.
    #[arg(short = 'r', long = "in-socket", value_name = "HOST[:PORT]")]
    in_socket: Option<String>,

    /// Socket consumer: listen on HOST[:PORT], accept one connection, send.
    #[arg(short = 's', long = "out-socket", value_name = "HOST[:PORT]")]
    out_socket: Vec<String>,

    /// Ring buffer size in bytes. Accepts a plain integer or a size suffix
    /// (k/K, m/M, g/G).
    #[arg(short = 'B', long = "buffer-size", value_name = "N", default_value_t = DEFAULT_BUFFER_SIZE.to_string())]
    buffer_size: String,

    /// Per-submit block size in bytes. Same suffix parsing as buffer size.
    #[arg(short = 'b', long = "block-size", value_name = "N", default_value_t = DEFAULT_BLOCK_SIZE.to_string())]
    block_size: String,

    /// Multiplexer wait timeout in milliseconds. -1 waits indefinitely.
    #[arg(short = 't', long = "timeout", default_value_t = -1)]
    timeout_ms: i32,

    /// Write a JSON statistics summary to PATH after the transfer.
    #[arg(short = 'S', long = "stats", value_name = "PATH")]
    stats: Option<String>,
}

/// Parses a plain integer or a size with a `k`/`K`/`m`/`M`/`g`/`G` suffix.
pub fn parse_size(input: &str) -> Result<usize> {
    let trimmed = input.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_lowercase() {
                'k' => 1024usize,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                other => bail!("unrecognized size suffix '{}' in '{}'", other, input),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };

    let value: usize = digits.parse().map_err(|_| anyhow::anyhow!("invalid size '{}'", input))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size '{}' overflows", input))
}

impl Cli {
    pub fn into_config(self) -> Result<TransferConfig> {
        let mut producer = None;
        let mut set_producer = |p: ProducerSpec| -> Result<()> {
            if producer.is_some() {
                bail!("there can only be one producer");
            }
            producer = Some(p);
            Ok(())
        };

        if let Some(path) = self.in_file {
            set_producer(ProducerSpec::FileRead(path))?;
        }
        if let Some(path) = self.in_pipe {
            set_producer(ProducerSpec::PipeRead(path))?;
        }
        if let Some(spec) = self.in_socket {
            set_producer(ProducerSpec::SocketConnect(spec))?;
        }
        let producer = producer.ok_or_else(|| anyhow::anyhow!("please specify a producer"))?;

        let mut consumers = Vec::new();
        for path in self.out_file {
            consumers.push(ConsumerSpec::FileWrite(path));
        }
        for path in self.out_pipe {
            consumers.push(ConsumerSpec::PipeWrite(path));
        }
        for spec in self.out_socket {
            consumers.push(ConsumerSpec::SocketListen(spec));
        }
        if consumers.is_empty() {
            bail!("please specify at least one consumer");
        }

        let buffer_size = parse_size(&self.buffer_size)?;
        let block_size = parse_size(&self.block_size)?;

        Ok(TransferConfig {
            producer,
            consumers,
            buffer_size,
            block_size,
            timeout_ms: self.timeout_ms,
            stats_path: self.stats,
        })
    }
}
