//! Startup configuration: what to transfer, sized and validated before the
//! reactor ever runs.
//!
//! Grounded on `defaults.h`'s constants and on this codebase's own
//! `config::validator` module for the style of up-front, fail-fast
//! validation (here expressed with `thiserror` instead of `anyhow::bail!`,
//! since these are user-facing, machine-distinguishable error kinds rather
//! than an internal failure chain).

use crate::endpoint::MAX_CONSUMERS;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum ProducerSpec {
    FileRead(String),
    SocketConnect(String),
    PipeRead(String),
}

#[derive(Debug, Clone)]
pub enum ConsumerSpec {
    FileWrite(String),
    SocketListen(String),
    PipeWrite(String),
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub producer: ProducerSpec,
    pub consumers: Vec<ConsumerSpec>,
    pub buffer_size: usize,
    pub block_size: usize,
    pub timeout_ms: i32,
    pub stats_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer size ({buffer_size}) must be strictly greater than block size ({block_size})")]
    BufferNotLargerThanBlock { buffer_size: usize, block_size: usize },

    #[error("buffer size ({buffer_size}) must be a multiple of block size ({block_size})")]
    BufferNotMultipleOfBlock { buffer_size: usize, block_size: usize },

    #[error("no consumers specified; at least one is required")]
    NoConsumers,

    #[error("too many consumers ({count}); at most {max} are supported")]
    TooManyConsumers { count: usize, max: usize },

    #[error("buffer size and block size must both be non-zero")]
    ZeroSize,
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 || self.block_size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if self.buffer_size <= self.block_size {
            return Err(ConfigError::BufferNotLargerThanBlock {
                buffer_size: self.buffer_size,
                block_size: self.block_size,
            });
        }
        if self.buffer_size % self.block_size != 0 {
            return Err(ConfigError::BufferNotMultipleOfBlock {
                buffer_size: self.buffer_size,
                block_size: self.block_size,
            });
        }
        if self.consumers.is_empty() {
            return Err(ConfigError::NoConsumers);
        }
        if self.consumers.len() > MAX_CONSUMERS {
            return Err(ConfigError::TooManyConsumers { count: self.consumers.len(), max: MAX_CONSUMERS });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TransferConfig {
        TransferConfig {
            producer: ProducerSpec::FileRead("in.dat".into()),
            consumers: vec![ConsumerSpec::FileWrite("out.dat".into())],
            buffer_size: DEFAULT_BUFFER_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            timeout_ms: -1,
            stats_path: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_buffer_not_larger_than_block() {
        let mut cfg = base_config();
        cfg.buffer_size = cfg.block_size;
        assert!(matches!(cfg.validate(), Err(ConfigError::BufferNotLargerThanBlock { .. })));
    }

    #[test]
    fn rejects_buffer_not_a_multiple_of_block() {
        let mut cfg = base_config();
        cfg.buffer_size = cfg.block_size * 2 + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::BufferNotMultipleOfBlock { .. })));
    }

    #[test]
    fn rejects_no_consumers() {
        let mut cfg = base_config();
        cfg.consumers.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoConsumers)));
    }

    #[test]
    fn rejects_too_many_consumers() {
        let mut cfg = base_config();
        for i in 0..MAX_CONSUMERS {
            cfg.consumers.push(ConsumerSpec::FileWrite(format!("extra{}.dat", i)));
        }
        assert!(matches!(cfg.validate(), Err(ConfigError::TooManyConsumers { .. })));
    }
}
