//! bytepump CLI entry point

use anyhow::Context;
use bytepump::cli::Cli;
use bytepump::config::{ConsumerSpec, ProducerSpec, TransferConfig};
use bytepump::endpoint::file::FileEndpoint;
use bytepump::endpoint::pipe::PipeEndpoint;
use bytepump::endpoint::socket::SocketEndpoint;
use bytepump::endpoint::ConsumerEndpoint;
use bytepump::endpoint::ProducerEndpoint;
use bytepump::reactor;
use bytepump::Result;
use clap::Parser;

fn build_producer(spec: &ProducerSpec) -> Result<Box<dyn ProducerEndpoint>> {
    Ok(match spec {
        ProducerSpec::FileRead(path) => Box::new(FileEndpoint::reader(path.clone())),
        ProducerSpec::PipeRead(path) => Box::new(PipeEndpoint::reader(path.clone())),
        ProducerSpec::SocketConnect(addr) => Box::new(SocketEndpoint::connector(addr)?),
    })
}

fn build_consumer(spec: &ConsumerSpec) -> Result<Box<dyn ConsumerEndpoint>> {
    Ok(match spec {
        ConsumerSpec::FileWrite(path) => Box::new(FileEndpoint::writer(path.clone())),
        ConsumerSpec::PipeWrite(path) => Box::new(PipeEndpoint::writer(path.clone())),
        ConsumerSpec::SocketListen(addr) => Box::new(SocketEndpoint::listener(addr)?),
    })
}

fn consumer_name(spec: &ConsumerSpec) -> &str {
    match spec {
        ConsumerSpec::FileWrite(path) => path,
        ConsumerSpec::PipeWrite(path) => path,
        ConsumerSpec::SocketListen(addr) => addr,
    }
}

fn run(config: TransferConfig) -> Result<()> {
    config.validate().map_err(anyhow::Error::from)?;

    let producer = build_producer(&config.producer)?;
    let consumer_names: Vec<&str> = config.consumers.iter().map(|c| consumer_name(c)).collect();
    let consumers = config
        .consumers
        .iter()
        .map(build_consumer)
        .collect::<Result<Vec<_>>>()?;

    let stats = reactor::transfer(config.buffer_size, config.block_size, config.timeout_ms, producer, consumers)
        .context("transfer failed")?;

    if let Some(path) = &config.stats_path {
        stats.dump(path, &consumer_names).with_context(|| format!("failed to write stats to {}", path))?;
    }

    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return std::process::ExitCode::from(1);
        }
    };

    match run(config) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::ExitCode::from(1)
        }
    }
}
