//! `receiver <ip> <port>`: write the received stream to stdout.
//!
//! Log lines go to stderr, so stdout carries only the payload.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reliable_udp::{ReceiverConfig, ReceiverFsm};

/// Reliable byte stream over UDP: receiving side.
#[derive(Debug, Parser)]
#[command(name = "receiver", version, about)]
struct Cli {
    /// Local address and port to bind: <ip> <port>
    #[arg(value_name = "ENDPOINT")]
    endpoint: Vec<String>,

    /// Socket read deadline, in milliseconds.
    #[arg(long, value_name = "MS")]
    read_timeout_ms: Option<u64>,

    /// Seconds between statistics snapshots.
    #[arg(long, value_name = "SECS")]
    stats_interval: Option<u64>,

    /// Where to write the statistics report on exit.
    #[arg(long, value_name = "PATH")]
    stats_file: Option<PathBuf>,

    /// Do not write a statistics report.
    #[arg(long, conflicts_with = "stats_file")]
    no_stats: bool,
}

impl Cli {
    fn config(&self) -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        if let Some(ms) = self.read_timeout_ms {
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.stats_interval {
            config.stats_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = &self.stats_file {
            config.stats_file = Some(path.clone());
        }
        if self.no_stats {
            config.stats_file = None;
        }
        config
    }
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;

    let fsm = ReceiverFsm::new(cli.endpoint, config, tokio::io::stdout());
    match runtime.block_on(fsm.run()) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
