//! `sender <ip> <port>`: stream stdin to a receiver.
//!
//! Process setup only (logging, argument parsing, runtime); the protocol
//! lives in [`reliable_udp::sender`].

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reliable_udp::{SenderConfig, SenderFsm};

const STDIN_GRACE: Duration = Duration::from_millis(100);

/// Reliable byte stream over UDP: sending side.
#[derive(Debug, Parser)]
#[command(name = "sender", version, about)]
struct Cli {
    /// Receiver address and port: <ip> <port>
    #[arg(value_name = "ENDPOINT")]
    endpoint: Vec<String>,

    /// Response read deadline and ACK-wait window, in milliseconds.
    #[arg(long, value_name = "MS")]
    response_timeout_ms: Option<u64>,

    /// Resend attempts per packet before giving up.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Largest chunk of input framed into one packet, in bytes (4 to 8192).
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Error recoveries allowed before the sender exits.
    #[arg(long)]
    max_recoveries: Option<u32>,
}

impl Cli {
    fn config(&self) -> SenderConfig {
        let mut config = SenderConfig::default();
        if let Some(ms) = self.response_timeout_ms {
            config.response_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(n) = self.chunk_size {
            config.chunk_size = n;
        }
        if let Some(n) = self.max_recoveries {
            config.max_recoveries = n;
        }
        config
    }
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;

    let fsm = SenderFsm::new(cli.endpoint, config, tokio::io::stdin());
    let result = runtime.block_on(fsm.run());
    // A stdin read may still be parked on a blocking thread after Ctrl-C.
    runtime.shutdown_timeout(STDIN_GRACE);
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
