//! Endpoint configuration and command-line argument validation.
//!
//! Both endpoints are invoked as `<program> <ip> <port>`.  The raw strings
//! are handed to the endpoint FSM unparsed, and validated in its first state
//! so that a bad invocation is an ordinary [`ConfigError`] flowing into the
//! `FatalError` transition.
//!
//! Tunables that are not positional live in [`SenderConfig`] and
//! [`ReceiverConfig`]; their `Default` impls are the values the binaries use
//! when no option overrides them.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Invalid invocation.  Always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid number of arguments ({got}), expected <ip> <port>")]
    ArgCount { got: usize },
    #[error("invalid ip address: {0:?}")]
    InvalidIp(String),
    #[error("invalid port number: {0:?}")]
    InvalidPort(String),
}

/// Parse a textual IPv4 or IPv6 address.
pub fn validate_ip(ip: &str) -> Result<IpAddr, ConfigError> {
    ip.parse().map_err(|_| ConfigError::InvalidIp(ip.to_string()))
}

/// Parse a decimal port in `0..=65535`.
pub fn validate_port(port: &str) -> Result<u16, ConfigError> {
    port.parse().map_err(|_| ConfigError::InvalidPort(port.to_string()))
}

/// Validate the positional `<ip> <port>` pair into a socket address.
pub fn validate_args<S: AsRef<str>>(args: &[S]) -> Result<SocketAddr, ConfigError> {
    let [ip, port] = args else {
        return Err(ConfigError::ArgCount { got: args.len() });
    };
    let ip = validate_ip(ip.as_ref())?;
    let port = validate_port(port.as_ref())?;
    Ok(SocketAddr::new(ip, port))
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Smallest input chunk; holds any single UTF-8 character.
pub const MIN_CHUNK_SIZE: usize = 4;

/// Largest input chunk.  Escaping every byte as `\u00XX` grows a payload
/// sixfold, and the result must still fit one 64 KiB datagram.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024;

/// Adjustable sender parameters.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Read deadline for the response listener, and the ACK-wait window used
    /// by both the transmitter and the retransmitter.
    pub response_timeout: Duration,
    /// Resend attempts per packet before the retransmitter gives up.
    pub max_retries: u32,
    /// Largest chunk pulled from the input in one read.
    ///
    /// JSON escaping can grow a payload several times over, so the reader
    /// uses [`SenderConfig::framed_chunk_size`], which caps it at
    /// [`MAX_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Receive buffer for a single response datagram.
    pub buffer_size: usize,
    /// Framed packets buffered between the input reader and the transmitter.
    pub queue_capacity: usize,
    /// Error recoveries allowed before the sender gives up for good.
    pub max_recoveries: u32,
    /// Map Ctrl-C to an orderly shutdown.
    pub handle_interrupt: bool,
}

impl SenderConfig {
    /// `chunk_size` bounded to [`MIN_CHUNK_SIZE`]`..=`[`MAX_CHUNK_SIZE`].
    pub fn framed_chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            max_retries: 2,
            chunk_size: 8 * 1024,
            buffer_size: 64 * 1024,
            queue_capacity: 2,
            max_recoveries: 5,
            handle_interrupt: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Adjustable receiver parameters.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Read deadline for the response listener.
    pub read_timeout: Duration,
    /// Receive buffer for a single inbound datagram.
    ///
    /// Must hold the largest framed packet the sender produces.
    pub buffer_size: usize,
    /// Datagrams and confirmed payloads buffered between tasks.
    pub queue_capacity: usize,
    /// Period of the statistics recorder.
    pub stats_interval: Duration,
    /// Destination of the statistics report written at termination.
    /// `None` disables the export.
    pub stats_file: Option<PathBuf>,
    /// Map Ctrl-C to an orderly shutdown.
    pub handle_interrupt: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            buffer_size: 64 * 1024,
            queue_capacity: 50,
            stats_interval: Duration::from_secs(10),
            stats_file: Some(PathBuf::from("receiver_performance.csv")),
            handle_interrupt: true,
        }
    }
}
