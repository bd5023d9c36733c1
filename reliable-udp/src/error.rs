//! The error type carried on each endpoint's error channel.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::packet::PacketError;
use crate::socket::SocketError;

/// Everything a worker task or FSM state can report to the driver.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("max retries exceeded for packet seq={seq} after {attempts} attempts")]
    MaxRetriesExceeded { seq: u32, attempts: u32 },
    #[error("input error: {0}")]
    Input(io::Error),
    #[error("output error: {0}")]
    Output(io::Error),
    #[error("giving up after {0} recoveries")]
    TooManyRecoveries(u32),
}

impl EndpointError {
    /// Classify a failed transport read or write.
    ///
    /// Refused and closed connections get their own variants; they recur on
    /// every read until the peer comes back.
    pub fn from_socket(err: SocketError) -> Self {
        match err.io_kind() {
            Some(io::ErrorKind::ConnectionRefused) => Self::ConnectionRefused,
            Some(
                io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe,
            ) => Self::ConnectionClosed,
            _ => Self::Socket(err),
        }
    }
}
