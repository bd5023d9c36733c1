//! Endpoint finite-state machine (FSM) types.
//!
//! This module defines every state the two endpoint drivers can occupy.
//! Transitions are *not* implemented here; they live in [`crate::sender`]
//! and [`crate::receiver`], one handler per state, each returning the next
//! state.  States that follow a failure carry the error that caused them.
//!
//! Keeping state types in their own module makes it easy to add guard logic,
//! entry/exit actions, or tracing without touching task plumbing.

use std::net::SocketAddr;

use crate::error::EndpointError;

/// States of the sending endpoint.
///
/// ```text
///  ValidateArgs ──▶ CreateSocket ──▶ Handshake ──▶ ReadyForTransmitting ──▶ Transmitting
///       │                │               │                 │                 │    ▲
///       └────────────────┴───────────────┴─────────────────┘                 │    │
///                               │                                            ▼    │
///                               ▼                              ErrorHandling ──▶ Recover
///                          FatalError ◀──────────────────────────── │
///                               │
///                               ▼
///                          Termination ◀── end of input / shutdown
/// ```
#[derive(Debug)]
pub enum SenderState {
    /// Parse and validate `<ip> <port>`.
    ValidateArgs,
    /// Open a datagram socket connected to the validated receiver address.
    CreateSocket(SocketAddr),
    /// Repeat SYN until the receiver answers.
    Handshake,
    /// Start the input reader.
    ReadyForTransmitting,
    /// Steady state: wait for end of input, resend requests or task errors.
    Transmitting,
    /// A worker reported a recoverable error; stop and join every task.
    ErrorHandling(EndpointError),
    /// Restart the reader, transmitter and listener.
    Recover,
    /// Unrecoverable; log and terminate.
    FatalError(EndpointError),
    /// Stop and join every task, close the socket.
    Termination,
}

/// States of the receiving endpoint.
///
/// ```text
///  Init ──▶ CreateSocket ──▶ ReadyForReceiving ──▶ Receiving ──▶ HandleError ──▶ Recover
///    │           │                                  │    ▲                          │
///    └───────────┴──▶ FatalError ──▶ Termination ◀──┘    └──────────────────────────┘
/// ```
#[derive(Debug)]
pub enum ReceiverState {
    /// Install the interrupt handler and validate `<ip> <port>`.
    Init,
    /// Bind the listening socket on the validated address.
    CreateSocket(SocketAddr),
    /// Start the statistics recorder and the worker tasks.
    ReadyForReceiving,
    /// Steady state: wait for shutdown or task errors.
    Receiving,
    /// A worker reported an error; stop and join every task.
    HandleError(EndpointError),
    /// Fresh stop signal, restart the worker tasks.
    Recover,
    /// Unrecoverable; log and terminate.
    FatalError(EndpointError),
    /// Join tasks, close the socket, export statistics.
    Termination,
}

impl SenderState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ValidateArgs => "ValidateArgs",
            Self::CreateSocket(_) => "CreateSocket",
            Self::Handshake => "Handshake",
            Self::ReadyForTransmitting => "ReadyForTransmitting",
            Self::Transmitting => "Transmitting",
            Self::ErrorHandling(_) => "ErrorHandling",
            Self::Recover => "Recover",
            Self::FatalError(_) => "FatalError",
            Self::Termination => "Termination",
        }
    }
}

impl ReceiverState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::CreateSocket(_) => "CreateSocket",
            Self::ReadyForReceiving => "ReadyForReceiving",
            Self::Receiving => "Receiving",
            Self::HandleError(_) => "HandleError",
            Self::Recover => "Recover",
            Self::FatalError(_) => "FatalError",
            Self::Termination => "Termination",
        }
    }
}

impl Default for SenderState {
    fn default() -> Self {
        Self::ValidateArgs
    }
}

impl Default for ReceiverState {
    fn default() -> Self {
        Self::Init
    }
}

impl std::fmt::Display for SenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
