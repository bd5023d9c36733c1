//! `reliable-udp`: a reliable, ordered byte stream carried over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA / SYN / FIN   ┌────────────────┐
//!  │  SenderFsm   │─────────────────────▶│  ReceiverFsm   │
//!  │ stop-and-wait│                      │ in-order only  │
//!  └──────┬───────┘                      └───────┬────────┘
//!         │          cumulative ACKs             │
//!         │◀─────────────────────────────────────┘
//!         │
//!  ┌──────▼────────────────────────────────────────────┐
//!  │ worker tasks (tokio), one error channel per FSM    │
//!  │ sender:   reader, transmitter, listener, resender  │
//!  │ receiver: listener, confirmer, writer, stats       │
//!  └──────┬────────────────────────────────────────────┘
//!         │ JSON datagrams
//!  ┌──────▼──────┐
//!  │   Socket    │  (thin async wrapper around tokio UdpSocket)
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]    : wire format, flags and header predicates
//! - [`socket`]    : async UDP socket abstraction
//! - [`config`]    : argument validation and endpoint tunables
//! - [`error`]     : the error type carried to the FSM drivers
//! - [`state`]     : finite-state-machine types
//! - [`shutdown`]  : stop and shutdown signals
//! - [`sender`]    : sending endpoint FSM and its tasks
//! - [`receiver`]  : receiving endpoint FSM and its tasks
//! - [`stats`]     : receiver statistics and the CSV report

pub mod config;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod socket;
pub mod state;
pub mod stats;

pub use config::{ReceiverConfig, SenderConfig};
pub use error::EndpointError;
pub use receiver::ReceiverFsm;
pub use sender::SenderFsm;
