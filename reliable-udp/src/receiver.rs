//! Receiving endpoint.
//!
//! [`ReceiverFsm`] drives the [`ReceiverState`] machine over four tasks:
//!
//! ```text
//!   Socket ──▶ listener ──(inbound)──▶ confirmer ──(confirmed)──▶ output-writer ──▶ sink
//!                 │                       │
//!                 └── peer address ──────▶└──▶ ACK ──▶ Socket ──▶ sender
//!
//!   stats recorder: snapshots Counters every interval until shutdown
//! ```
//!
//! - Only **in-order** packets are accepted (`seqNum` == expected ack).
//! - Out-of-order and duplicate packets are dropped without buffering.
//! - An accepted payload reaches the sink whatever flags accompany it.
//! - Every packet, accepted or not, is answered with a cumulative ACK
//!   carrying the current expected ack, once the peer's address is known.
//!
//! The inbound and confirmed queues, the output sink and the ack counter
//! outlive a recovery; only the tasks are recreated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{validate_args, ReceiverConfig};
use crate::error::EndpointError;
use crate::packet::{flags, is_syn, Header, Packet};
use crate::shutdown::{stop_on_interrupt, StopHandle, StopListener};
use crate::socket::Socket;
use crate::state::ReceiverState;
use crate::stats::{record_statistics, Counters, StatsLog};

/// The receiver never sends data, so its sequence number stays put.
const LOCAL_SEQ: u32 = 0;

// ---------------------------------------------------------------------------
// AckTracker
// ---------------------------------------------------------------------------

/// Expected-ack counter of the receiving side.
///
/// Holds the sequence number of the next byte the receiver will accept.
/// Only the confirmer writes it.
#[derive(Debug, Default)]
pub struct AckTracker {
    ack: AtomicU32,
}

impl AckTracker {
    pub fn new(ack: u32) -> Self {
        Self {
            ack: AtomicU32::new(ack),
        }
    }

    /// Decide whether `header` is the next packet in order.
    ///
    /// A SYN first seeds the counter from its sequence number, so the
    /// handshake packet itself is always in order.  Does not advance; call
    /// [`AckTracker::advance`] once the payload has been handed on.
    pub fn admit(&self, header: &Header) -> bool {
        if is_syn(header) {
            self.ack.store(header.seq_num, Ordering::Release);
        }
        header.seq_num == self.ack_number()
    }

    /// Move past `data_len` accepted bytes.  Wraps at `u32::MAX`.
    pub fn advance(&self, data_len: u32) {
        self.ack.fetch_add(data_len, Ordering::AcqRel);
    }

    /// `admit` followed by `advance` for an accepted packet.
    pub fn on_packet(&self, header: &Header) -> bool {
        let accepted = self.admit(header);
        if accepted {
            self.advance(header.data_len);
        }
        accepted
    }

    /// Cumulative ACK number for the next outbound ACK.
    pub fn ack_number(&self) -> u32 {
        self.ack.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Session {
    tracker: AckTracker,
    /// Learned from the first inbound datagram.
    peer: StdMutex<Option<SocketAddr>>,
    counters: Arc<Counters>,
}

impl Session {
    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_peer(&self, addr: SocketAddr) {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if *peer != Some(addr) {
            log::info!("[receiver] peer is {addr}");
            *peer = Some(addr);
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiverFsm
// ---------------------------------------------------------------------------

/// Driver for the receiving endpoint.
///
/// Binds `<ip> <port>` and writes every in-order payload to `W`.
pub struct ReceiverFsm<W> {
    args: Vec<String>,
    config: ReceiverConfig,
    socket: Option<Arc<Socket>>,
    session: Arc<Session>,
    output: Arc<Mutex<W>>,

    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    confirmed_tx: mpsc::Sender<Vec<u8>>,
    confirmed_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    errors_tx: mpsc::UnboundedSender<EndpointError>,
    errors_rx: mpsc::UnboundedReceiver<EndpointError>,

    stop: StopHandle,
    shutdown: StopHandle,
    tasks: Vec<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
    stats: StatsLog,
    listening: watch::Sender<Option<SocketAddr>>,
}

impl<W> ReceiverFsm<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(args: Vec<String>, config: ReceiverConfig, output: W) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (confirmed_tx, confirmed_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (listening, _) = watch::channel(None);
        Self {
            args,
            config,
            socket: None,
            session: Arc::new(Session::default()),
            output: Arc::new(Mutex::new(output)),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            confirmed_tx,
            confirmed_rx: Arc::new(Mutex::new(confirmed_rx)),
            errors_tx,
            errors_rx,
            stop: StopHandle::new(),
            shutdown: StopHandle::new(),
            tasks: Vec::new(),
            recorder: None,
            stats: StatsLog::default(),
            listening,
        }
    }

    /// Handle that ends the run as if Ctrl-C had been pressed.
    pub fn shutdown_handle(&self) -> StopHandle {
        self.shutdown.clone()
    }

    /// The statistics collected so far; complete once `run` has returned.
    pub fn stats(&self) -> StatsLog {
        self.stats.clone()
    }

    /// Bound address, published once the socket is open.
    pub fn listening(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.listening.subscribe()
    }

    /// Drive the state machine to [`ReceiverState::Termination`].
    pub async fn run(mut self) -> Result<(), EndpointError> {
        let mut state = ReceiverState::default();
        let mut fatal = None;
        loop {
            log::debug!("[receiver] state → {state}");
            state = match state {
                ReceiverState::Init => self.init(),
                ReceiverState::CreateSocket(addr) => self.create_socket(addr).await,
                ReceiverState::ReadyForReceiving => self.ready_for_receiving(),
                ReceiverState::Receiving => self.receiving().await,
                ReceiverState::HandleError(err) => {
                    log::error!("Error: {err}");
                    self.stop_tasks().await;
                    ReceiverState::Recover
                }
                ReceiverState::Recover => self.recover(),
                ReceiverState::FatalError(err) => {
                    log::error!("Fatal Error: {err}");
                    fatal = Some(err);
                    ReceiverState::Termination
                }
                ReceiverState::Termination => {
                    self.terminate().await;
                    return fatal.map_or(Ok(()), Err);
                }
            };
        }
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    fn init(&mut self) -> ReceiverState {
        if self.config.handle_interrupt {
            stop_on_interrupt(self.shutdown.clone());
        }
        match validate_args(&self.args) {
            Ok(addr) => ReceiverState::CreateSocket(addr),
            Err(e) => ReceiverState::FatalError(e.into()),
        }
    }

    async fn create_socket(&mut self, addr: SocketAddr) -> ReceiverState {
        match Socket::bind(addr).await {
            Ok(socket) => {
                log::info!("UDP server listening on {}", socket.local_addr);
                self.listening.send_replace(Some(socket.local_addr));
                self.socket = Some(Arc::new(socket));
                ReceiverState::ReadyForReceiving
            }
            Err(e) => ReceiverState::FatalError(e.into()),
        }
    }

    fn ready_for_receiving(&mut self) -> ReceiverState {
        let recorder = record_statistics(
            self.session.counters.clone(),
            self.stats.clone(),
            self.config.stats_interval,
            self.shutdown.listener(),
        );
        self.recorder = Some(tokio::spawn(recorder));
        self.spawn_workers()
    }

    async fn receiving(&mut self) -> ReceiverState {
        let mut shutdown = self.shutdown.listener();
        tokio::select! {
            _ = shutdown.stopped() => ReceiverState::Termination,
            Some(err) = self.errors_rx.recv() => ReceiverState::HandleError(err),
        }
    }

    fn recover(&mut self) -> ReceiverState {
        self.stop = StopHandle::new();
        let next = self.spawn_workers();
        log::info!("Recovered from error, resuming...");
        next
    }

    async fn terminate(&mut self) {
        self.stop_tasks().await;
        self.flush_confirmed().await;
        if let Some(socket) = self.socket.take() {
            log::debug!("[receiver] closing socket {}", socket.local_addr);
        }

        self.shutdown.stop();
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.await {
                log::warn!("[receiver] stats recorder ended abnormally: {e}");
            }
        }
        if let Some(path) = &self.config.stats_file {
            match self.stats.export(path) {
                Ok(()) => log::info!("Statistics written to {}", path.display()),
                Err(e) => log::error!("Failed to write statistics to {}: {e}", path.display()),
            }
        }
        log::info!("UDP server exiting...");
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Start the output-writer, listener and confirmer for the current
    /// stop signal.
    fn spawn_workers(&mut self) -> ReceiverState {
        let Some(socket) = self.socket.clone() else {
            return ReceiverState::FatalError(EndpointError::ConnectionClosed);
        };
        let worker = Worker {
            socket,
            session: self.session.clone(),
            errors: self.errors_tx.clone(),
            stop: self.stop.listener(),
        };

        let writer = worker
            .clone()
            .write_output(self.confirmed_rx.clone(), self.output.clone());
        let listener = worker.clone().listen(
            self.inbound_tx.clone(),
            self.config.read_timeout,
            self.config.buffer_size,
        );
        let confirmer = worker.confirm(self.inbound_rx.clone(), self.confirmed_tx.clone());

        self.tasks.push(tokio::spawn(writer));
        self.tasks.push(tokio::spawn(listener));
        self.tasks.push(tokio::spawn(confirmer));
        ReceiverState::Receiving
    }

    async fn stop_tasks(&mut self) {
        self.stop.stop();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                log::warn!("[receiver] task ended abnormally: {e}");
            }
        }
        while let Ok(stale) = self.errors_rx.try_recv() {
            log::debug!("[receiver] dropping error from stopped task: {stale}");
        }
    }

    /// Write out payloads confirmed before the writer stopped.
    async fn flush_confirmed(&mut self) {
        let mut confirmed = self.confirmed_rx.lock().await;
        let mut output = self.output.lock().await;
        while let Ok(payload) = confirmed.try_recv() {
            if let Err(e) = output.write_all(&payload).await {
                log::error!("Error: {}", EndpointError::Output(e));
                return;
            }
        }
        if let Err(e) = output.flush().await {
            log::error!("Error: {}", EndpointError::Output(e));
        }
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Worker {
    socket: Arc<Socket>,
    session: Arc<Session>,
    errors: mpsc::UnboundedSender<EndpointError>,
    stop: StopListener,
}

impl Worker {
    fn report(&self, err: EndpointError) {
        let _ = self.errors.send(err);
    }

    /// Read datagrams, remember who sent them and pass them on.
    async fn listen(
        mut self,
        inbound: mpsc::Sender<Vec<u8>>,
        read_timeout: Duration,
        buf_size: usize,
    ) {
        loop {
            let received = tokio::select! {
                _ = self.stop.stopped() => return,
                received = self.socket.recv_timeout(buf_size, read_timeout) => received,
            };
            match received {
                Ok(None) => continue,
                Ok(Some((bytes, from))) => {
                    self.session.counters.packet_received();
                    self.session.set_peer(from);
                    // A datagram taken off the socket must not be dropped.
                    tokio::select! {
                        biased;
                        sent = inbound.send(bytes) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = self.stop.stopped() => return,
                    }
                }
                Err(e) => {
                    self.report(EndpointError::from_socket(e));
                    return;
                }
            }
        }
    }

    /// Validate inbound packets, forward in-order payloads and ACK
    /// everything.
    async fn confirm(
        mut self,
        inbound: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
        confirmed: mpsc::Sender<Vec<u8>>,
    ) {
        let mut inbound = inbound.lock().await;
        loop {
            let bytes = tokio::select! {
                _ = self.stop.stopped() => return,
                bytes = inbound.recv() => match bytes {
                    Some(bytes) => bytes,
                    None => return,
                },
            };
            let packet = match Packet::decode(&bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    self.report(e.into());
                    continue;
                }
            };
            let header = packet.header;
            let tracker = &self.session.tracker;

            if tracker.admit(&header) {
                self.session.counters.packet_correct();
                if !packet.data.is_empty() {
                    tokio::select! {
                        biased;
                        sent = confirmed.send(packet.data.into_bytes()) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = self.stop.stopped() => return,
                    }
                }
                tracker.advance(header.data_len);
                if header.flags & flags::FIN != 0 {
                    log::info!("[receiver] peer finished sending at seq={}", header.seq_num);
                }
                log::debug!(
                    "[receiver] ← accepted seq={} len={}",
                    header.seq_num,
                    header.data_len
                );
            } else {
                log::debug!(
                    "[receiver] ← out of order seq={} (expected {})",
                    header.seq_num,
                    tracker.ack_number()
                );
            }

            let Some(peer) = self.session.peer() else {
                continue;
            };
            let ack = Packet::new(tracker.ack_number(), LOCAL_SEQ, flags::ACK, &[]);
            match self.socket.send_to(&ack, peer).await {
                Ok(()) => {
                    self.session.counters.packet_sent();
                    log::debug!("[receiver] → ACK ack={}", ack.header.ack_num);
                }
                Err(e) => self.report(EndpointError::from_socket(e)),
            }
        }
    }

    /// Drain confirmed payloads into the sink, in order.
    async fn write_output<W>(
        mut self,
        confirmed: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
        output: Arc<Mutex<W>>,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut confirmed = confirmed.lock().await;
        let mut output = output.lock().await;
        loop {
            let payload = tokio::select! {
                _ = self.stop.stopped() => return,
                payload = confirmed.recv() => match payload {
                    Some(payload) => payload,
                    None => return,
                },
            };
            let written = async {
                output.write_all(&payload).await?;
                output.flush().await
            };
            if let Err(e) = written.await {
                self.report(EndpointError::Output(e));
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u32, len: u32, flags: u8) -> Header {
        Header {
            seq_num: seq,
            ack_num: 0,
            data_len: len,
            flags,
        }
    }

    #[test]
    fn initial_state() {
        let t = AckTracker::new(100);
        assert_eq!(t.ack_number(), 100);
    }

    #[test]
    fn in_order_packet_accepted() {
        let t = AckTracker::new(0);
        assert!(t.on_packet(&header(0, 5, flags::DATA)));
        assert_eq!(t.ack_number(), 5);
    }

    #[test]
    fn out_of_order_packet_dropped() {
        let t = AckTracker::new(0);
        assert!(!t.on_packet(&header(5, 5, flags::DATA)));
        assert_eq!(t.ack_number(), 0);
    }

    #[test]
    fn duplicate_packet_dropped() {
        let t = AckTracker::new(0);
        assert!(t.on_packet(&header(0, 3, flags::DATA)));
        assert!(!t.on_packet(&header(0, 3, flags::DATA)));
        assert_eq!(t.ack_number(), 3);
    }

    #[test]
    fn syn_seeds_expected_ack() {
        let t = AckTracker::new(0);
        assert!(t.on_packet(&header(42, 0, flags::SYN)));
        assert_eq!(t.ack_number(), 42);
        assert!(t.on_packet(&header(42, 4, flags::DATA)));
        assert_eq!(t.ack_number(), 46);
    }

    #[test]
    fn admit_does_not_advance() {
        let t = AckTracker::new(7);
        assert!(t.admit(&header(7, 3, flags::DATA)));
        assert_eq!(t.ack_number(), 7);
        t.advance(3);
        assert_eq!(t.ack_number(), 10);
    }

    #[test]
    fn fin_in_order_is_accepted_without_advance() {
        let t = AckTracker::new(9);
        assert!(t.on_packet(&header(9, 0, flags::FIN)));
        assert_eq!(t.ack_number(), 9);
    }

    #[test]
    fn ack_wraps_around() {
        let t = AckTracker::new(u32::MAX - 1);
        assert!(t.on_packet(&header(u32::MAX - 1, 4, flags::DATA)));
        assert_eq!(t.ack_number(), 2);
    }

    #[tokio::test]
    async fn invalid_port_ends_in_fatal_error() {
        let config = ReceiverConfig {
            stats_file: None,
            handle_interrupt: false,
            ..ReceiverConfig::default()
        };
        let fsm = ReceiverFsm::new(
            vec!["127.0.0.1".into(), "99999".into()],
            config,
            tokio::io::sink(),
        );
        let result = fsm.run().await;
        assert!(matches!(
            result,
            Err(EndpointError::Config(crate::config::ConfigError::InvalidPort(_)))
        ));
    }
}
