//! Sending endpoint.
//!
//! [`SenderFsm`] drives the [`SenderState`] machine and owns the worker
//! tasks that move application bytes onto the wire:
//!
//! ```text
//!   input ──▶ reader ──(Outbound queue)──▶ transmitter ──▶ Socket ──▶ receiver
//!                                              ▲   │ resend request
//!                                  ACK wait    │   ▼
//!   Socket ──▶ listener ──(responses broadcast)┴─▶ retransmitter (one-shot)
//! ```
//!
//! # Stop-and-wait contract
//! - At most **one** DATA packet is in flight; the transmitter does not take
//!   the next packet off the queue until the current one is acknowledged.
//! - The ACK for a DATA packet carries `ackNum == seq + dataLen`.
//! - If that ACK does not arrive within the response window, the transmitter
//!   raises a resend request and the driver spawns a retransmitter, which
//!   resends the buffered packet up to `max_retries` times.
//! - Every task error lands on one channel; only the driver turns errors
//!   into state transitions.
//!
//! Session state (sequence counters, the last-packet buffer, the input and
//! the outbound queue) survives a recovery; only the tasks are recreated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{validate_args, SenderConfig};
use crate::error::EndpointError;
use crate::packet::{complete_utf8_prefix, flags, is_valid, Packet};
use crate::shutdown::{stop_on_interrupt, StopHandle, StopListener};
use crate::socket::Socket;
use crate::state::SenderState;

/// Responses buffered per subscriber before the slowest one starts lagging.
const RESPONSE_BACKLOG: usize = 64;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Entry on the queue between the input reader and the transmitter.
#[derive(Debug)]
enum Outbound {
    Packet(Packet),
    /// The input is exhausted; everything before this marker has been queued.
    EndOfInput,
}

/// The most recently transmitted packet, kept for the retransmitter.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LastPacket {
    /// Encoded datagram, resent verbatim.
    bytes: Vec<u8>,
    seq: u32,
    /// `ackNum` of the ACK that covers this packet.
    expected_ack: u32,
    /// Only DATA packets wait for an ACK.
    is_data: bool,
    acked: bool,
}

/// Per-connection state shared by every generation of worker tasks.
#[derive(Debug)]
struct Session {
    /// Bytes framed so far (sequence number of the next DATA packet).
    seq: AtomicU32,
    /// Bytes consumed from the peer.  The receiver sends no data, so this
    /// only ever carries the handshake value.
    ack: AtomicU32,
    last_packet: StdMutex<Option<LastPacket>>,
    responses: broadcast::Sender<Vec<u8>>,
    /// Set whenever a DATA packet is acknowledged; cleared by the driver when
    /// it counts a recovery.
    progress: AtomicBool,
}

impl Session {
    fn new() -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_BACKLOG);
        Self {
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            last_packet: StdMutex::new(None),
            responses,
            progress: AtomicBool::new(false),
        }
    }

    fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    fn ack(&self) -> u32 {
        self.ack.load(Ordering::Acquire)
    }

    /// Advance past `len` framed bytes.  Wraps at `u32::MAX`.
    fn advance_seq(&self, len: u32) {
        self.seq.fetch_add(len, Ordering::AcqRel);
    }

    fn remember(&self, packet: LastPacket) {
        *self.last_packet.lock().unwrap_or_else(PoisonError::into_inner) = Some(packet);
    }

    /// Copy of the last-packet buffer.
    fn last_packet(&self) -> Option<LastPacket> {
        self.last_packet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The buffered DATA packet, if it is still waiting for its ACK.
    fn unacked_data(&self) -> Option<LastPacket> {
        self.last_packet().filter(|p| p.is_data && !p.acked)
    }

    /// Mark the buffered packet acknowledged if `expected_ack` covers it.
    fn mark_acked(&self, expected_ack: u32) {
        let mut guard = self.last_packet.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = guard.as_mut() {
            if last.expected_ack == expected_ack && !last.acked {
                last.acked = true;
                if last.is_data {
                    self.progress.store(true, Ordering::Release);
                }
            }
        }
    }

    /// `true` if a DATA packet was acknowledged since the last call.
    fn take_progress(&self) -> bool {
        self.progress.swap(false, Ordering::AcqRel)
    }

    fn is_acked(&self, expected_ack: u32) -> bool {
        self.last_packet()
            .map_or(false, |p| p.expected_ack == expected_ack && p.acked)
    }
}

/// Application input plus the bytes read but not yet framed.
struct InputState<R> {
    source: R,
    /// Tail of a multi-byte character whose remaining bytes are still unread.
    pending: Vec<u8>,
    finished: bool,
}

/// `true` if `response` is the ACK covering `expected_ack`.
fn acknowledges(response: &[u8], expected_ack: u32) -> bool {
    Packet::decode(response)
        .map(|p| is_valid(&p.header, flags::ACK, expected_ack))
        .unwrap_or(false)
}

fn flag_name(bits: u8) -> &'static str {
    match bits {
        flags::SYN => "SYN",
        flags::DATA => "DATA",
        flags::FIN => "FIN",
        flags::ACK => "ACK",
        _ => "PKT",
    }
}

// ---------------------------------------------------------------------------
// SenderFsm
// ---------------------------------------------------------------------------

/// Driver for the sending endpoint.
///
/// Reads application bytes from `R` until end of input, delivering them in
/// order to the receiver at `<ip> <port>`.
pub struct SenderFsm<R> {
    args: Vec<String>,
    config: SenderConfig,
    socket: Option<Arc<Socket>>,
    session: Arc<Session>,
    input: Arc<Mutex<InputState<R>>>,

    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
    errors_tx: mpsc::UnboundedSender<EndpointError>,
    errors_rx: mpsc::UnboundedReceiver<EndpointError>,
    resend_tx: mpsc::UnboundedSender<()>,
    resend_rx: mpsc::UnboundedReceiver<()>,
    eof_tx: mpsc::UnboundedSender<()>,
    eof_rx: mpsc::UnboundedReceiver<()>,

    /// Stop signal of the current task generation.
    stop: StopHandle,
    /// Process-level shutdown (Ctrl-C).
    shutdown: StopHandle,
    tasks: Vec<JoinHandle<()>>,
    /// Recoveries since a DATA packet was last acknowledged.
    recoveries: u32,
}

impl<R> SenderFsm<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// `args` are the raw positional arguments, validated in
    /// [`SenderState::ValidateArgs`].
    pub fn new(args: Vec<String>, config: SenderConfig, input: R) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (resend_tx, resend_rx) = mpsc::unbounded_channel();
        let (eof_tx, eof_rx) = mpsc::unbounded_channel();
        Self {
            args,
            config,
            socket: None,
            session: Arc::new(Session::new()),
            input: Arc::new(Mutex::new(InputState {
                source: input,
                pending: Vec::new(),
                finished: false,
            })),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            errors_tx,
            errors_rx,
            resend_tx,
            resend_rx,
            eof_tx,
            eof_rx,
            stop: StopHandle::new(),
            shutdown: StopHandle::new(),
            tasks: Vec::new(),
            recoveries: 0,
        }
    }

    /// Handle that ends the run as if Ctrl-C had been pressed.
    pub fn shutdown_handle(&self) -> StopHandle {
        self.shutdown.clone()
    }

    /// Drive the state machine to [`SenderState::Termination`].
    ///
    /// Returns the error that caused a [`SenderState::FatalError`], if any.
    pub async fn run(mut self) -> Result<(), EndpointError> {
        if self.config.handle_interrupt {
            stop_on_interrupt(self.shutdown.clone());
        }

        let mut state = SenderState::default();
        let mut fatal = None;
        loop {
            log::debug!("[sender] state → {state}");
            state = match state {
                SenderState::ValidateArgs => self.validate_args(),
                SenderState::CreateSocket(remote) => self.create_socket(remote).await,
                SenderState::Handshake => self.handshake().await,
                SenderState::ReadyForTransmitting => self.ready_for_transmitting(),
                SenderState::Transmitting => self.transmitting().await,
                SenderState::ErrorHandling(err) => self.handle_error(err).await,
                SenderState::Recover => self.recover(),
                SenderState::FatalError(err) => {
                    log::error!("Fatal Error: {err}");
                    fatal = Some(err);
                    SenderState::Termination
                }
                SenderState::Termination => {
                    self.terminate().await;
                    return fatal.map_or(Ok(()), Err);
                }
            };
        }
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    fn validate_args(&mut self) -> SenderState {
        match validate_args(&self.args) {
            Ok(remote) => SenderState::CreateSocket(remote),
            Err(e) => SenderState::FatalError(e.into()),
        }
    }

    async fn create_socket(&mut self, remote: SocketAddr) -> SenderState {
        match Socket::connect(remote).await {
            Ok(socket) => {
                log::info!("[sender] connected to {remote} from {}", socket.local_addr);
                self.socket = Some(Arc::new(socket));
                SenderState::Handshake
            }
            Err(e) => SenderState::FatalError(e.into()),
        }
    }

    /// Send SYN until anything comes back.  The reply's content is not
    /// inspected, only its arrival.
    async fn handshake(&mut self) -> SenderState {
        let Some(worker) = self.worker() else {
            return SenderState::FatalError(EndpointError::ConnectionClosed);
        };
        let mut responses = self.session.responses.subscribe();
        self.spawn_listener(&worker);
        self.spawn_transmitter(&worker);

        let mut shutdown = self.shutdown.listener();
        loop {
            let syn = Packet::new(self.session.ack(), self.session.seq(), flags::SYN, &[]);
            tokio::select! {
                sent = self.outbound_tx.send(Outbound::Packet(syn)) => {
                    if sent.is_err() {
                        return SenderState::FatalError(EndpointError::ConnectionClosed);
                    }
                }
                Some(err) = self.errors_rx.recv() => return SenderState::FatalError(err),
                _ = shutdown.stopped() => return SenderState::Termination,
            }

            tokio::select! {
                Some(err) = self.errors_rx.recv() => return SenderState::FatalError(err),
                response = responses.recv() => match response {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        log::info!("[sender] handshake complete");
                        return SenderState::ReadyForTransmitting;
                    }
                    Err(RecvError::Closed) => {
                        return SenderState::FatalError(EndpointError::ConnectionClosed);
                    }
                },
                _ = shutdown.stopped() => return SenderState::Termination,
                _ = tokio::time::sleep(self.config.response_timeout) => {
                    log::debug!("[sender] no reply to SYN; retrying");
                }
            }
        }
    }

    fn ready_for_transmitting(&mut self) -> SenderState {
        let Some(worker) = self.worker() else {
            return SenderState::FatalError(EndpointError::ConnectionClosed);
        };
        self.spawn_reader(&worker);
        log::info!("Ready for Transmitting");
        match self.errors_rx.try_recv() {
            Ok(err) => SenderState::FatalError(err),
            Err(_) => SenderState::Transmitting,
        }
    }

    async fn transmitting(&mut self) -> SenderState {
        let mut shutdown = self.shutdown.listener();
        loop {
            tokio::select! {
                Some(()) = self.eof_rx.recv() => {
                    log::info!("[sender] all input delivered");
                    return SenderState::Termination;
                }
                Some(()) = self.resend_rx.recv() => self.spawn_retransmitter(),
                Some(err) = self.errors_rx.recv() => return SenderState::ErrorHandling(err),
                _ = shutdown.stopped() => return SenderState::Termination,
            }
        }
    }

    async fn handle_error(&mut self, err: EndpointError) -> SenderState {
        log::error!("Error: {err}");
        self.stop_tasks().await;
        // Only recoveries with no delivery in between count toward the limit.
        if self.session.take_progress() {
            self.recoveries = 0;
        }
        self.recoveries += 1;
        if self.recoveries > self.config.max_recoveries {
            return SenderState::FatalError(EndpointError::TooManyRecoveries(
                self.config.max_recoveries,
            ));
        }
        SenderState::Recover
    }

    fn recover(&mut self) -> SenderState {
        self.stop = StopHandle::new();
        let Some(worker) = self.worker() else {
            return SenderState::FatalError(EndpointError::ConnectionClosed);
        };
        self.spawn_reader(&worker);
        self.spawn_listener(&worker);
        self.spawn_transmitter(&worker);
        log::info!(
            "[sender] recovered ({}/{}), resuming at seq={}",
            self.recoveries,
            self.config.max_recoveries,
            self.session.seq()
        );
        SenderState::Transmitting
    }

    async fn terminate(&mut self) {
        log::info!("Termination");
        self.stop_tasks().await;
        if let Some(socket) = self.socket.take() {
            log::debug!("[sender] closing socket {}", socket.local_addr);
        }
        log::info!("Client Exiting...");
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    fn worker(&self) -> Option<Worker> {
        Some(Worker {
            socket: self.socket.clone()?,
            session: self.session.clone(),
            errors: self.errors_tx.clone(),
            stop: self.stop.listener(),
        })
    }

    fn spawn_reader(&mut self, worker: &Worker) {
        let task = worker.clone().read_input(
            self.input.clone(),
            self.outbound_tx.clone(),
            self.config.framed_chunk_size(),
        );
        self.tasks.push(tokio::spawn(task));
    }

    fn spawn_transmitter(&mut self, worker: &Worker) {
        let task = worker.clone().transmit_packets(
            self.outbound_rx.clone(),
            self.resend_tx.clone(),
            self.eof_tx.clone(),
            self.config.response_timeout,
        );
        self.tasks.push(tokio::spawn(task));
    }

    fn spawn_listener(&mut self, worker: &Worker) {
        let task = worker
            .clone()
            .listen_responses(self.config.response_timeout, self.config.buffer_size);
        self.tasks.push(tokio::spawn(task));
    }

    fn spawn_retransmitter(&mut self) {
        let Some(worker) = self.worker() else { return };
        self.tasks.retain(|t| !t.is_finished());
        let task = worker.retransmit_last(self.config.max_retries, self.config.response_timeout);
        self.tasks.push(tokio::spawn(task));
    }

    /// Close the stop signal, join every task, and drop what they left
    /// behind on the control channels.
    async fn stop_tasks(&mut self) {
        self.stop.stop();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                log::warn!("[sender] task ended abnormally: {e}");
            }
        }
        while let Ok(stale) = self.errors_rx.try_recv() {
            log::debug!("[sender] dropping error from stopped task: {stale}");
        }
        while self.resend_rx.try_recv().is_ok() {}
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

/// Everything a worker task needs: the transport, the session, the error
/// channel and the stop signal of its generation.
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

    /// Frame input chunks as DATA packets and queue them for transmission.
    async fn read_input<R>(
        mut self,
        input: Arc<Mutex<InputState<R>>>,
        outbound: mpsc::Sender<Outbound>,
        chunk_size: usize,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut input = input.lock().await;
        if input.finished {
            return;
        }
        let mut buf = vec![0u8; chunk_size];
        loop {
            let read = tokio::select! {
                _ = self.stop.stopped() => return,
                read = input.source.read(&mut buf) => read,
            };
            let eof = match read {
                Ok(0) => true,
                Ok(n) => {
                    input.pending.extend_from_slice(&buf[..n]);
                    false
                }
                Err(e) => {
                    self.report(EndpointError::Input(e));
                    return;
                }
            };

            let cut = if eof {
                input.pending.len()
            } else {
                complete_utf8_prefix(&input.pending)
            };
            if cut > 0 {
                let packet = Packet::new(
                    self.session.ack(),
                    self.session.seq(),
                    flags::DATA,
                    &input.pending[..cut],
                );
                let len = packet.header.data_len;
                tokio::select! {
                    _ = self.stop.stopped() => return,
                    sent = outbound.send(Outbound::Packet(packet)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                // Only consume the bytes once the packet is queued.
                input.pending.drain(..cut);
                self.session.advance_seq(len);
            }

            if eof {
                tokio::select! {
                    _ = self.stop.stopped() => return,
                    sent = outbound.send(Outbound::EndOfInput) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                input.finished = true;
                log::info!("[sender] end of input at seq={}", self.session.seq());
                return;
            }
        }
    }

    /// Write queued packets to the transport, one DATA packet in flight at a
    /// time.
    async fn transmit_packets(
        mut self,
        outbound: Arc<Mutex<mpsc::Receiver<Outbound>>>,
        resend: mpsc::UnboundedSender<()>,
        eof: mpsc::UnboundedSender<()>,
        ack_wait: Duration,
    ) {
        let mut responses = self.session.responses.subscribe();
        let mut outbound = outbound.lock().await;

        if let Some(pending) = self.session.unacked_data() {
            log::info!("[sender] replaying unacknowledged packet seq={}", pending.seq);
            if let Err(e) = self.socket.send(&pending.bytes).await {
                self.report(EndpointError::from_socket(e));
                return;
            }
            if !self
                .await_ack(&mut responses, pending.expected_ack, &resend, ack_wait)
                .await
            {
                return;
            }
        }

        loop {
            let next = tokio::select! {
                _ = self.stop.stopped() => return,
                next = outbound.recv() => next,
            };
            let packet = match next {
                None => return,
                Some(Outbound::EndOfInput) => {
                    self.send_fin().await;
                    let _ = eof.send(());
                    return;
                }
                Some(Outbound::Packet(packet)) => packet,
            };

            let bytes = match packet.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.report(e.into());
                    return;
                }
            };
            let header = &packet.header;
            let is_data = header.flags == flags::DATA;
            let expected_ack = packet.next_seq();
            self.session.remember(LastPacket {
                bytes: bytes.clone(),
                seq: header.seq_num,
                expected_ack,
                is_data,
                acked: !is_data,
            });

            if let Err(e) = self.socket.send(&bytes).await {
                self.report(EndpointError::from_socket(e));
                return;
            }
            log::debug!(
                "[sender] → {} seq={} len={}",
                flag_name(header.flags),
                header.seq_num,
                header.data_len
            );

            if is_data
                && !self
                    .await_ack(&mut responses, expected_ack, &resend, ack_wait)
                    .await
            {
                return;
            }
        }
    }

    /// Wait for the ACK covering `expected_ack`.
    ///
    /// Raises one resend request once `window` passes without it, then keeps
    /// waiting; the retransmitter's outcome arrives as either that ACK or an
    /// error to the driver.  Returns `false` when the task must exit.
    async fn await_ack(
        &mut self,
        responses: &mut broadcast::Receiver<Vec<u8>>,
        expected_ack: u32,
        resend: &mpsc::UnboundedSender<()>,
        window: Duration,
    ) -> bool {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let mut resend_requested = false;
        loop {
            tokio::select! {
                _ = self.stop.stopped() => return false,
                response = responses.recv() => match response {
                    Ok(bytes) => {
                        if acknowledges(&bytes, expected_ack) {
                            self.session.mark_acked(expected_ack);
                            log::debug!("[sender] ← ACK ack={expected_ack}");
                            return true;
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::debug!("[sender] skipped {n} responses"),
                    Err(RecvError::Closed) => return false,
                },
                _ = &mut deadline, if !resend_requested => {
                    resend_requested = true;
                    log::debug!("[sender] no ACK for {expected_ack} within {window:?}");
                    let _ = resend.send(());
                }
            }
        }
    }

    /// Best-effort end-of-stream notice.
    async fn send_fin(&self) {
        let fin = Packet::new(self.session.ack(), self.session.seq(), flags::FIN, &[]);
        let sent = match fin.encode() {
            Ok(bytes) => self.socket.send(&bytes).await.map_err(EndpointError::from_socket),
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => log::debug!("[sender] → FIN seq={}", fin.header.seq_num),
            Err(e) => log::debug!("[sender] FIN not sent: {e}"),
        }
    }

    /// Read responses with a bounded wait and fan them out to whoever is
    /// waiting for one.
    async fn listen_responses(mut self, read_timeout: Duration, buf_size: usize) {
        loop {
            let received = tokio::select! {
                _ = self.stop.stopped() => return,
                received = self.socket.recv_timeout(buf_size, read_timeout) => received,
            };
            match received {
                Ok(None) => continue,
                Ok(Some((bytes, _))) => {
                    // Nobody waiting is fine; the response is informational.
                    let _ = self.session.responses.send(bytes);
                }
                Err(e) => {
                    let err = EndpointError::from_socket(e);
                    match err {
                        EndpointError::ConnectionClosed => log::info!("connection closed"),
                        EndpointError::ConnectionRefused => log::info!("connection refused"),
                        _ => {}
                    }
                    self.report(err);
                    return;
                }
            }
        }
    }

    /// Resend the buffered packet until its ACK arrives or `max_retries`
    /// attempts have gone unanswered.
    async fn retransmit_last(mut self, max_retries: u32, window: Duration) {
        let Some(last) = self.session.last_packet() else {
            return;
        };
        if last.acked {
            return;
        }
        let mut responses = self.session.responses.subscribe();

        for attempt in 1..=max_retries {
            if self.stop.is_stopped() || self.session.is_acked(last.expected_ack) {
                return;
            }
            if let Err(e) = self.socket.send(&last.bytes).await {
                self.report(EndpointError::from_socket(e));
                return;
            }
            log::debug!(
                "[sender] ↻ resend seq={} attempt {attempt}/{max_retries}",
                last.seq
            );

            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = self.stop.stopped() => return,
                    response = responses.recv() => match response {
                        Ok(bytes) if acknowledges(&bytes, last.expected_ack) => {
                            self.session.mark_acked(last.expected_ack);
                            return;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    },
                    _ = &mut deadline => break,
                }
            }
        }

        if !self.stop.is_stopped() {
            self.report(EndpointError::MaxRetriesExceeded {
                seq: last.seq,
                attempts: max_retries,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(60);

    struct Harness {
        worker: Worker,
        errors: mpsc::UnboundedReceiver<EndpointError>,
        stop: StopHandle,
        peer: Socket,
    }

    /// A worker connected to a loopback `peer` that never answers on its own.
    async fn harness() -> Harness {
        let peer = Socket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        let socket = Socket::connect(peer.local_addr).await.unwrap();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let stop = StopHandle::new();
        Harness {
            worker: Worker {
                socket: Arc::new(socket),
                session: Arc::new(Session::new()),
                errors: errors_tx,
                stop: stop.listener(),
            },
            errors,
            stop,
            peer,
        }
    }

    fn data_packet(seq: u32, payload: &[u8]) -> LastPacket {
        let packet = Packet::new(0, seq, flags::DATA, payload);
        LastPacket {
            bytes: packet.encode().unwrap(),
            seq,
            expected_ack: packet.next_seq(),
            is_data: true,
            acked: false,
        }
    }

    /// Drain datagrams until the peer has been quiet for a while.
    async fn collect(peer: &Socket) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut got = Vec::new();
        while let Some(d) = peer
            .recv_timeout(64 * 1024, Duration::from_millis(200))
            .await
            .unwrap()
        {
            got.push(d);
        }
        got
    }

    #[test]
    fn session_tracks_ack_of_last_packet() {
        let session = Session::new();
        session.remember(data_packet(10, b"hello"));
        assert!(session.unacked_data().is_some());

        session.mark_acked(14); // wrong ack, ignored
        assert!(!session.is_acked(15));

        session.mark_acked(15);
        assert!(session.is_acked(15));
        assert!(session.unacked_data().is_none());
    }

    #[test]
    fn only_data_acks_count_as_progress() {
        let session = Session::new();
        let syn = Packet::new(0, 0, flags::SYN, b"");
        session.remember(LastPacket {
            bytes: syn.encode().unwrap(),
            seq: 0,
            expected_ack: 0,
            is_data: false,
            acked: false,
        });
        session.mark_acked(0);
        assert!(!session.take_progress());

        session.remember(data_packet(0, b"abc"));
        session.mark_acked(3);
        assert!(session.take_progress());
        assert!(!session.take_progress(), "flag is consumed");

        session.mark_acked(3); // repeated ACK, no new progress
        assert!(!session.take_progress());
    }

    #[tokio::test]
    async fn recovery_limit_counts_only_recoveries_without_progress() {
        let config = SenderConfig {
            max_recoveries: 1,
            handle_interrupt: false,
            ..SenderConfig::default()
        };
        let mut fsm = SenderFsm::new(Vec::new(), config, tokio::io::empty());

        let next = fsm.handle_error(EndpointError::ConnectionClosed).await;
        assert!(matches!(next, SenderState::Recover));

        // Delivery resumed between the two failures.
        fsm.session.remember(data_packet(0, b"abc"));
        fsm.session.mark_acked(3);
        let next = fsm.handle_error(EndpointError::ConnectionClosed).await;
        assert!(matches!(next, SenderState::Recover));

        let next = fsm.handle_error(EndpointError::ConnectionClosed).await;
        assert!(matches!(
            next,
            SenderState::FatalError(EndpointError::TooManyRecoveries(1))
        ));
    }

    #[test]
    fn seq_advance_wraps() {
        let session = Session::new();
        session.seq.store(u32::MAX - 1, Ordering::Release);
        session.advance_seq(4);
        assert_eq!(session.seq(), 2);
    }

    #[test]
    fn acknowledges_needs_ack_flag_and_exact_number() {
        let ack = Packet::new(5, 0, flags::ACK, b"").encode().unwrap();
        assert!(acknowledges(&ack, 5));
        assert!(!acknowledges(&ack, 6));
        let data = Packet::new(5, 0, flags::DATA, b"").encode().unwrap();
        assert!(!acknowledges(&data, 5));
        assert!(!acknowledges(b"garbage", 5));
    }

    #[tokio::test]
    async fn retransmitter_gives_up_after_max_retries() {
        let mut h = harness().await;
        let last = data_packet(0, b"lost");
        h.worker.session.remember(last.clone());

        tokio::spawn(h.worker.clone().retransmit_last(3, WINDOW));
        let err = tokio::time::timeout(Duration::from_secs(5), h.errors.recv())
            .await
            .expect("retransmitter should report")
            .expect("error channel open");
        assert!(matches!(
            err,
            EndpointError::MaxRetriesExceeded { seq: 0, attempts: 3 }
        ));

        let sent = collect(&h.peer).await;
        assert_eq!(sent.len(), 3, "exactly max_retries resends");
        assert!(sent.iter().all(|(bytes, _)| *bytes == last.bytes));
    }

    #[tokio::test]
    async fn retransmitter_stops_at_matching_ack() {
        let mut h = harness().await;
        let last = data_packet(0, b"late");
        h.worker.session.remember(last.clone());
        tokio::spawn(h.worker.clone().listen_responses(WINDOW, 64 * 1024));
        tokio::spawn(h.worker.clone().retransmit_last(5, Duration::from_millis(300)));

        // Ignore the first resend, acknowledge the second.
        let mut resends = 0;
        while resends < 2 {
            let (_, from) = h
                .peer
                .recv_timeout(64 * 1024, Duration::from_secs(2))
                .await
                .unwrap()
                .expect("resend");
            resends += 1;
            if resends == 2 {
                let ack = Packet::new(last.expected_ack, 0, flags::ACK, b"");
                h.peer.send_to(&ack, from).await.unwrap();
            }
        }

        assert!(collect(&h.peer).await.is_empty(), "no resend after the ACK");
        assert!(h.worker.session.is_acked(last.expected_ack));
        assert!(h.errors.try_recv().is_err());
        h.stop.stop();
    }

    #[tokio::test]
    async fn retransmitter_aborts_silently_on_stop() {
        let mut h = harness().await;
        h.worker.session.remember(data_packet(0, b"x"));
        let task = tokio::spawn(h.worker.clone().retransmit_last(10, Duration::from_secs(5)));

        h.peer
            .recv_timeout(1024, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("first resend");
        h.stop.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task exits promptly")
            .unwrap();
        assert!(h.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn transmitter_replays_unacked_packet_first() {
        let h = harness().await;
        let last = data_packet(7, b"again");
        h.worker.session.remember(last.clone());

        let (_tx, rx) = mpsc::channel(2);
        let (resend_tx, _resend_rx) = mpsc::unbounded_channel();
        let (eof_tx, _eof_rx) = mpsc::unbounded_channel();
        tokio::spawn(h.worker.clone().transmit_packets(
            Arc::new(Mutex::new(rx)),
            resend_tx,
            eof_tx,
            Duration::from_secs(5),
        ));

        let (bytes, _) = h
            .peer
            .recv_timeout(64 * 1024, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("replayed packet");
        assert_eq!(bytes, last.bytes);
        h.stop.stop();
    }

    #[tokio::test]
    async fn transmitter_requests_resend_when_ack_is_late() {
        let h = harness().await;
        let (tx, rx) = mpsc::channel(2);
        let (resend_tx, mut resend_rx) = mpsc::unbounded_channel();
        let (eof_tx, _eof_rx) = mpsc::unbounded_channel();
        tokio::spawn(h.worker.clone().transmit_packets(
            Arc::new(Mutex::new(rx)),
            resend_tx,
            eof_tx,
            WINDOW,
        ));

        tx.send(Outbound::Packet(Packet::new(0, 0, flags::DATA, b"hi")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), resend_rx.recv())
            .await
            .expect("resend request")
            .expect("channel open");
        let last = h.worker.session.unacked_data().expect("buffered");
        assert_eq!(last.expected_ack, 2);
        h.stop.stop();
    }

    #[tokio::test]
    async fn reader_frames_chunks_and_marks_end_of_input() {
        let h = harness().await;
        let input = Arc::new(Mutex::new(InputState {
            source: "héllo".as_bytes(),
            pending: Vec::new(),
            finished: false,
        }));
        let (tx, mut rx) = mpsc::channel(16);
        // A 2-byte chunk splits 'é'; the reader must hold it back.
        h.worker.clone().read_input(input.clone(), tx, 2).await;

        let mut text = String::new();
        let mut expected_seq = 0;
        loop {
            match rx.recv().await.expect("marker before close") {
                Outbound::Packet(p) => {
                    assert_eq!(p.header.flags, flags::DATA);
                    assert_eq!(p.header.seq_num, expected_seq);
                    expected_seq = p.next_seq();
                    text.push_str(&p.data);
                }
                Outbound::EndOfInput => break,
            }
        }
        assert_eq!(text, "héllo");
        assert_eq!(h.worker.session.seq(), 6);
        assert!(input.lock().await.finished);
    }

    #[tokio::test]
    async fn invalid_arguments_end_in_fatal_error() {
        let config = SenderConfig {
            handle_interrupt: false,
            ..SenderConfig::default()
        };
        let fsm = SenderFsm::new(
            vec!["not-an-ip".into(), "8080".into()],
            config,
            tokio::io::empty(),
        );
        let result = fsm.run().await;
        assert!(matches!(
            result,
            Err(EndpointError::Config(crate::config::ConfigError::InvalidIp(_)))
        ));
    }
}
