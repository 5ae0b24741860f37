//! Per-RPC call state machine.
//!
//! A call coordinates one send half and one receive half over a single
//! transport stream. Both halves run on one spawned task as two
//! concurrently polled drivers, so a back-pressured write or a pending
//! transform on one side never stops the other side from making progress.
//! Surfaces talk to the drivers through command channels and observe the
//! call through a tagged event channel. Exactly one terminal status is
//! emitted, strictly after the `End` event, and both axes freeze once it
//! is out.

use crate::filter::{Filter, FilterStack};
use crate::metadata::Metadata;
use crate::status::{Code, Status};
use crate::transport::{Connect, TransportEvent, TransportRecv, TransportSend};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Outstanding unconsumed messages that trigger a transport read pause.
pub const READ_HIGH_WATER: usize = 16;
/// Consumption level at which a paused transport read resumes.
pub const READ_LOW_WATER: usize = 8;

/// Write flag bit: hint that this message should not be compressed.
pub const WRITE_NO_COMPRESS: u32 = 1;

/// A serialized message on its way to the transport: payload plus a 32-bit
/// flag word (bit 0 is the no-compression hint).
#[derive(Debug, Clone)]
pub struct WriteObject {
    pub payload: Bytes,
    pub flags: u32,
}

impl WriteObject {
    pub fn new(payload: Bytes) -> Self {
        Self { payload, flags: 0 }
    }

    pub fn with_flags(payload: Bytes, flags: u32) -> Self {
        Self { payload, flags }
    }
}

/// Absolute instant after which a call self-cancels, or no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    At(Instant),
    #[default]
    Infinite,
}

impl Deadline {
    /// A deadline the given duration from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline::At(Instant::now() + timeout)
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Deadline::Infinite)
    }

    pub fn expired(&self) -> bool {
        matches!(self, Deadline::At(at) if *at <= Instant::now())
    }

    /// Time left before expiry, or `None` for an infinite deadline.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
            Deadline::Infinite => None,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

/// Per-call credentials: metadata merged into the request headers before
/// the send filters run. A failure terminates the call with its status.
#[async_trait]
pub trait CallCredentials: Send + Sync {
    async fn metadata(&self, method: &str) -> Result<Metadata, Status>;
}

/// Everything the channel needs to start a call.
#[derive(Clone, Default)]
pub struct CallConfig {
    /// Method path, e.g. `/package.Service/Method`.
    pub method: String,
    pub deadline: Deadline,
    /// Authority override for this call.
    pub host: Option<String>,
    /// Parent call: its deadline is inherited when none is set here, and
    /// its cancellation cancels this call.
    pub parent: Option<CallHandle>,
    /// Opaque propagation flags, round-tripped to the channel untouched.
    pub propagate_flags: u32,
    pub credentials: Option<Arc<dyn CallCredentials>>,
}

/// Output of a call, in emission order: at most one `Metadata`, any number
/// of `Message`, exactly one `End`, exactly one `Status` (always last).
#[derive(Debug)]
pub enum CallEvent {
    Metadata(Metadata),
    Message(Bytes),
    End,
    Status(Status),
}

/// Send-direction operations, processed in FIFO order.
pub(crate) enum SendOp {
    SendMetadata(Metadata),
    Write {
        message: WriteObject,
        ack: oneshot::Sender<Result<(), Status>>,
    },
    End,
}

/// Receive-direction control, applied even while a write is in flight.
pub(crate) enum ReadControl {
    Pause,
    Resume,
    Consumed,
}

/// How the call ended: the status to report, and whether the transport
/// stream needs a reset (false only for clean trailer completion).
#[derive(Debug, Clone)]
struct Terminal {
    status: Status,
    reset: bool,
}

/// First terminal outcome wins; later ones are dropped.
struct CancelCell {
    tx: watch::Sender<Option<Terminal>>,
}

impl CancelCell {
    fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// External cancellation: reset the stream and report `status`.
    fn cancel(&self, status: Status) {
        let _ = self.finish(Terminal { status, reset: true });
    }

    /// Record the terminal outcome if none is set yet; returns the winner.
    fn finish(&self, term: Terminal) -> Terminal {
        let mut winner = term.clone();
        self.tx.send_if_modified(|slot| match slot {
            Some(existing) => {
                winner = existing.clone();
                false
            }
            None => {
                *slot = Some(term);
                true
            }
        });
        winner
    }

    fn subscribe(&self) -> watch::Receiver<Option<Terminal>> {
        self.tx.subscribe()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Resolves once the call has a terminal outcome. Pends forever otherwise.
async fn wait_terminal(rx: &mut watch::Receiver<Option<Terminal>>) -> Terminal {
    loop {
        if let Some(term) = rx.borrow_and_update().clone() {
            return term;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Shared handle to a running call. Clones address the same call.
#[derive(Clone)]
pub struct CallHandle {
    send_tx: mpsc::UnboundedSender<SendOp>,
    read_tx: mpsc::UnboundedSender<ReadControl>,
    cancel: Arc<CancelCell>,
    method: Arc<str>,
    deadline: Deadline,
    peer: Arc<Mutex<String>>,
}

impl CallHandle {
    /// Cancel with `CANCELLED`, "Cancelled on client". Idempotent.
    pub fn cancel(&self) {
        self.cancel_with_status(Code::Cancelled, "Cancelled on client");
    }

    /// Cancel with an explicit status. Idempotent; the first cancellation
    /// wins every race, including against in-flight filter transforms.
    pub fn cancel_with_status(&self, code: Code, details: impl Into<String>) {
        self.cancel.cancel(Status::new(code, details));
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Endpoint identifier of the transport stream, or the empty string
    /// before the stream is open.
    pub fn peer(&self) -> String {
        self.peer.lock().unwrap().clone()
    }

    /// Queue the request metadata. Valid exactly once, before any write;
    /// a duplicate is dropped with a warning.
    pub fn send_metadata(&self, metadata: Metadata) {
        let _ = self.send_tx.send(SendOp::SendMetadata(metadata));
    }

    /// Queue one message write. The returned ack resolves when the
    /// transport has accepted the frame, or with the failure that stopped
    /// the write. Writes are processed in FIFO order.
    pub fn write(&self, message: WriteObject) -> oneshot::Receiver<Result<(), Status>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.send_tx.send(SendOp::Write { message, ack: ack_tx });
        ack_rx
    }

    /// Half-close the send side after all queued writes have flushed.
    pub fn end(&self) {
        let _ = self.send_tx.send(SendOp::End);
    }

    /// Stop the transport from producing inbound events until resumed.
    pub fn pause(&self) {
        let _ = self.read_tx.send(ReadControl::Pause);
    }

    pub fn resume(&self) {
        let _ = self.read_tx.send(ReadControl::Resume);
    }

    pub(crate) fn consumed(&self) {
        let _ = self.read_tx.send(ReadControl::Consumed);
    }

    pub(crate) fn subscribe_cancellation(&self) -> watch::Receiver<Option<Terminal>> {
        self.cancel.subscribe()
    }
}

/// A spawned call: the shared handle plus the event side surfaces consume.
pub struct ActiveCall {
    pub handle: CallHandle,
    pub(crate) events: mpsc::UnboundedReceiver<CallEvent>,
}

impl std::fmt::Debug for ActiveCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCall").finish_non_exhaustive()
    }
}

impl ActiveCall {
    /// Start a call task. The transport stream is opened lazily on the
    /// task; an expired deadline terminates before any wire interaction.
    pub fn spawn(config: CallConfig, connector: Arc<dyn Connect>, filters: FilterStack) -> ActiveCall {
        let deadline = match (config.deadline, &config.parent) {
            (Deadline::Infinite, Some(parent)) => parent.deadline(),
            (deadline, _) => deadline,
        };

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancelCell::new();
        let peer = Arc::new(Mutex::new(String::new()));

        let handle = CallHandle {
            send_tx,
            read_tx,
            cancel: cancel.clone(),
            method: Arc::from(config.method.as_str()),
            deadline,
            peer: peer.clone(),
        };

        if let Deadline::At(at) = deadline {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.closed() => {}
                    _ = tokio::time::sleep_until(at) => {
                        cancel.cancel(Status::deadline_exceeded("Deadline exceeded"));
                    }
                }
            });
        }

        if let Some(parent) = &config.parent {
            let cancel = cancel.clone();
            let mut parent_rx = parent.subscribe_cancellation();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.closed() => {}
                    _ = wait_terminal(&mut parent_rx) => {
                        cancel.cancel(Status::cancelled("Parent call cancelled"));
                    }
                }
            });
        }

        tokio::spawn(run_call(
            config, deadline, connector, filters, send_rx, read_rx, events_tx, cancel, peer,
        ));

        ActiveCall {
            handle,
            events: events_rx,
        }
    }

    /// Next call event, or `None` once the terminal status has been
    /// delivered and the task is gone.
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    pub(crate) fn into_parts(self) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        (self.handle, self.events)
    }
}

/// Either the awaited operation finished, or a terminal outcome won the
/// race and the operation's eventual result is discarded.
enum Raced<T> {
    Done(T),
    Terminal(Terminal),
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    config: CallConfig,
    deadline: Deadline,
    connector: Arc<dyn Connect>,
    filters: FilterStack,
    mut send_rx: mpsc::UnboundedReceiver<SendOp>,
    read_rx: mpsc::UnboundedReceiver<ReadControl>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    cancel: Arc<CancelCell>,
    peer: Arc<Mutex<String>>,
) {
    if deadline.expired() {
        finish_without_transport(
            &events_tx,
            &mut send_rx,
            Status::deadline_exceeded("Deadline exceeded"),
        );
        return;
    }

    let mut cancel_rx = cancel.subscribe();
    let stream = {
        let open = connector.connect(&config.method, config.host.as_deref());
        tokio::select! {
            biased;
            term = wait_terminal(&mut cancel_rx) => {
                finish_without_transport(&events_tx, &mut send_rx, term.status);
                return;
            }
            result = open => match result {
                Ok(stream) => stream,
                Err(e) => {
                    finish_without_transport(&events_tx, &mut send_rx, Status::unavailable(e.to_string()));
                    return;
                }
            }
        }
    };
    *peer.lock().unwrap() = stream.send.peer();

    let method: Arc<str> = Arc::from(config.method.as_str());
    let filters = Arc::new(filters);

    let send_driver = SendDriver {
        method: method.clone(),
        credentials: config.credentials,
        filters: filters.clone(),
        transport: stream.send,
        send_rx,
        cancel: cancel.clone(),
        cancel_rx: cancel.subscribe(),
        send_state: SendState::Init,
    };
    let recv_driver = RecvDriver {
        method: method.clone(),
        filters,
        transport: stream.recv,
        read_rx,
        events_tx: events_tx.clone(),
        cancel: cancel.clone(),
        cancel_rx: cancel.subscribe(),
        recv_state: RecvState::Init,
        outstanding: 0,
        paused_by_user: false,
        paused_by_flow: false,
    };

    // Both directions progress on this one task; neither can starve the
    // other across a suspension point.
    let ((), status) = tokio::join!(send_driver.run(), recv_driver.drive());

    let _ = events_tx.send(CallEvent::End);
    tracing::debug!(method = %method, code = %status.code(), "call finished");
    let _ = events_tx.send(CallEvent::Status(status));
}

/// Terminal path for calls that never opened a transport stream.
fn finish_without_transport(
    events_tx: &mpsc::UnboundedSender<CallEvent>,
    send_rx: &mut mpsc::UnboundedReceiver<SendOp>,
    status: Status,
) {
    let _ = events_tx.send(CallEvent::End);
    let _ = events_tx.send(CallEvent::Status(status.clone()));
    send_rx.close();
    while let Ok(op) = send_rx.try_recv() {
        if let SendOp::Write { ack, .. } = op {
            let _ = ack.send(Err(status.clone()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Init,
    MetadataSent,
    Writing,
    HalfClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Init,
    MetadataReceived,
    Reading,
    TrailersReceived,
}

/// Drives the send axis: metadata, FIFO writes, half-close.
struct SendDriver {
    method: Arc<str>,
    credentials: Option<Arc<dyn CallCredentials>>,
    filters: Arc<FilterStack>,
    transport: Box<dyn TransportSend>,
    send_rx: mpsc::UnboundedReceiver<SendOp>,
    cancel: Arc<CancelCell>,
    cancel_rx: watch::Receiver<Option<Terminal>>,
    send_state: SendState,
}

impl SendDriver {
    async fn run(mut self) {
        let terminal = loop {
            let op = tokio::select! {
                biased;
                term = wait_terminal(&mut self.cancel_rx) => break term,
                op = self.send_rx.recv() => op,
            };
            match op {
                // All handles dropped: nobody can observe the call anymore.
                None => self.cancel.cancel(Status::cancelled("Cancelled on client")),
                Some(op) => {
                    if let Some(term) = self.handle_op(op).await {
                        break term;
                    }
                }
            }
        };
        if terminal.reset {
            self.transport.reset(terminal.status.code());
        }
        self.fail_pending_writes(&terminal.status);
    }

    /// Process one send operation; returns the terminal outcome if this
    /// direction is done.
    async fn handle_op(&mut self, op: SendOp) -> Option<Terminal> {
        match op {
            SendOp::SendMetadata(metadata) => self.handle_send_metadata(metadata).await,
            SendOp::Write { message, ack } => self.handle_write(message, ack).await,
            SendOp::End => self.handle_end().await,
        }
    }

    async fn handle_send_metadata(&mut self, mut metadata: Metadata) -> Option<Terminal> {
        if self.send_state != SendState::Init {
            tracing::warn!(method = %self.method, "metadata already sent, dropping duplicate");
            return None;
        }

        if let Some(credentials) = self.credentials.clone() {
            let raced = tokio::select! {
                biased;
                term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
                result = credentials.metadata(&self.method) => Raced::Done(result),
            };
            match raced {
                Raced::Terminal(term) => return Some(term),
                Raced::Done(Ok(extra)) => metadata.merge(extra),
                Raced::Done(Err(status)) => return Some(self.fail(status)),
            }
        }

        let raced = tokio::select! {
            biased;
            term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
            result = self.filters.send_metadata(metadata) => Raced::Done(result),
        };
        let metadata = match raced {
            Raced::Terminal(term) => return Some(term),
            Raced::Done(Ok(metadata)) => metadata,
            Raced::Done(Err(e)) => return Some(self.fail(Status::internal(e.details().to_string()))),
        };

        let raced = tokio::select! {
            biased;
            term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
            result = self.transport.send_headers(metadata) => Raced::Done(result),
        };
        match raced {
            Raced::Terminal(term) => Some(term),
            Raced::Done(Ok(())) => {
                tracing::debug!(method = %self.method, "request headers sent");
                self.send_state = SendState::MetadataSent;
                None
            }
            Raced::Done(Err(e)) => Some(self.fail(Status::unavailable(e.to_string()))),
        }
    }

    async fn handle_write(
        &mut self,
        message: WriteObject,
        ack: oneshot::Sender<Result<(), Status>>,
    ) -> Option<Terminal> {
        match self.send_state {
            SendState::Init => {
                let _ = ack.send(Err(Status::new(Code::FailedPrecondition, "metadata not sent")));
                return None;
            }
            SendState::HalfClosed => {
                let _ = ack.send(Err(Status::new(Code::FailedPrecondition, "stream is half-closed")));
                return None;
            }
            SendState::MetadataSent | SendState::Writing => {}
        }

        let raced = tokio::select! {
            biased;
            term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
            result = self.filters.send_message(message) => Raced::Done(result),
        };
        let message = match raced {
            Raced::Terminal(term) => {
                let _ = ack.send(Err(term.status.clone()));
                return Some(term);
            }
            Raced::Done(Ok(message)) => message,
            Raced::Done(Err(e)) => {
                let status = Status::internal(e.details().to_string());
                let _ = ack.send(Err(status.clone()));
                return Some(self.fail(status));
            }
        };

        let raced = tokio::select! {
            biased;
            term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
            result = self.transport.send_message(message.payload, message.flags) => Raced::Done(result),
        };
        match raced {
            Raced::Terminal(term) => {
                let _ = ack.send(Err(term.status.clone()));
                Some(term)
            }
            Raced::Done(Ok(())) => {
                let _ = ack.send(Ok(()));
                self.send_state = SendState::Writing;
                None
            }
            Raced::Done(Err(e)) => {
                let status = Status::unavailable(e.to_string());
                let _ = ack.send(Err(status.clone()));
                Some(self.fail(status))
            }
        }
    }

    async fn handle_end(&mut self) -> Option<Terminal> {
        if !matches!(self.send_state, SendState::MetadataSent | SendState::Writing) {
            tracing::warn!(method = %self.method, "end in invalid send state, dropping");
            return None;
        }
        let raced = tokio::select! {
            biased;
            term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
            result = self.transport.half_close() => Raced::Done(result),
        };
        match raced {
            Raced::Terminal(term) => Some(term),
            Raced::Done(Ok(())) => {
                self.send_state = SendState::HalfClosed;
                None
            }
            Raced::Done(Err(e)) => Some(self.fail(Status::unavailable(e.to_string()))),
        }
    }

    /// Record a send-side failure as the terminal outcome (unless another
    /// one already won).
    fn fail(&self, status: Status) -> Terminal {
        self.cancel.finish(Terminal { status, reset: true })
    }

    fn fail_pending_writes(&mut self, status: &Status) {
        let failure = if status.is_ok() {
            Status::new(Code::FailedPrecondition, "call already complete")
        } else {
            status.clone()
        };
        self.send_rx.close();
        while let Ok(op) = self.send_rx.try_recv() {
            if let SendOp::Write { ack, .. } = op {
                let _ = ack.send(Err(failure.clone()));
            }
        }
    }
}

enum RecvStep {
    Control(Option<ReadControl>),
    Event(Option<TransportEvent>),
}

/// Drives the receive axis: metadata, messages with read credit, trailers.
struct RecvDriver {
    method: Arc<str>,
    filters: Arc<FilterStack>,
    transport: Box<dyn TransportRecv>,
    read_rx: mpsc::UnboundedReceiver<ReadControl>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    cancel: Arc<CancelCell>,
    cancel_rx: watch::Receiver<Option<Terminal>>,
    recv_state: RecvState,
    /// Messages emitted but not yet consumed by the surface.
    outstanding: usize,
    paused_by_user: bool,
    paused_by_flow: bool,
}

impl RecvDriver {
    /// Run until the call has a terminal status, and return it.
    async fn drive(mut self) -> Status {
        loop {
            let step = tokio::select! {
                biased;
                term = wait_terminal(&mut self.cancel_rx) => return term.status,
                ctl = self.read_rx.recv() => RecvStep::Control(ctl),
                event = self.transport.recv(), if !(self.paused_by_user || self.paused_by_flow) => {
                    RecvStep::Event(event)
                }
            };
            match step {
                // All handles dropped: nobody can observe the call anymore.
                RecvStep::Control(None) => {
                    self.cancel.cancel(Status::cancelled("Cancelled on client"));
                }
                RecvStep::Control(Some(ctl)) => self.handle_control(ctl),
                RecvStep::Event(event) => {
                    if let Some(status) = self.handle_event(event).await {
                        return status;
                    }
                }
            }
        }
    }

    fn handle_control(&mut self, ctl: ReadControl) {
        match ctl {
            ReadControl::Pause => {
                self.paused_by_user = true;
                self.transport.pause_read();
            }
            ReadControl::Resume => {
                self.paused_by_user = false;
                if !self.paused_by_flow {
                    self.transport.resume_read();
                }
            }
            ReadControl::Consumed => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if self.paused_by_flow && self.outstanding <= READ_LOW_WATER {
                    self.paused_by_flow = false;
                    if !self.paused_by_user {
                        self.transport.resume_read();
                    }
                }
            }
        }
    }

    /// Process one transport event; returns the terminal status if this
    /// direction is done.
    async fn handle_event(&mut self, event: Option<TransportEvent>) -> Option<Status> {
        let Some(event) = event else {
            let status = match self.recv_state {
                RecvState::Init => Status::unavailable("transport closed"),
                _ => Status::unknown("stream closed before trailers"),
            };
            return Some(self.fail(status));
        };

        match event {
            TransportEvent::Error(e) => {
                let status = match self.recv_state {
                    RecvState::Init => Status::unavailable(e.to_string()),
                    _ => Status::unknown(e.to_string()),
                };
                Some(self.fail(status))
            }
            TransportEvent::Headers(metadata) => {
                if self.recv_state != RecvState::Init {
                    tracing::warn!(method = %self.method, "duplicate headers from transport, ignoring");
                    return None;
                }
                let raced = tokio::select! {
                    biased;
                    term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
                    result = self.filters.receive_metadata(metadata) => Raced::Done(result),
                };
                match raced {
                    Raced::Terminal(term) => Some(term.status),
                    Raced::Done(Ok(metadata)) => {
                        self.recv_state = RecvState::MetadataReceived;
                        let _ = self.events_tx.send(CallEvent::Metadata(metadata));
                        None
                    }
                    Raced::Done(Err(e)) => Some(self.fail(Status::internal(e.details().to_string()))),
                }
            }
            TransportEvent::Message(payload) => {
                if self.recv_state == RecvState::Init {
                    return Some(self.fail(Status::internal("message received before metadata")));
                }
                let raced = tokio::select! {
                    biased;
                    term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
                    result = self.filters.receive_message(payload) => Raced::Done(result),
                };
                match raced {
                    Raced::Terminal(term) => Some(term.status),
                    Raced::Done(Ok(payload)) => {
                        self.recv_state = RecvState::Reading;
                        self.outstanding += 1;
                        let _ = self.events_tx.send(CallEvent::Message(payload));
                        if self.outstanding >= READ_HIGH_WATER && !self.paused_by_flow {
                            self.paused_by_flow = true;
                            self.transport.pause_read();
                        }
                        None
                    }
                    Raced::Done(Err(e)) => Some(self.fail(Status::internal(e.details().to_string()))),
                }
            }
            TransportEvent::Trailers(trailers) => {
                let status = Status::from_trailers(trailers);
                let raced = tokio::select! {
                    biased;
                    term = wait_terminal(&mut self.cancel_rx) => Raced::Terminal(term),
                    result = self.filters.receive_trailers(status) => Raced::Done(result),
                };
                match raced {
                    Raced::Terminal(term) => Some(term.status),
                    Raced::Done(status) => {
                        self.recv_state = RecvState::TrailersReceived;
                        // Clean completion: no stream reset.
                        let term = self.cancel.finish(Terminal { status, reset: false });
                        Some(term.status)
                    }
                }
            }
        }
    }

    /// Record a receive-side failure as the terminal outcome (unless
    /// another one already won).
    fn fail(&self, status: Status) -> Status {
        self.cancel.finish(Terminal { status, reset: true }).status
    }
}
