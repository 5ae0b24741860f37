//! Transport seam consumed by the call state machine.
//!
//! A transport stream is one ordered, framed HTTP/2-style request/response
//! exchange, handed to the call as two independently owned halves: a send
//! half whose writes resolve when the transport has accepted the frame, and
//! a receive half exposed as a single tagged event stream. The halves are
//! driven concurrently, so a back-pressured write never has to wait on the
//! receive side or the other way around. How frames reach the network is
//! the transport's business; the call core never sees raw bytes below the
//! framing layer.

use crate::metadata::Metadata;
use crate::status::Code;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// Inbound activity on a transport stream.
#[derive(Debug)]
pub enum TransportEvent {
    /// Initial response headers.
    Headers(Metadata),
    /// One framed message payload.
    Message(Bytes),
    /// Trailing headers carrying `grpc-status` and friends.
    Trailers(Metadata),
    /// The stream failed below the call layer.
    Error(io::Error),
}

/// Send half of a transport stream.
#[async_trait]
pub trait TransportSend: Send {
    /// Emit request headers. Resolves when the transport accepts them.
    async fn send_headers(&mut self, metadata: Metadata) -> io::Result<()>;

    /// Emit one framed message. Resolves when the transport accepts the
    /// frame; this is the write-side back-pressure signal.
    async fn send_message(&mut self, message: Bytes, flags: u32) -> io::Result<()>;

    /// Signal that no further messages follow.
    async fn half_close(&mut self) -> io::Result<()>;

    /// Abort the stream.
    fn reset(&mut self, code: Code);

    /// Human-readable endpoint identifier.
    fn peer(&self) -> String;
}

/// Receive half of a transport stream.
///
/// `recv` must be cancel-safe (dropping the future loses no event), which
/// every channel-backed implementation gets for free.
#[async_trait]
pub trait TransportRecv: Send {
    /// Next inbound event, or `None` once the stream is finished.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Stop producing inbound events until resumed.
    fn pause_read(&mut self);

    fn resume_read(&mut self);
}

/// One transport stream, split into its two halves.
pub struct TransportStream {
    pub send: Box<dyn TransportSend>,
    pub recv: Box<dyn TransportRecv>,
}

/// Opens one [`TransportStream`] per call.
///
/// Implemented by whatever owns the connection: a connection manager, a
/// pooled HTTP/2 session, or a test double.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Open a stream for the given method path, optionally overriding the
    /// authority the stream is addressed to.
    async fn connect(&self, method: &str, authority: Option<&str>) -> io::Result<TransportStream>;
}
