//! Application-facing call surfaces.
//!
//! Each RPC shape gets a facade over the same call machinery: a unary
//! response future, a readable stream of decoded responses, a writable sink
//! of encoded requests, and the duplex combination. Surfaces own the call's
//! event channel; dropping a surface drops the last handle and cancels the
//! call.

use crate::call::{ActiveCall, CallEvent, CallHandle, WriteObject};
use crate::metadata::Metadata;
use crate::status::{Code, Status};

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Boxed error used by user-supplied codec functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Encodes one request message to bytes.
pub type SerializeFn<Req> = Arc<dyn Fn(&Req) -> Result<Bytes, BoxError> + Send + Sync>;

/// Decodes one response message from bytes.
pub type DeserializeFn<Resp> = Arc<dyn Fn(&[u8]) -> Result<Resp, BoxError> + Send + Sync>;

/// A decoded unary response together with the initial metadata.
#[derive(Debug)]
pub struct Response<T> {
    pub metadata: Metadata,
    pub message: T,
}

impl<T> Response<T> {
    pub fn into_inner(self) -> T {
        self.message
    }
}

/// Surface of a unary RPC: cancellation, peer identity, and a single
/// response resolved by [`UnaryCall::response`].
pub struct UnaryCall<Resp> {
    handle: CallHandle,
    events: mpsc::UnboundedReceiver<CallEvent>,
    deserialize: DeserializeFn<Resp>,
}

impl<Resp> std::fmt::Debug for UnaryCall<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryCall").finish_non_exhaustive()
    }
}

impl<Resp> UnaryCall<Resp> {
    pub(crate) fn new(call: ActiveCall, deserialize: DeserializeFn<Resp>) -> Self {
        let (handle, events) = call.into_parts();
        Self {
            handle,
            events,
            deserialize,
        }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn peer(&self) -> String {
        self.handle.peer()
    }

    /// Resolve the call: exactly one message followed by OK trailers.
    ///
    /// Zero messages fail with `INTERNAL` "Not enough responses received";
    /// more than one fails with `INTERNAL` "Too many responses received".
    /// The message count is tracked explicitly, so responses that decode to
    /// default values are handled correctly.
    pub async fn response(mut self) -> Result<Response<Resp>, Status> {
        let mut metadata = Metadata::new();
        let mut message: Option<Resp> = None;
        let mut received = 0usize;
        let mut decode_failed = false;

        while let Some(event) = self.events.recv().await {
            match event {
                CallEvent::Metadata(md) => metadata = md,
                CallEvent::Message(payload) => {
                    self.handle.consumed();
                    received += 1;
                    if received > 1 {
                        self.handle
                            .cancel_with_status(Code::Internal, "Too many responses received");
                        continue;
                    }
                    match (self.deserialize)(&payload) {
                        Ok(decoded) => message = Some(decoded),
                        Err(e) => {
                            decode_failed = true;
                            tracing::debug!(error = %e, "failed to decode unary response");
                            self.handle
                                .cancel_with_status(Code::Internal, "Failed to parse server response");
                        }
                    }
                }
                CallEvent::End => {}
                CallEvent::Status(status) => {
                    if received > 1 {
                        return Err(Status::internal("Too many responses received"));
                    }
                    if decode_failed {
                        return Err(Status::internal("Failed to parse server response"));
                    }
                    if !status.is_ok() {
                        return Err(status);
                    }
                    return match message {
                        Some(message) => Ok(Response { metadata, message }),
                        None => Err(Status::internal("Not enough responses received")),
                    };
                }
            }
        }
        Err(Status::internal("call ended without a status"))
    }
}

/// Readable surface: an ordered sequence of decoded response messages.
pub struct ResponseStream<Resp> {
    handle: CallHandle,
    events: mpsc::UnboundedReceiver<CallEvent>,
    deserialize: DeserializeFn<Resp>,
    metadata: Option<Metadata>,
    trailing: Option<Status>,
    done: bool,
}

impl<Resp> ResponseStream<Resp> {
    pub(crate) fn new(call: ActiveCall, deserialize: DeserializeFn<Resp>) -> Self {
        let (handle, events) = call.into_parts();
        Self {
            handle,
            events,
            deserialize,
            metadata: None,
            trailing: None,
            done: false,
        }
    }

    /// Next decoded message.
    ///
    /// `Ok(None)` after a clean end of stream; `Err` carries the non-OK
    /// terminal status (or the decode failure that cancelled the call).
    /// Consuming a message returns read credit to the call, which resumes a
    /// flow-paused transport.
    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        if self.done {
            return match &self.trailing {
                Some(status) if !status.is_ok() => Err(status.clone()),
                _ => Ok(None),
            };
        }

        while let Some(event) = self.events.recv().await {
            match event {
                CallEvent::Metadata(md) => self.metadata = Some(md),
                CallEvent::Message(payload) => {
                    self.handle.consumed();
                    return match (self.deserialize)(&payload) {
                        Ok(decoded) => Ok(Some(decoded)),
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to decode streamed response");
                            let status = Status::internal("Failed to parse server response");
                            self.handle
                                .cancel_with_status(Code::Internal, "Failed to parse server response");
                            self.done = true;
                            self.trailing = Some(status.clone());
                            Err(status)
                        }
                    };
                }
                CallEvent::End => {}
                CallEvent::Status(status) => {
                    self.done = true;
                    self.trailing = Some(status.clone());
                    return if status.is_ok() { Ok(None) } else { Err(status) };
                }
            }
        }
        self.done = true;
        Err(Status::unknown("call dropped without a status"))
    }

    /// Initial metadata, once the first `Metadata` event has been observed.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Terminal status, once the stream has finished.
    pub fn trailing_status(&self) -> Option<&Status> {
        self.trailing.as_ref()
    }

    /// Stop the transport from producing further messages until resumed.
    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn peer(&self) -> String {
        self.handle.peer()
    }
}

/// Writable surface: serialized request messages flowing into the call.
pub struct RequestSink<Req> {
    handle: CallHandle,
    serialize: SerializeFn<Req>,
}

impl<Req> RequestSink<Req> {
    pub(crate) fn new(handle: CallHandle, serialize: SerializeFn<Req>) -> Self {
        Self { handle, serialize }
    }

    /// Serialize and write one message. Resolves when the transport has
    /// accepted the frame.
    pub async fn send(&self, request: &Req) -> Result<(), Status> {
        self.send_with_flags(request, 0).await
    }

    /// Like [`RequestSink::send`] with an explicit per-write flag word.
    pub async fn send_with_flags(&self, request: &Req, flags: u32) -> Result<(), Status> {
        let payload = match (self.serialize)(request) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "failed to encode request");
                self.handle
                    .cancel_with_status(Code::Internal, "Serialization failure");
                return Err(Status::internal("Serialization failure"));
            }
        };
        let ack = self.handle.write(WriteObject::with_flags(payload, flags));
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(Status::cancelled("call closed")),
        }
    }

    /// Half-close the send side: no further messages will be written.
    pub fn finish(&self) {
        self.handle.end();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn peer(&self) -> String {
        self.handle.peer()
    }
}

/// Client-streaming RPC: a request sink plus a unary response.
pub struct ClientStreamCall<Req, Resp> {
    sink: RequestSink<Req>,
    response: UnaryCall<Resp>,
}

impl<Req, Resp> ClientStreamCall<Req, Resp> {
    pub(crate) fn new(sink: RequestSink<Req>, response: UnaryCall<Resp>) -> Self {
        Self { sink, response }
    }

    pub async fn send(&self, request: &Req) -> Result<(), Status> {
        self.sink.send(request).await
    }

    pub async fn send_with_flags(&self, request: &Req, flags: u32) -> Result<(), Status> {
        self.sink.send_with_flags(request, flags).await
    }

    /// Half-close and await the single response.
    pub async fn finish(self) -> Result<Response<Resp>, Status> {
        self.sink.finish();
        self.response.response().await
    }

    pub fn cancel(&self) {
        self.sink.cancel();
    }

    pub fn peer(&self) -> String {
        self.sink.peer()
    }

    pub fn into_parts(self) -> (RequestSink<Req>, UnaryCall<Resp>) {
        (self.sink, self.response)
    }
}

/// Bidirectional RPC: sink and stream over one call.
pub struct DuplexCall<Req, Resp> {
    sink: RequestSink<Req>,
    stream: ResponseStream<Resp>,
}

impl<Req, Resp> DuplexCall<Req, Resp> {
    pub(crate) fn new(sink: RequestSink<Req>, stream: ResponseStream<Resp>) -> Self {
        Self { sink, stream }
    }

    pub async fn send(&self, request: &Req) -> Result<(), Status> {
        self.sink.send(request).await
    }

    pub async fn send_with_flags(&self, request: &Req, flags: u32) -> Result<(), Status> {
        self.sink.send_with_flags(request, flags).await
    }

    /// Half-close the send side; responses may continue to arrive.
    pub fn finish_sending(&self) {
        self.sink.finish();
    }

    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        self.stream.message().await
    }

    pub fn pause(&self) {
        self.stream.pause();
    }

    pub fn resume(&self) {
        self.stream.resume();
    }

    pub fn cancel(&self) {
        self.sink.cancel();
    }

    pub fn peer(&self) -> String {
        self.sink.peer()
    }

    /// Split into independently owned halves.
    pub fn into_parts(self) -> (RequestSink<Req>, ResponseStream<Resp>) {
        (self.sink, self.stream)
    }
}
