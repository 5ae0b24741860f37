//! Client facade: dispatch for the four RPC shapes.
//!
//! A `Client` owns one channel and exposes one typed entry point per call
//! pattern. Argument resolution is deterministic: absent metadata means
//! empty metadata, absent options mean default options, and an invalid
//! method path fails synchronously before any call exists.

use crate::call::{ActiveCall, CallCredentials, CallConfig, CallHandle, Deadline, WriteObject};
use crate::channel::{Channel, ConnectivityState, TransportChannel};
use crate::filter::FilterFactory;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::surface::{
    ClientStreamCall, DeserializeFn, DuplexCall, RequestSink, ResponseStream, SerializeFn, UnaryCall,
};
use crate::transport::Connect;

use std::sync::Arc;

/// How this client opens transport streams. Credentials own the connector
/// because negotiating a (secured) stream is exactly what they are for;
/// the connection machinery behind the connector lives outside this crate.
#[derive(Clone)]
pub struct ChannelCredentials {
    connector: Arc<dyn Connect>,
}

impl ChannelCredentials {
    pub fn from_connector(connector: Arc<dyn Connect>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> Arc<dyn Connect> {
        self.connector.clone()
    }
}

/// Builds a channel from target, credentials, and options.
pub type ChannelFactory =
    dyn Fn(&str, &ChannelCredentials, &ClientOptions) -> Arc<dyn Channel> + Send + Sync;

/// Construction options for [`Client`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Use this channel instead of constructing one.
    pub channel_override: Option<Arc<dyn Channel>>,
    /// Construct the channel through this factory.
    pub channel_factory_override: Option<Arc<ChannelFactory>>,
    /// Filter factories registered on a constructed channel, in order.
    pub filters: Vec<Arc<dyn FilterFactory>>,
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Deadline>,
    /// Authority override.
    pub host: Option<String>,
    /// Parent call for deadline inheritance and cancellation propagation.
    pub parent: Option<CallHandle>,
    /// Opaque propagation flags, handed to the channel untouched.
    pub propagate_flags: u32,
    pub credentials: Option<Arc<dyn CallCredentials>>,
}

/// gRPC client over a single channel.
pub struct Client {
    channel: Arc<dyn Channel>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Construct a client. The channel comes from `channel_override`, the
    /// factory override, or a [`TransportChannel`] over the credentials'
    /// connector, in that priority order.
    pub fn new(target: &str, credentials: &ChannelCredentials, options: ClientOptions) -> Result<Self, Status> {
        if target.is_empty() {
            return Err(Status::invalid_argument("Incorrect arguments passed"));
        }
        let channel: Arc<dyn Channel> = if let Some(channel) = &options.channel_override {
            channel.clone()
        } else if let Some(factory) = &options.channel_factory_override {
            factory(target, credentials, &options)
        } else {
            let mut channel = TransportChannel::new(target, credentials.connector());
            for factory in &options.filters {
                channel = channel.register_filter(factory.clone());
            }
            Arc::new(channel)
        };
        Ok(Self { channel })
    }

    /// Construct a client over an existing channel.
    pub fn from_channel(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Single request, single response.
    pub fn unary<Req, Resp>(
        &self,
        method: &str,
        serialize: SerializeFn<Req>,
        deserialize: DeserializeFn<Resp>,
        request: &Req,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> Result<UnaryCall<Resp>, Status> {
        let (call, metadata) = self.start_call(method, metadata, options)?;
        call.handle.send_metadata(metadata);
        self.write_single(&call.handle, &serialize, request);
        call.handle.end();
        Ok(UnaryCall::new(call, deserialize))
    }

    /// Stream of requests, single response.
    pub fn client_stream<Req, Resp>(
        &self,
        method: &str,
        serialize: SerializeFn<Req>,
        deserialize: DeserializeFn<Resp>,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> Result<ClientStreamCall<Req, Resp>, Status> {
        let (call, metadata) = self.start_call(method, metadata, options)?;
        call.handle.send_metadata(metadata);
        let sink = RequestSink::new(call.handle.clone(), serialize);
        Ok(ClientStreamCall::new(sink, UnaryCall::new(call, deserialize)))
    }

    /// Single request, stream of responses.
    pub fn server_stream<Req, Resp>(
        &self,
        method: &str,
        serialize: SerializeFn<Req>,
        deserialize: DeserializeFn<Resp>,
        request: &Req,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> Result<ResponseStream<Resp>, Status> {
        let (call, metadata) = self.start_call(method, metadata, options)?;
        call.handle.send_metadata(metadata);
        self.write_single(&call.handle, &serialize, request);
        call.handle.end();
        Ok(ResponseStream::new(call, deserialize))
    }

    /// Stream of requests, stream of responses.
    pub fn bidi<Req, Resp>(
        &self,
        method: &str,
        serialize: SerializeFn<Req>,
        deserialize: DeserializeFn<Resp>,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> Result<DuplexCall<Req, Resp>, Status> {
        let (call, metadata) = self.start_call(method, metadata, options)?;
        call.handle.send_metadata(metadata);
        let sink = RequestSink::new(call.handle.clone(), serialize);
        let stream = ResponseStream::new(call, deserialize);
        Ok(DuplexCall::new(sink, stream))
    }

    /// Wait until the channel reports `READY`.
    pub async fn wait_for_ready(&self, deadline: Deadline) -> Result<(), Status> {
        loop {
            match self.channel.connectivity_state(true) {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::Shutdown => {
                    return Err(Status::unavailable("The channel has been closed"));
                }
                state => {
                    if self
                        .channel
                        .watch_connectivity_state(state, deadline)
                        .await
                        .is_err()
                    {
                        return Err(Status::deadline_exceeded(
                            "Failed to connect before the deadline",
                        ));
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    fn start_call(
        &self,
        method: &str,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> Result<(ActiveCall, Metadata), Status> {
        if !valid_method_path(method) {
            return Err(Status::invalid_argument("Incorrect arguments passed"));
        }
        let options = options.unwrap_or_default();
        let deadline = match (options.deadline, &options.parent) {
            (Some(deadline), _) => deadline,
            (None, Some(parent)) => parent.deadline(),
            (None, None) => Deadline::Infinite,
        };
        let config = CallConfig {
            method: method.to_string(),
            deadline,
            host: options.host,
            parent: options.parent,
            propagate_flags: options.propagate_flags,
            credentials: options.credentials,
        };
        let call = self.channel.create_call(config)?;
        Ok((call, metadata.unwrap_or_default()))
    }

    /// Serialize and enqueue the single request of a unary or
    /// server-streaming call. A serialization failure cancels the call;
    /// the caller observes it through the terminal status.
    fn write_single<Req>(&self, handle: &CallHandle, serialize: &SerializeFn<Req>, request: &Req) {
        match serialize(request) {
            Ok(payload) => {
                let _ = handle.write(WriteObject::new(payload));
            }
            Err(e) => {
                tracing::debug!(method = %handle.method(), error = %e, "failed to encode request");
                handle.cancel_with_status(crate::status::Code::Internal, "Serialization failure");
            }
        }
    }
}

fn valid_method_path(method: &str) -> bool {
    method.len() > 1
        && method.starts_with('/')
        && method.bytes().all(|b| (0x21..0x7f).contains(&b))
}
