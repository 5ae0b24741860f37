//! grpc-client - client-side gRPC call runtime.
//!
//! This crate implements the core of a gRPC client: the per-call state
//! machine driving an RPC over a multiplexed HTTP/2-style transport, the
//! async filter pipeline applied to everything that crosses the call, and
//! the unary/readable/writable/duplex surfaces applications consume.
//!
//! # Architecture
//!
//! ```text
//! application -> Client -> Channel::create_call -> call task -> FilterStack -> Transport
//!                                      surfaces <- call events <-----------------'
//! ```
//!
//! Connection management, name resolution, and load balancing live behind
//! the [`Channel`] and [`Connect`] seams; code-generated stubs sit on top
//! of the [`Client`] dispatch methods. Message payloads are opaque byte
//! buffers framed per the gRPC wire format; protobuf encoding belongs to
//! the caller's serialize/deserialize functions.

pub mod call;
pub mod channel;
pub mod client;
pub mod filter;
pub mod frame;
pub mod metadata;
pub mod status;
pub mod surface;
pub mod transport;

pub use call::{
    ActiveCall, CallConfig, CallCredentials, CallEvent, CallHandle, Deadline, WriteObject,
    READ_HIGH_WATER, READ_LOW_WATER, WRITE_NO_COMPRESS,
};
pub use channel::{Channel, ConnectivityState, TransportChannel};
pub use client::{CallOptions, ChannelCredentials, ChannelFactory, Client, ClientOptions};
pub use filter::{Filter, FilterFactory, FilterStack};
pub use frame::{MessageDecoder, decode_message, encode_message};
pub use metadata::{Metadata, MetadataValue, Timeout};
pub use status::{Code, Status};
pub use surface::{
    BoxError, ClientStreamCall, DeserializeFn, DuplexCall, RequestSink, Response, ResponseStream,
    SerializeFn, UnaryCall,
};
pub use transport::{Connect, TransportEvent, TransportRecv, TransportSend, TransportStream};
