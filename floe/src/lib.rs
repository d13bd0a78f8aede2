#![deny(unsafe_code)]

//! Dual-protocol RPC connection runtime.
//!
//! floe drives concurrent invocations and dispatches over a single transport
//! connection, with strict payload-lifecycle accounting and graceful
//! shutdown. Two wire protocols live side by side:
//!
//! - `ice`, the legacy framed protocol: one byte stream, sequential frames
//!   correlated by request id ([`connection::ice`]);
//! - `icerpc`, the modern multiplexed protocol: one stream per request over
//!   a multiplexed transport ([`connection::icerpc`]).
//!
//! The server side routes requests by path ([`Router`]); the client side
//! stacks interceptors over a connection ([`Pipeline`]). Frame types,
//! payload streams, and the error taxonomy come from [`floe_types`]; the
//! byte-level codecs from [`floe_wire`].

pub mod connection;
mod pipeline;
mod router;
pub mod transport;

pub use connection::ConnectionState;
pub use connection::ice::{IceConnection, IceConnectionOptions, IceDriver};
pub use connection::icerpc::{IceRpcConnection, IceRpcConnectionOptions, IceRpcDriver};
pub use pipeline::{Interceptor, Pipeline};
pub use router::{MAX_SEGMENTS, Middleware, NotFoundDispatcher, Router, RouterError};

pub use floe_types::{
    Completed, Context, Deadline, DispatchErrorCode, DispatchException, DispatchFn, Dispatcher,
    Encoding, Endpoint, Error, Features, IncomingRequest, IncomingResponse, InvokeFn, Invoker,
    OutgoingFieldValue, OutgoingRequest, OutgoingResponse, PayloadSink, PayloadSource, Protocol,
    Proxy, ResultType, RetryHint, RetryPolicy,
};
