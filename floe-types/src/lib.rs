#![deny(unsafe_code)]

//! Core data model for the floe RPC runtime.
//!
//! This crate defines the protocol-independent vocabulary shared by both
//! wire protocols: request/response envelopes, lazy payload streams with
//! exactly-once completion, endpoints and proxies, the error taxonomy, and
//! the [`Invoker`]/[`Dispatcher`] seams that client pipelines and server
//! routers plug into.

mod endpoint;
mod error;
mod features;
mod frame;
mod invoker;
mod payload;
mod proxy;
mod retry;

pub use endpoint::Endpoint;
pub use error::{DispatchErrorCode, DispatchException, Error};
pub use features::{Context, Features};
pub use frame::{
    Deadline, Encoding, FieldEncoder, IncomingFields, IncomingRequest, IncomingResponse,
    OutgoingFieldValue, OutgoingFields, OutgoingRequest, OutgoingResponse, ResultType,
    connection_fields, request_fields,
};
pub use invoker::{DispatchFn, DispatchFuture, Dispatcher, InvokeFn, InvokeFuture, Invoker};
pub use payload::{
    Completed, Completer, PayloadReader, PayloadSink, PayloadSinkDecorator, PayloadSource,
    PayloadWriter, ReadFuture, WriteFuture,
};
pub use proxy::{Protocol, Proxy, check_path};
pub use retry::{RetryHint, RetryPolicy};
