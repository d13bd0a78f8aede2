//! The two callable seams of the runtime.
//!
//! An [`Invoker`] turns an outgoing request into an incoming response
//! (client side); a [`Dispatcher`] turns an incoming request into an
//! outgoing response (server side). Both are object-safe so interceptor and
//! middleware chains can stack them behind `Arc<dyn _>`.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::{Error, IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse};

/// Boxed future returned by [`Invoker::invoke`].
pub type InvokeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<IncomingResponse, Error>> + Send + 'a>>;

/// Boxed future returned by [`Dispatcher::dispatch`].
pub type DispatchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<OutgoingResponse, Error>> + Send + 'a>>;

/// Client-side callable: sends a request, awaits its response.
///
/// From the moment `invoke` is called the implementation owns the request's
/// payloads and must complete each exactly once, on every code path.
pub trait Invoker: Send + Sync {
    fn invoke(&self, request: OutgoingRequest, cancel: CancellationToken) -> InvokeFuture<'_>;
}

/// Server-side callable: turns a request into a response.
///
/// A dispatch failure is returned as an error and mapped to a failure
/// response by the connection; it never tears the connection down.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: IncomingRequest, cancel: CancellationToken) -> DispatchFuture<'_>;
}

/// Adapter turning an async closure into a [`Dispatcher`].
pub struct DispatchFn<F>(pub F);

impl<F, Fut> Dispatcher for DispatchFn<F>
where
    F: Fn(IncomingRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OutgoingResponse, Error>> + Send + 'static,
{
    fn dispatch(&self, request: IncomingRequest, cancel: CancellationToken) -> DispatchFuture<'_> {
        Box::pin((self.0)(request, cancel))
    }
}

/// Adapter turning an async closure into an [`Invoker`].
pub struct InvokeFn<F>(pub F);

impl<F, Fut> Invoker for InvokeFn<F>
where
    F: Fn(OutgoingRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<IncomingResponse, Error>> + Send + 'static,
{
    fn invoke(&self, request: OutgoingRequest, cancel: CancellationToken) -> InvokeFuture<'_> {
        Box::pin((self.0)(request, cancel))
    }
}
