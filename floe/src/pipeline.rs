//! Outbound interceptor chain.
//!
//! Interceptors wrap an inner invoker: they may rewrite the outgoing
//! request, observe the incoming response, or short-circuit entirely. The
//! chain terminates at a connection (or anything else that implements
//! [`Invoker`]).

use std::sync::Arc;

use floe_types::Invoker;

/// Interceptor transforming the invoker below it into the one above it.
pub type Interceptor = Box<dyn FnOnce(Arc<dyn Invoker>) -> Arc<dyn Invoker> + Send>;

/// Ordered interceptor chain; the last interceptor added runs outermost.
#[derive(Default)]
pub struct Pipeline {
    interceptors: Vec<Interceptor>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Add an interceptor. Returns `self` for chaining.
    pub fn with(
        mut self,
        interceptor: impl FnOnce(Arc<dyn Invoker>) -> Arc<dyn Invoker> + Send + 'static,
    ) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    /// Materialize the chain onto a terminal invoker.
    pub fn into_invoker(self, terminal: Arc<dyn Invoker>) -> Arc<dyn Invoker> {
        let mut invoker = terminal;
        for interceptor in self.interceptors {
            invoker = interceptor(invoker);
        }
        invoker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_types::{
        Error, IncomingResponse, InvokeFn, InvokeFuture, OutgoingRequest, Protocol, Proxy,
    };
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct Recording {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        inner: Arc<dyn Invoker>,
    }

    impl Invoker for Recording {
        fn invoke(
            &self,
            request: OutgoingRequest,
            cancel: CancellationToken,
        ) -> InvokeFuture<'_> {
            self.order.lock().unwrap().push(self.tag);
            self.inner.invoke(request, cancel)
        }
    }

    #[tokio::test]
    async fn last_added_interceptor_runs_outermost() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let terminal_order = order.clone();
        let terminal = Arc::new(InvokeFn(move |mut request: OutgoingRequest, _cancel| {
            terminal_order.lock().unwrap().push("terminal");
            request.payload.complete(None);
            async move { Err::<IncomingResponse, _>(Error::ConnectionClosed) }
        }));

        let first = order.clone();
        let second = order.clone();
        let invoker = Pipeline::new()
            .with(move |inner| {
                Arc::new(Recording {
                    tag: "first",
                    order: first,
                    inner,
                })
            })
            .with(move |inner| {
                Arc::new(Recording {
                    tag: "second",
                    order: second,
                    inner,
                })
            })
            .into_invoker(terminal);

        let proxy = Proxy::new(Protocol::IceRpc, "/x").unwrap();
        let request = OutgoingRequest::new(proxy, "op");
        let _ = invoker.invoke(request, CancellationToken::new()).await;

        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["second", "first", "terminal"]
        );
    }
}
