//! Protocol connections.
//!
//! Both protocols share the lifecycle bookkeeping in [`lifecycle`] and the
//! invocation failure/completion helpers below; everything else is
//! per-protocol.

pub mod ice;
pub mod icerpc;
mod lifecycle;

pub use lifecycle::ConnectionState;

use std::time::SystemTime;

use floe_types::{
    Deadline, Error, IncomingFields, IncomingResponse, OutgoingRequest, PayloadSource, ResultType,
};

/// Complete the request's payloads with `cause` and fail the invocation.
pub(crate) fn fail_invocation(
    request: &mut OutgoingRequest,
    cause: Error,
) -> Result<IncomingResponse, Error> {
    request.payload.complete(Some(cause.clone()));
    if let Some(stream) = request.payload_stream.as_mut() {
        stream.complete(Some(cause.clone()));
    }
    Err(cause)
}

/// Synthetic empty response for oneway invocations: success means "handed
/// to the transport", not "delivered".
pub(crate) fn oneway_response(request: &OutgoingRequest) -> IncomingResponse {
    IncomingResponse {
        result_type: ResultType::Success,
        encoding: request.proxy.encoding(),
        fields: IncomingFields::new(),
        payload: PayloadSource::empty(),
        payload_stream: None,
    }
}

/// Resolves when the deadline passes; pends forever for [`Deadline::NEVER`].
pub(crate) async fn deadline_expired(deadline: Deadline) {
    match deadline.time() {
        Some(when) => {
            let wait = when.duration_since(SystemTime::now()).unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}
