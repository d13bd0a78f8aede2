//! Legacy framed protocol connection.
//!
//! One byte stream, sequential frames. The connection splits into a clonable
//! handle (invocations, shutdown) and a driver that owns the read half and
//! must be spawned. Frame writes are serialized through a single async lock;
//! a pending twoway invocation is registered under that lock, before the
//! frame leaves, so its reply can never race the registration.
//!
//! Handshake: the acceptor sends ValidateConnection immediately, the
//! connector waits for it before sending anything.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use floe_types::{
    Context, Deadline, DispatchException, Dispatcher, Error, Features, IncomingFields,
    IncomingRequest, IncomingResponse, Invoker, OutgoingRequest, PayloadSource, Protocol,
    ResultType, RetryPolicy,
};
use floe_wire::ice::{
    Encapsulation, HEADER_LEN, IceFrameHeader, IceFrameType, IceReply, IceRequest, Identity,
    ONEWAY_REQUEST_ID, OperationMode, ReplyStatus, decode_frame_header, frame,
};
use floe_wire::{Decoder, icerpc};

use super::lifecycle::{ConnectionState, Lifecycle, OpGuard};
use super::{deadline_expired, fail_invocation, oneway_response};

/// Configuration for a legacy framed connection.
#[derive(Debug, Clone)]
pub struct IceConnectionOptions {
    /// Upper bound on accepted frame sizes, header included.
    pub max_frame_size: u32,
}

impl Default for IceConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024, // 1 MiB
        }
    }
}

type PendingReply = oneshot::Sender<Result<IceReply, Error>>;

struct IceShared<S> {
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    lifecycle: Arc<Lifecycle>,
    pending: Mutex<HashMap<i32, PendingReply>>,
    next_request_id: Mutex<i32>,
    options: IceConnectionOptions,
}

impl<S> IceShared<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Serialize one frame onto the wire. Frames never interleave.
    async fn write_frame(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn allocate_request_id(&self) -> Result<i32, Error> {
        let mut next = self.next_request_id.lock();
        if *next == i32::MAX {
            return Err(Error::Protocol("request id space exhausted".into()));
        }
        let id = *next;
        *next += 1;
        Ok(id)
    }

    fn take_pending(&self, request_id: i32) -> Option<PendingReply> {
        self.pending.lock().remove(&request_id)
    }

    fn fail_pending(&self, cause: &Error) {
        let drained: Vec<PendingReply> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(cause.clone()));
        }
    }

    /// Hard failure: close the state machine and fail everything in flight.
    fn fail(&self, cause: Error) {
        self.lifecycle.close();
        self.lifecycle.cancel_dispatches();
        self.fail_pending(&cause);
        self.lifecycle.abort_invocations(cause);
    }
}

/// Clonable handle to a legacy framed connection.
pub struct IceConnection<S> {
    shared: Arc<IceShared<S>>,
}

impl<S> Clone for IceConnection<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Owns the read half; must be spawned for the connection to make progress.
pub struct IceDriver<S> {
    reader: ReadHalf<S>,
    shared: Arc<IceShared<S>>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Connect over an established byte stream: wait for the acceptor's
/// ValidateConnection, then hand back the handle/driver pair.
pub async fn connect<S>(
    io: S,
    options: IceConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(IceConnection<S>, IceDriver<S>), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(io);
    let Some((header, _body)) = read_frame(&mut reader, options.max_frame_size).await? else {
        return Err(Error::ConnectionClosed);
    };
    if header.frame_type != IceFrameType::ValidateConnection {
        return Err(Error::Protocol(format!(
            "expected ValidateConnection, got {:?}",
            header.frame_type
        )));
    }
    trace!("connection validated by peer");
    Ok(build(reader, writer, options, dispatcher))
}

/// Accept over an established byte stream: send ValidateConnection first.
pub async fn accept<S>(
    io: S,
    options: IceConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(IceConnection<S>, IceDriver<S>), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(io);
    let validate = frame(IceFrameType::ValidateConnection, &[]);
    writer.write_all(&validate).await?;
    writer.flush().await?;
    Ok(build(reader, writer, options, dispatcher))
}

fn build<S>(
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    options: IceConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> (IceConnection<S>, IceDriver<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let shared = Arc::new(IceShared {
        writer: tokio::sync::Mutex::new(Some(writer)),
        lifecycle: Lifecycle::new(),
        pending: Mutex::new(HashMap::new()),
        next_request_id: Mutex::new(1),
        options,
    });
    (
        IceConnection {
            shared: shared.clone(),
        },
        IceDriver {
            reader,
            shared,
            dispatcher,
        },
    )
}

/// Read one frame. `None` on a clean end-of-stream at a frame boundary.
async fn read_frame<S>(
    reader: &mut ReadHalf<S>,
    max_frame_size: u32,
) -> Result<Option<(IceFrameHeader, Vec<u8>)>, Error>
where
    S: AsyncRead,
{
    let mut head = [0u8; HEADER_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = decode_frame_header(&head)?;
    if header.frame_size > max_frame_size {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit {max_frame_size}",
            header.frame_size
        )));
    }
    let mut body = vec![0u8; header.frame_size as usize - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok(Some((header, body)))
}

impl<S> IceConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    pub fn has_invocations_in_progress(&self) -> bool {
        self.shared.lifecycle.has_invocations_in_progress()
    }

    pub fn has_dispatches_in_progress(&self) -> bool {
        self.shared.lifecycle.has_dispatches_in_progress()
    }

    /// Called once if the peer initiates shutdown. The local side decides
    /// whether to shut down in turn.
    pub fn on_peer_shutdown(&self, callback: impl FnOnce(&str) + Send + 'static) {
        self.shared.lifecycle.set_peer_shutdown(Box::new(callback));
    }

    /// Send a request and, for twoway requests, await its reply.
    pub async fn invoke(
        &self,
        mut request: OutgoingRequest,
        cancel: CancellationToken,
    ) -> Result<IncomingResponse, Error> {
        let shared = &self.shared;

        let Some(_guard) = shared.lifecycle.try_begin_invocation() else {
            request.retry_hint.set(RetryPolicy::Immediately);
            return fail_invocation(&mut request, Error::ConnectionClosed);
        };

        if request.proxy.protocol() != Protocol::Ice {
            let err = Error::InvalidArgument(format!(
                "proxy speaks {}, connection speaks ice",
                request.proxy.protocol()
            ));
            return fail_invocation(&mut request, err);
        }
        if request.payload_stream.is_some() {
            let err =
                Error::InvalidArgument("payload streaming is not supported by this protocol".into());
            return fail_invocation(&mut request, err);
        }
        if request.operation.is_empty() {
            return fail_invocation(&mut request, Error::InvalidArgument("empty operation".into()));
        }

        let identity = match Identity::from_path(request.path()) {
            Ok(identity) => identity,
            Err(e) => return fail_invocation(&mut request, e),
        };

        let payload_bytes = match request.payload.read_to_end().await {
            Ok(bytes) => bytes,
            Err(e) => {
                request.retry_hint.set(RetryPolicy::Immediately);
                request.payload.complete(Some(e.clone()));
                return Err(e);
            }
        };

        let oneway = request.oneway;
        let request_id = if oneway {
            ONEWAY_REQUEST_ID
        } else {
            match shared.allocate_request_id() {
                Ok(id) => id,
                Err(e) => {
                    // Id exhaustion fails the whole connection.
                    shared.fail(e.clone());
                    request.payload.complete(Some(e.clone()));
                    return Err(e);
                }
            }
        };

        let context = request
            .features
            .get::<Context>()
            .cloned()
            .unwrap_or_default();
        let ice_request = IceRequest {
            request_id,
            identity,
            facet: Vec::new(),
            operation: request.operation.clone(),
            mode: if request.idempotent {
                OperationMode::Idempotent
            } else {
                OperationMode::Normal
            },
            context,
            encapsulation: Encapsulation::new(request.proxy.encoding(), payload_bytes),
        };
        let mut body = Vec::new();
        ice_request.encode(&mut body);
        let frame_bytes = frame(IceFrameType::Request, &body);

        // Register the pending reply while holding the write lock, so the
        // read loop can only see the entry once the frame is on its way.
        let reply_rx = {
            let mut slot = shared.writer.lock().await;
            let Some(writer) = slot.as_mut() else {
                request.retry_hint.set(RetryPolicy::Immediately);
                return fail_invocation(&mut request, Error::ConnectionClosed);
            };
            let reply_rx = if oneway {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                shared.pending.lock().insert(request_id, tx);
                Some(rx)
            };
            let write = async {
                writer.write_all(&frame_bytes).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(())
            };
            if let Err(e) = write.await {
                shared.take_pending(request_id);
                drop(slot);
                let err = Error::from(e);
                if request.idempotent {
                    request.retry_hint.set(RetryPolicy::OtherReplica);
                }
                request.payload.complete(Some(err.clone()));
                shared.fail(err.clone());
                return Err(err);
            }
            reply_rx
        };

        let Some(reply_rx) = reply_rx else {
            request.payload.complete(None);
            return Ok(oneway_response(&request));
        };

        let aborted = shared.lifecycle.aborted();
        let deadline = deadline_expired(request.deadline);
        tokio::pin!(deadline);

        // An already-delivered reply wins over a concurrent cancel or abort.
        let reply = tokio::select! {
            biased;
            reply = reply_rx => match reply {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    if request.idempotent {
                        request.retry_hint.set(RetryPolicy::OtherReplica);
                    }
                    request.payload.complete(Some(e.clone()));
                    return Err(e);
                }
                Err(_) => {
                    request.payload.complete(Some(Error::ConnectionClosed));
                    return Err(Error::ConnectionClosed);
                }
            },
            _ = cancel.cancelled() => {
                shared.take_pending(request_id);
                request.payload.complete(Some(Error::Cancelled));
                return Err(Error::Cancelled);
            }
            _ = &mut deadline => {
                shared.take_pending(request_id);
                request.payload.complete(Some(Error::Cancelled));
                return Err(Error::Cancelled);
            }
            _ = aborted.cancelled() => {
                shared.take_pending(request_id);
                let err = shared.lifecycle.abort_reason();
                request.payload.complete(Some(err.clone()));
                return Err(err);
            }
        };

        // The reply is the peer's acknowledgement of the request payload.
        request.payload.complete(None);
        Ok(response_from_reply(reply))
    }

    /// Transition to ShuttingDown, drain in-flight work, send
    /// CloseConnection, and close.
    ///
    /// If `cancel` fires while draining, in-flight dispatches see their
    /// tokens cancelled and pending invocations fail with
    /// [`Error::Cancelled`]; shutdown itself still completes.
    pub async fn shutdown(&self, reason: &str, cancel: CancellationToken) -> Result<(), Error> {
        let shared = &self.shared;
        if !shared.lifecycle.begin_shutdown() {
            return Ok(());
        }
        debug!(reason, "shutting down connection");

        tokio::select! {
            biased;
            _ = shared.lifecycle.wait_idle() => {}
            _ = cancel.cancelled() => {
                shared.lifecycle.cancel_dispatches();
                shared.lifecycle.abort_invocations(Error::Cancelled);
                shared.fail_pending(&Error::Cancelled);
            }
        }

        // Best effort: the peer may already be gone.
        let _ = shared
            .write_frame(&frame(IceFrameType::CloseConnection, &[]))
            .await;
        shared.lifecycle.close();
        Ok(())
    }

    /// Hard abort: fail everything in flight and drop the transport.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        shared.lifecycle.close();
        shared.lifecycle.cancel_dispatches();
        shared.fail_pending(&Error::Disposed);
        shared.lifecycle.abort_invocations(Error::Disposed);
        let mut slot = shared.writer.lock().await;
        if let Some(mut writer) = slot.take() {
            let _ = writer.shutdown().await;
        }
    }
}

fn response_from_reply(reply: IceReply) -> IncomingResponse {
    let encoding = reply.encapsulation.encoding;
    let (result_type, payload) = match reply.status {
        ReplyStatus::Ok => (ResultType::Success, reply.encapsulation.payload),
        ReplyStatus::UserException => (ResultType::Failure, reply.encapsulation.payload),
        status => {
            // System failures carry only a message; re-encode them in the
            // uniform failure payload so callers decode one shape.
            let code = status
                .dispatch_code()
                .expect("system reply status maps to a dispatch code");
            let message = String::from_utf8_lossy(&reply.encapsulation.payload).into_owned();
            (
                ResultType::Failure,
                icerpc::encode_dispatch_exception(&DispatchException::new(code, message)),
            )
        }
    };
    IncomingResponse {
        result_type,
        encoding,
        fields: IncomingFields::new(),
        payload: PayloadSource::from_bytes(payload),
        payload_stream: None,
    }
}

impl<S> IceDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Run the read loop until the connection ends. Spawn this.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.read_loop().await;
        match &result {
            Ok(()) => {
                self.shared.fail(Error::ConnectionClosed);
            }
            Err(e) => {
                warn!(error = %e, "connection failed");
                self.shared.fail(e.clone());
            }
        }
        result
    }

    async fn read_loop(&mut self) -> Result<(), Error> {
        loop {
            let Some((header, body)) =
                read_frame(&mut self.reader, self.shared.options.max_frame_size).await?
            else {
                debug!("peer closed the transport");
                return Ok(());
            };

            match header.frame_type {
                IceFrameType::ValidateConnection => {
                    trace!("ignoring ValidateConnection after handshake");
                }
                IceFrameType::RequestBatch => {
                    // Declared by the protocol but not part of this runtime:
                    // decode nothing, drop the frame.
                    debug!(bytes = body.len(), "ignoring batch request frame");
                }
                IceFrameType::CloseConnection => {
                    debug!("peer initiated shutdown");
                    self.shared.lifecycle.notify_peer_shutdown("connection closed by peer");
                    return Ok(());
                }
                IceFrameType::Reply => {
                    let reply = IceReply::decode(&mut Decoder::new(&body))?;
                    match self.shared.take_pending(reply.request_id) {
                        Some(tx) => {
                            let _ = tx.send(Ok(reply));
                        }
                        None => {
                            debug!(request_id = reply.request_id, "reply for unknown request");
                        }
                    }
                }
                IceFrameType::Request => {
                    let ice_request = IceRequest::decode(&mut Decoder::new(&body))?;
                    let Some(guard) = self.shared.lifecycle.try_begin_dispatch() else {
                        debug!(
                            request_id = ice_request.request_id,
                            "dropping request received while shutting down"
                        );
                        continue;
                    };
                    let shared = self.shared.clone();
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        dispatch_request(shared, dispatcher, ice_request, guard).await;
                    });
                }
            }
        }
    }
}

async fn dispatch_request<S>(
    shared: Arc<IceShared<S>>,
    dispatcher: Arc<dyn Dispatcher>,
    ice_request: IceRequest,
    guard: OpGuard,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let request_id = ice_request.request_id;
    let oneway = ice_request.is_oneway();
    let encoding = ice_request.encapsulation.encoding;

    let mut features = Features::new();
    if !ice_request.context.0.is_empty() {
        features.insert(ice_request.context.clone());
    }
    let payload = PayloadSource::from_bytes(ice_request.encapsulation.payload.clone());
    let payload_completer = payload.completer();
    let incoming = IncomingRequest {
        path: ice_request.identity.to_path(),
        operation: ice_request.operation.clone(),
        idempotent: matches!(
            ice_request.mode,
            OperationMode::Idempotent | OperationMode::Nonmutating
        ),
        oneway,
        deadline: Deadline::NEVER,
        fields: IncomingFields::new(),
        features,
        payload,
        payload_stream: None,
    };

    let token = shared.lifecycle.dispatch_token();
    let result = dispatcher.dispatch(incoming, token).await;

    match result {
        Ok(mut response) => {
            if let Some(mut stream) = response.payload_stream.take() {
                stream.complete(Some(Error::InvalidArgument(
                    "payload streaming is not supported by this protocol".into(),
                )));
            }
            match response.payload.read_to_end().await {
                Ok(bytes) => {
                    if oneway {
                        response.payload.complete(None);
                        payload_completer.complete(None);
                    } else {
                        let status = match response.result_type {
                            ResultType::Success => ReplyStatus::Ok,
                            ResultType::Failure => ReplyStatus::UserException,
                        };
                        let outcome =
                            write_reply(&shared, request_id, status, encoding, bytes).await;
                        match outcome {
                            Ok(()) => {
                                response.payload.complete(None);
                                payload_completer.complete(None);
                            }
                            Err(e) => {
                                warn!(request_id, error = %e, "failed to write reply");
                                response.payload.complete(Some(e.clone()));
                                payload_completer.complete(Some(e));
                            }
                        }
                    }
                }
                Err(e) => {
                    response.payload.complete(Some(e.clone()));
                    if !oneway {
                        let _ = write_reply(
                            &shared,
                            request_id,
                            ReplyStatus::UnknownException,
                            encoding,
                            Bytes::from(e.to_string().into_bytes()),
                        )
                        .await;
                    }
                    payload_completer.complete(Some(e));
                }
            }
        }
        Err(e) => {
            let exception = DispatchException::from_error(e);
            if !oneway {
                let status = ReplyStatus::for_dispatch_code(exception.code);
                let _ = write_reply(
                    &shared,
                    request_id,
                    status,
                    encoding,
                    Bytes::from(exception.message.clone().into_bytes()),
                )
                .await;
            }
            payload_completer.complete(Some(Error::Dispatch(exception)));
        }
    }

    drop(guard);
}

async fn write_reply<S>(
    shared: &IceShared<S>,
    request_id: i32,
    status: ReplyStatus,
    encoding: floe_types::Encoding,
    payload: Bytes,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let reply = IceReply {
        request_id,
        status,
        encapsulation: Encapsulation::new(encoding, payload),
    };
    let mut body = Vec::new();
    reply.encode(&mut body);
    shared.write_frame(&frame(IceFrameType::Reply, &body)).await
}

impl<S> Invoker for IceConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn invoke(
        &self,
        request: OutgoingRequest,
        cancel: CancellationToken,
    ) -> floe_types::InvokeFuture<'_> {
        Box::pin(self.invoke(request, cancel))
    }
}
