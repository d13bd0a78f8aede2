//! Multiplexed protocol connection: one stream per request.
//!
//! Setup is symmetric. Each side opens a unidirectional control stream,
//! sends an Initialize frame carrying its fields map, and reads the peer's
//! Initialize from the first stream it accepts; unknown keys are kept and
//! surfaced through [`IceRpcConnection::peer_fields`]. Request streams carry
//! a size-prefixed header, a size-prefixed main payload segment, and then
//! raw payload-stream bytes until end-of-stream; the payload stream never
//! starts before the main payload is fully written.
//!
//! Shutdown announces itself with a GoAway control frame, drains in-flight
//! work, finishes the control stream, and closes the transport.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use floe_types::{
    Completer, Context, DispatchException, Dispatcher, Encoding, Error, Features,
    IncomingRequest, IncomingResponse, Invoker, OutgoingFields, OutgoingRequest, OutgoingResponse,
    PayloadReader, PayloadSink, PayloadSource, PayloadWriter, Protocol, ReadFuture, ResultType,
    RetryPolicy, WriteFuture, connection_fields, request_fields,
};
use floe_wire::fields::{context_field, decode_context_field, decode_varuint_field, varuint_field};
use floe_wire::icerpc::{
    ControlFrame, RequestHeader, ResponseHeader, decode_control_frame, decode_request_header,
    decode_response_header, encode_dispatch_exception, encode_go_away, encode_initialize,
};
use floe_wire::varint::put_varuint62;

use super::lifecycle::{ConnectionState, Lifecycle, OpGuard};
use super::{deadline_expired, fail_invocation, oneway_response};
use crate::transport::{
    ChunkReader, MultiplexedConnection, MultiplexedStream, StreamReader, StreamWriter,
};

type StreamOf<M> = <M as MultiplexedConnection>::Stream;
type WriterOf<M> = <StreamOf<M> as MultiplexedStream>::Writer;
type ReaderOf<M> = <StreamOf<M> as MultiplexedStream>::Reader;

/// Configuration for a multiplexed protocol connection.
pub struct IceRpcConnectionOptions {
    /// Largest request/response header this side accepts; advertised to the
    /// peer during setup.
    pub max_header_size: u32,
    /// Extra fields sent in the Initialize frame. The receiver keeps
    /// unknown keys.
    pub fields: OutgoingFields,
}

impl Default for IceRpcConnectionOptions {
    fn default() -> Self {
        Self {
            max_header_size: 16_383,
            fields: OutgoingFields::new(),
        }
    }
}

struct Shared<M: MultiplexedConnection> {
    transport: M,
    control_send: tokio::sync::Mutex<Option<WriterOf<M>>>,
    peer_fields: floe_types::IncomingFields,
    lifecycle: Arc<Lifecycle>,
    local_max_header_size: u32,
    peer_max_header_size: u32,
}

impl<M: MultiplexedConnection> Shared<M> {
    fn fail(&self, cause: Error) {
        self.lifecycle.close();
        self.lifecycle.cancel_dispatches();
        self.lifecycle.abort_invocations(cause);
    }
}

/// Clonable handle to a multiplexed protocol connection.
pub struct IceRpcConnection<M: MultiplexedConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: MultiplexedConnection> Clone for IceRpcConnection<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Accepts request streams and watches the peer's control stream. Spawn it.
pub struct IceRpcDriver<M: MultiplexedConnection> {
    shared: Arc<Shared<M>>,
    control_reader: ChunkReader<ReaderOf<M>>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Establish from the connecting side.
pub async fn connect<M>(
    transport: M,
    options: IceRpcConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(IceRpcConnection<M>, IceRpcDriver<M>), Error>
where
    M: MultiplexedConnection,
{
    establish(transport, options, dispatcher).await
}

/// Establish from the accepting side. The exchange is symmetric; the two
/// entry points exist so call sites read like their transport setup.
pub async fn accept<M>(
    transport: M,
    options: IceRpcConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(IceRpcConnection<M>, IceRpcDriver<M>), Error>
where
    M: MultiplexedConnection,
{
    establish(transport, options, dispatcher).await
}

async fn establish<M>(
    transport: M,
    mut options: IceRpcConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(IceRpcConnection<M>, IceRpcDriver<M>), Error>
where
    M: MultiplexedConnection,
{
    // Our control stream carries Initialize now and GoAway at shutdown.
    let control = transport.open_unidirectional().await?;
    let (writer, _) = control.into_halves();
    let mut control_send =
        writer.ok_or_else(|| Error::transport("unidirectional stream without send half"))?;

    let mut fields = std::mem::take(&mut options.fields);
    fields.insert(
        connection_fields::MAX_HEADER_SIZE,
        varuint_field(u64::from(options.max_header_size)),
    );
    let initialize = encode_initialize(&fields)?;
    send_control_frame(&mut control_send, &initialize).await?;

    // The peer's control stream is the first stream it opens.
    let peer_control = transport.accept_stream().await?;
    let (_, reader) = peer_control.into_halves();
    let reader = reader.ok_or_else(|| Error::Protocol("control stream without data".into()))?;
    let mut control_reader = ChunkReader::new(reader);
    let frame = read_control_frame(&mut control_reader, options.max_header_size)
        .await?
        .ok_or_else(|| Error::Protocol("control stream closed before initialize".into()))?;
    let peer_fields = match frame {
        ControlFrame::Initialize(fields) => fields,
        other => {
            return Err(Error::Protocol(format!(
                "expected initialize, got {other:?}"
            )));
        }
    };

    let peer_max_header_size = match peer_fields.get(&connection_fields::MAX_HEADER_SIZE) {
        Some(bytes) => u32::try_from(decode_varuint_field(bytes)?)
            .map_err(|_| Error::Protocol("peer max header size out of range".into()))?,
        None => options.max_header_size,
    };
    debug!(peer_max_header_size, "connection established");

    let shared = Arc::new(Shared {
        transport,
        control_send: tokio::sync::Mutex::new(Some(control_send)),
        peer_fields,
        lifecycle: Lifecycle::new(),
        local_max_header_size: options.max_header_size,
        peer_max_header_size,
    });
    Ok((
        IceRpcConnection {
            shared: shared.clone(),
        },
        IceRpcDriver {
            shared,
            control_reader,
            dispatcher,
        },
    ))
}

/// One control frame on the wire: varuint62 length, then the frame body.
async fn send_control_frame<W: StreamWriter>(writer: &mut W, frame: &[u8]) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(frame.len() + 4);
    put_varuint62(&mut buf, frame.len() as u64);
    buf.extend_from_slice(frame);
    writer.write(Bytes::from(buf)).await
}

/// `None` when the control stream ended cleanly.
async fn read_control_frame<R: StreamReader>(
    reader: &mut ChunkReader<R>,
    max_size: u32,
) -> Result<Option<ControlFrame>, Error> {
    let Some(len) = reader.try_read_varuint62().await? else {
        return Ok(None);
    };
    if len > u64::from(max_size) {
        return Err(Error::Protocol(format!(
            "control frame of {len} bytes exceeds limit {max_size}"
        )));
    }
    let bytes = reader.read_exact(len as usize).await?;
    Ok(Some(decode_control_frame(&bytes)?))
}

impl<M: MultiplexedConnection> IceRpcConnection<M> {
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    pub fn has_invocations_in_progress(&self) -> bool {
        self.shared.lifecycle.has_invocations_in_progress()
    }

    pub fn has_dispatches_in_progress(&self) -> bool {
        self.shared.lifecycle.has_dispatches_in_progress()
    }

    /// Fields the peer sent in its Initialize frame, unknown keys included.
    pub fn peer_fields(&self) -> &floe_types::IncomingFields {
        &self.shared.peer_fields
    }

    /// Called once if the peer announces shutdown. The local side decides
    /// whether to shut down in turn.
    pub fn on_peer_shutdown(&self, callback: impl FnOnce(&str) + Send + 'static) {
        self.shared.lifecycle.set_peer_shutdown(Box::new(callback));
    }

    /// Send a request on its own stream and, for twoway requests, await the
    /// response.
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

        if request.proxy.protocol() != Protocol::IceRpc {
            let err = Error::InvalidArgument(format!(
                "proxy speaks {}, connection speaks icerpc",
                request.proxy.protocol()
            ));
            return fail_invocation(&mut request, err);
        }
        if request.operation.is_empty() {
            return fail_invocation(
                &mut request,
                Error::InvalidArgument("empty operation".into()),
            );
        }

        // Header first: encoding failures must fail before anything opens.
        let mut fields = std::mem::take(&mut request.fields);
        if let Some(context) = request.features.get::<Context>() {
            if !context.0.is_empty() && !fields.contains_key(&request_fields::CONTEXT) {
                fields.insert(request_fields::CONTEXT, context_field(context));
            }
        }
        let header = RequestHeader {
            path: request.path().to_owned(),
            operation: request.operation.clone(),
            idempotent: request.idempotent,
            priority: None,
            deadline: request.deadline,
            fields,
        };
        let header_bytes = match header.encode() {
            Ok(bytes) if bytes.len() as u64 <= u64::from(shared.peer_max_header_size) => bytes,
            Ok(bytes) => {
                let err = Error::InvalidArgument(format!(
                    "request header of {} bytes exceeds peer limit {}",
                    bytes.len(),
                    shared.peer_max_header_size
                ));
                return fail_invocation(&mut request, err);
            }
            Err(e) => return fail_invocation(&mut request, e),
        };

        // The payload-writer stack wraps the sink the payload is copied
        // into; last pushed decorator sees the bytes last.
        let buffered = Arc::new(Mutex::new(BytesMut::new()));
        let mut sink = PayloadSink::new(BufferWriter {
            buf: buffered.clone(),
        });
        for decorate in request.payload_writers.drain(..) {
            sink = decorate(sink);
        }
        loop {
            match request.payload.read().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = sink.write(chunk).await {
                        sink.complete(Some(e.clone()));
                        return fail_invocation(&mut request, e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    sink.complete(Some(e.clone()));
                    request.retry_hint.set(RetryPolicy::Immediately);
                    return fail_invocation(&mut request, e);
                }
            }
        }
        sink.complete(None);
        let payload_bytes = buffered.lock().split().freeze();

        let oneway = request.oneway;
        let opened = if oneway {
            shared.transport.open_unidirectional().await
        } else {
            shared.transport.open_bidirectional().await
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                request.retry_hint.set(RetryPolicy::Immediately);
                return fail_invocation(&mut request, e);
            }
        };
        let (writer, reader) = stream.into_halves();
        let Some(mut writer) = writer else {
            return fail_invocation(&mut request, Error::transport("stream without send half"));
        };

        // Header, then main payload, in one ordered write.
        let mut buf = Vec::with_capacity(header_bytes.len() + payload_bytes.len() + 8);
        put_varuint62(&mut buf, header_bytes.len() as u64);
        buf.extend_from_slice(&header_bytes);
        put_varuint62(&mut buf, payload_bytes.len() as u64);
        buf.extend_from_slice(&payload_bytes);
        if let Err(e) = writer.write(Bytes::from(buf)).await {
            writer.reset();
            if request.idempotent {
                request.retry_hint.set(RetryPolicy::OtherReplica);
            }
            return fail_invocation(&mut request, e);
        }

        // Payload-stream bytes only after the main payload is fully written.
        match request.payload_stream.take() {
            Some(stream_payload) => {
                tokio::spawn(stream_payload_task(
                    stream_payload,
                    writer,
                    cancel.clone(),
                    shared.lifecycle.aborted(),
                ));
            }
            None => {
                let _ = writer.finish().await;
            }
        }

        if oneway {
            request.payload.complete(None);
            return Ok(oneway_response(&request));
        }

        let Some(reader) = reader else {
            return fail_invocation(&mut request, Error::transport("stream without receive half"));
        };
        let mut response_reader = ChunkReader::new(reader);

        let aborted = shared.lifecycle.aborted();
        let deadline = deadline_expired(request.deadline);
        tokio::pin!(deadline);
        let local_limit = shared.local_max_header_size;

        let (response_header, response_payload) = {
            let read_response = async {
                let len = response_reader.read_varuint62().await?;
                if len > u64::from(local_limit) {
                    return Err(Error::Protocol(format!(
                        "response header of {len} bytes exceeds limit {local_limit}"
                    )));
                }
                let header_bytes = response_reader.read_exact(len as usize).await?;
                let header = decode_response_header(&header_bytes)?;
                let payload = response_reader
                    .read_exact(header.payload_size as usize)
                    .await?;
                Ok::<_, Error>((header, payload))
            };
            tokio::pin!(read_response);
            // An already-delivered response wins over a concurrent cancel
            // or abort.
            tokio::select! {
                biased;
                result = &mut read_response => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        if request.idempotent {
                            request.retry_hint.set(RetryPolicy::OtherReplica);
                        }
                        return fail_invocation(&mut request, e);
                    }
                },
                _ = cancel.cancelled() => {
                    return fail_invocation(&mut request, Error::Cancelled);
                }
                _ = &mut deadline => {
                    return fail_invocation(&mut request, Error::Cancelled);
                }
                _ = aborted.cancelled() => {
                    let err = shared.lifecycle.abort_reason();
                    return fail_invocation(&mut request, err);
                }
            }
        };

        // The response is the peer's acknowledgement of the request payload.
        request.payload.complete(None);
        Ok(IncomingResponse {
            result_type: response_header.result_type,
            encoding: response_header.encoding,
            fields: response_header.fields,
            payload: PayloadSource::from_bytes(response_payload),
            payload_stream: Some(PayloadSource::new(StreamPayloadReader {
                reader: response_reader,
            })),
        })
    }

    /// Transition to ShuttingDown, announce GoAway, drain in-flight work,
    /// finish the control stream, and close the transport.
    pub async fn shutdown(&self, reason: &str, cancel: CancellationToken) -> Result<(), Error> {
        let shared = &self.shared;
        if !shared.lifecycle.begin_shutdown() {
            return Ok(());
        }
        debug!(reason, "shutting down connection");

        {
            let mut slot = shared.control_send.lock().await;
            if let Some(writer) = slot.as_mut() {
                let _ = send_control_frame(writer, &encode_go_away(reason)).await;
            }
        }

        tokio::select! {
            biased;
            _ = shared.lifecycle.wait_idle() => {}
            _ = cancel.cancelled() => {
                shared.lifecycle.cancel_dispatches();
                shared.lifecycle.abort_invocations(Error::Cancelled);
            }
        }

        {
            let mut slot = shared.control_send.lock().await;
            if let Some(mut writer) = slot.take() {
                let _ = writer.finish().await;
            }
        }
        shared.lifecycle.close();
        shared.transport.close().await;
        Ok(())
    }

    /// Hard abort: fail everything in flight and close the transport.
    pub async fn dispose(&self) {
        let shared = &self.shared;
        shared.lifecycle.close();
        shared.lifecycle.cancel_dispatches();
        shared.lifecycle.abort_invocations(Error::Disposed);
        {
            // Dropped without finish: the peer observes a reset.
            let mut slot = shared.control_send.lock().await;
            slot.take();
        }
        shared.transport.close().await;
    }
}

/// Copy a payload stream onto the wire after the main payload, observing
/// caller cancellation and connection aborts.
async fn stream_payload_task<W: StreamWriter>(
    mut source: PayloadSource,
    mut writer: W,
    cancel: CancellationToken,
    aborted: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                writer.reset();
                source.complete(Some(Error::Cancelled));
                return;
            }
            _ = aborted.cancelled() => {
                writer.reset();
                source.complete(Some(Error::Cancelled));
                return;
            }
            next = source.read() => next,
        };
        match next {
            Ok(Some(chunk)) => {
                if let Err(e) = writer.write(chunk).await {
                    writer.reset();
                    source.complete(Some(e));
                    return;
                }
            }
            Ok(None) => {
                let result = writer.finish().await;
                source.complete(result.err());
                return;
            }
            Err(e) => {
                writer.reset();
                source.complete(Some(e));
                return;
            }
        }
    }
}

impl<M: MultiplexedConnection> IceRpcDriver<M> {
    /// Accept request streams and watch the control stream until the
    /// connection ends. Spawn this.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.run_loop().await;
        match &result {
            Ok(()) => self.shared.fail(Error::ConnectionClosed),
            Err(e) => {
                warn!(error = %e, "connection failed");
                self.shared.fail(e.clone());
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        let shared = self.shared.clone();
        let dispatcher = self.dispatcher.clone();
        let control_reader = &mut self.control_reader;
        let local_limit = shared.local_max_header_size;
        let mut control_done = false;
        loop {
            let control_active = !control_done;
            tokio::select! {
                accepted = shared.transport.accept_stream() => {
                    match accepted {
                        Ok(stream) => accept_dispatch(&shared, &dispatcher, stream),
                        Err(e) => {
                            // Expected once the connection is winding down.
                            return match shared.lifecycle.state() {
                                ConnectionState::Active => Err(e),
                                _ => Ok(()),
                            };
                        }
                    }
                }
                control = read_control_frame(&mut *control_reader, local_limit),
                    if control_active =>
                {
                    match control? {
                        Some(ControlFrame::GoAway(message)) => {
                            debug!(message, "peer initiated shutdown");
                            shared.lifecycle.notify_peer_shutdown(&message);
                        }
                        Some(ControlFrame::Initialize(_)) => {
                            return Err(Error::Protocol(
                                "unexpected initialize after setup".into(),
                            ));
                        }
                        None => {
                            debug!("peer control stream finished");
                            control_done = true;
                        }
                    }
                }
            }
        }
    }
}

/// Start a dispatch for an accepted stream, or refuse it once shutdown began.
fn accept_dispatch<M: MultiplexedConnection>(
    shared: &Arc<Shared<M>>,
    dispatcher: &Arc<dyn Dispatcher>,
    stream: StreamOf<M>,
) {
    let Some(guard) = shared.lifecycle.try_begin_dispatch() else {
        debug!(stream_id = stream.id(), "refusing stream while shutting down");
        let (writer, _reader) = stream.into_halves();
        if let Some(mut writer) = writer {
            writer.reset();
        }
        return;
    };
    let shared = shared.clone();
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        dispatch_stream(shared, dispatcher, stream, guard).await;
    });
}

async fn dispatch_stream<M: MultiplexedConnection>(
    shared: Arc<Shared<M>>,
    dispatcher: Arc<dyn Dispatcher>,
    stream: StreamOf<M>,
    guard: OpGuard,
) {
    let stream_id = stream.id();
    let (writer, reader) = stream.into_halves();
    let Some(reader) = reader else {
        debug!(stream_id, "stream without data, resetting");
        if let Some(mut writer) = writer {
            writer.reset();
        }
        return;
    };
    let oneway = writer.is_none();
    let mut request_reader = ChunkReader::new(reader);

    let decoded = async {
        let len = request_reader.read_varuint62().await?;
        if len > u64::from(shared.local_max_header_size) {
            return Err(Error::Protocol(format!(
                "request header of {len} bytes exceeds limit {}",
                shared.local_max_header_size
            )));
        }
        let header_bytes = request_reader.read_exact(len as usize).await?;
        let header = decode_request_header(&header_bytes)?;
        let payload_len = request_reader.read_varuint62().await?;
        let payload = request_reader.read_exact(payload_len as usize).await?;
        Ok::<_, Error>((header, payload))
    }
    .await;
    let (header, payload_bytes) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(stream_id, error = %e, "failed to decode request");
            if let Some(mut writer) = writer {
                writer.reset();
            }
            return;
        }
    };

    let mut features = Features::new();
    if let Some(bytes) = header.fields.get(&request_fields::CONTEXT)
        && let Ok(context) = decode_context_field(bytes)
    {
        features.insert(context);
    }

    let payload = PayloadSource::from_bytes(payload_bytes);
    let payload_completer = payload.completer();
    let incoming = IncomingRequest {
        path: header.path,
        operation: header.operation,
        idempotent: header.idempotent,
        oneway,
        deadline: header.deadline,
        fields: header.fields,
        features,
        payload,
        payload_stream: Some(PayloadSource::new(StreamPayloadReader {
            reader: request_reader,
        })),
    };

    let token = shared.lifecycle.dispatch_token();
    let result = dispatcher.dispatch(incoming, token).await;

    match (result, writer) {
        (Ok(response), Some(writer)) => {
            send_response(&shared, writer, response, &payload_completer).await;
        }
        (Ok(mut response), None) => {
            response.payload.complete(None);
            if let Some(mut stream) = response.payload_stream.take() {
                stream.complete(None);
            }
            payload_completer.complete(None);
        }
        (Err(e), Some(mut writer)) => {
            let exception = DispatchException::from_error(e);
            if let Err(write_err) = write_failure(&mut writer, &exception).await {
                debug!(stream_id, error = %write_err, "failed to write failure response");
                writer.reset();
            }
            payload_completer.complete(Some(Error::Dispatch(exception)));
        }
        (Err(e), None) => {
            debug!(stream_id, error = %e, "oneway dispatch failed");
            payload_completer.complete(Some(e));
        }
    }

    drop(guard);
}

async fn send_response<M: MultiplexedConnection>(
    shared: &Shared<M>,
    mut writer: WriterOf<M>,
    mut response: OutgoingResponse,
    request_completer: &Completer,
) {
    // Buffer and frame the payload first; failures here still turn into a
    // failure response rather than a torn stream.
    let encoded = match response.payload.read_to_end().await {
        Ok(payload_bytes) => {
            response.payload.complete(None);
            let header = ResponseHeader {
                result_type: response.result_type,
                encoding: Encoding::V2_0,
                fields: std::mem::take(&mut response.fields),
                payload_size: payload_bytes.len() as u64,
            };
            match header.encode() {
                Ok(header_bytes)
                    if header_bytes.len() as u64 <= u64::from(shared.peer_max_header_size) =>
                {
                    Ok((header_bytes, payload_bytes))
                }
                Ok(header_bytes) => Err(Error::InvalidArgument(format!(
                    "response header of {} bytes exceeds peer limit {}",
                    header_bytes.len(),
                    shared.peer_max_header_size
                ))),
                Err(e) => Err(e),
            }
        }
        Err(e) => {
            response.payload.complete(Some(e.clone()));
            Err(e)
        }
    };

    match encoded {
        Ok((header_bytes, payload_bytes)) => {
            let mut buf = Vec::with_capacity(header_bytes.len() + payload_bytes.len() + 8);
            put_varuint62(&mut buf, header_bytes.len() as u64);
            buf.extend_from_slice(&header_bytes);
            buf.extend_from_slice(&payload_bytes);
            match writer.write(Bytes::from(buf)).await {
                Ok(()) => {
                    let tail = match response.payload_stream.take() {
                        Some(stream) => {
                            stream_payload_tail(stream, &mut writer).await
                        }
                        None => writer.finish().await,
                    };
                    match tail {
                        Ok(()) => {
                            request_completer.complete(None);
                        }
                        Err(e) => {
                            request_completer.complete(Some(e));
                        }
                    }
                }
                Err(e) => {
                    writer.reset();
                    if let Some(mut stream) = response.payload_stream.take() {
                        stream.complete(Some(e.clone()));
                    }
                    request_completer.complete(Some(e));
                }
            }
        }
        Err(e) => {
            if let Some(mut stream) = response.payload_stream.take() {
                stream.complete(Some(e.clone()));
            }
            let exception = DispatchException::from_error(e.clone());
            let _ = write_failure(&mut writer, &exception).await;
            request_completer.complete(Some(e));
        }
    }
}

/// Stream the response's trailing payload, then finish the stream.
async fn stream_payload_tail<W: StreamWriter>(
    mut source: PayloadSource,
    writer: &mut W,
) -> Result<(), Error> {
    loop {
        match source.read().await {
            Ok(Some(chunk)) => {
                if let Err(e) = writer.write(chunk).await {
                    writer.reset();
                    source.complete(Some(e.clone()));
                    return Err(e);
                }
            }
            Ok(None) => {
                let result = writer.finish().await;
                source.complete(result.as_ref().err().cloned());
                return result;
            }
            Err(e) => {
                writer.reset();
                source.complete(Some(e.clone()));
                return Err(e);
            }
        }
    }
}

async fn write_failure<W: StreamWriter>(
    writer: &mut W,
    exception: &DispatchException,
) -> Result<(), Error> {
    let body = encode_dispatch_exception(exception);
    let header = ResponseHeader {
        result_type: ResultType::Failure,
        encoding: Encoding::V2_0,
        fields: OutgoingFields::new(),
        payload_size: body.len() as u64,
    };
    let header_bytes = header.encode()?;
    let mut buf = Vec::with_capacity(header_bytes.len() + body.len() + 8);
    put_varuint62(&mut buf, header_bytes.len() as u64);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&body);
    writer.write(Bytes::from(buf)).await?;
    writer.finish().await
}

/// Adapts the remainder of a stream into a payload source.
struct StreamPayloadReader<R: StreamReader> {
    reader: ChunkReader<R>,
}

impl<R: StreamReader> PayloadReader for StreamPayloadReader<R> {
    fn read(&mut self) -> ReadFuture<'_> {
        Box::pin(async move { self.reader.next_chunk().await })
    }
}

/// Collects decorated payload bytes before framing.
struct BufferWriter {
    buf: Arc<Mutex<BytesMut>>,
}

impl PayloadWriter for BufferWriter {
    fn write(&mut self, chunk: Bytes) -> WriteFuture<'_> {
        self.buf.lock().extend_from_slice(&chunk);
        Box::pin(async { Ok(()) })
    }
}

impl<M: MultiplexedConnection> Invoker for IceRpcConnection<M> {
    fn invoke(
        &self,
        request: OutgoingRequest,
        cancel: CancellationToken,
    ) -> floe_types::InvokeFuture<'_> {
        Box::pin(self.invoke(request, cancel))
    }
}
