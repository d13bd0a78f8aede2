//! Multiplexed protocol connection tests over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use floe::connection::icerpc::{self, IceRpcConnection, IceRpcConnectionOptions};
use floe::transport::mem::{self, MemConnection};
use floe::{
    DispatchErrorCode, DispatchFn, Dispatcher, Error, IncomingRequest, NotFoundDispatcher,
    OutgoingFieldValue, OutgoingRequest, OutgoingResponse, PayloadSource, Protocol, Proxy,
    ResultType,
};
use floe_types::connection_fields::MAX_HEADER_SIZE;
use floe_wire::fields::{decode_varuint_field, varuint_field};
use floe_wire::icerpc::decode_dispatch_exception;

type TestConnection = IceRpcConnection<MemConnection>;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connected_pair_with_options(
    client_options: IceRpcConnectionOptions,
    server_options: IceRpcConnectionOptions,
    dispatcher: Arc<dyn Dispatcher>,
) -> (TestConnection, TestConnection) {
    init_tracing();
    let (client_transport, server_transport) = mem::pair();
    let connect = icerpc::connect(
        client_transport,
        client_options,
        Arc::new(NotFoundDispatcher),
    );
    let accept = icerpc::accept(server_transport, server_options, dispatcher);
    let (connected, accepted) = tokio::join!(connect, accept);
    let (client, client_driver) = connected.unwrap();
    let (server, server_driver) = accepted.unwrap();
    tokio::spawn(client_driver.run());
    tokio::spawn(server_driver.run());
    (client, server)
}

async fn connected_pair(dispatcher: Arc<dyn Dispatcher>) -> (TestConnection, TestConnection) {
    connected_pair_with_options(
        IceRpcConnectionOptions::default(),
        IceRpcConnectionOptions::default(),
        dispatcher,
    )
    .await
}

fn echo_dispatcher() -> Arc<dyn Dispatcher> {
    Arc::new(DispatchFn(|mut request: IncomingRequest, _cancel| {
        async move {
            let mut bytes = request.payload.read_to_end().await?.to_vec();
            request.payload.complete(None);
            if let Some(mut stream) = request.payload_stream.take() {
                bytes.extend_from_slice(&stream.read_to_end().await?);
                stream.complete(None);
            }
            Ok(OutgoingResponse::success(PayloadSource::from_bytes(bytes)))
        }
    }))
}

fn request(path: &str, payload: &[u8]) -> OutgoingRequest {
    let proxy = Proxy::new(Protocol::IceRpc, path).unwrap();
    OutgoingRequest::new(proxy, "op")
        .with_payload(PayloadSource::from_bytes(Bytes::copy_from_slice(payload)))
}

#[tokio::test]
async fn twoway_echo_roundtrip() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;

    let request = request("/echo", b"hello over icerpc");
    let completed = request.payload.completed();
    let mut response = client
        .invoke(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.result_type, ResultType::Success);
    assert_eq!(
        response.payload.read_to_end().await.unwrap().as_ref(),
        b"hello over icerpc"
    );
    response.payload.complete(None);
    assert!(completed.wait().await.is_none());
}

#[tokio::test]
async fn payload_stream_bytes_follow_the_main_payload() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;

    let mut outgoing = request("/echo", b"head:");
    outgoing.payload_stream = Some(PayloadSource::from_bytes(&b"tail"[..]));
    let stream_completed = outgoing.payload_stream.as_ref().unwrap().completed();

    let mut response = client
        .invoke(outgoing, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        response.payload.read_to_end().await.unwrap().as_ref(),
        b"head:tail"
    );
    response.payload.complete(None);
    assert!(stream_completed.wait().await.is_none());
}

#[tokio::test]
async fn oneway_completes_payload_with_success() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;

    let mut outgoing = request("/echo", b"");
    outgoing.oneway = true;
    let completed = outgoing.payload.completed();
    let response = client
        .invoke(outgoing, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.result_type, ResultType::Success);
    assert!(completed.wait().await.is_none());
}

#[tokio::test]
async fn failing_fields_encoder_completes_payload_with_its_cause() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;

    let mut outgoing = request("/echo", b"payload");
    outgoing.fields.insert(
        5,
        OutgoingFieldValue::Encoder(Box::new(|_| {
            Err(Error::InvalidArgument("invalid request fields".into()))
        })),
    );
    let completed = outgoing.payload.completed();
    let result = client.invoke(outgoing, CancellationToken::new()).await;

    match result {
        Err(Error::InvalidArgument(msg)) => assert!(msg.contains("invalid request fields")),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
    match completed.wait().await {
        Some(Error::InvalidArgument(msg)) => assert!(msg.contains("invalid request fields")),
        other => panic!("expected InvalidArgument cause, got {other:?}"),
    }
}

#[tokio::test]
async fn invoke_on_shut_down_connection_fails() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;
    client
        .shutdown("", CancellationToken::new())
        .await
        .unwrap();

    let outgoing = request("/echo", b"late");
    let completed = outgoing.payload.completed();
    let result = client.invoke(outgoing, CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert!(matches!(
        completed.wait().await,
        Some(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let started = Arc::new(tokio::sync::Notify::new());
    let handler_gate = gate.clone();
    let handler_started = started.clone();
    let dispatcher = Arc::new(DispatchFn(move |mut request: IncomingRequest, _cancel| {
        let gate = handler_gate.clone();
        let started = handler_started.clone();
        async move {
            started.notify_one();
            let _permit = gate.acquire().await.unwrap();
            request.payload.complete(None);
            Ok::<_, Error>(OutgoingResponse::success(PayloadSource::empty()))
        }
    }));
    let (client, server) = connected_pair(dispatcher).await;

    let started_wait = started.notified();
    let invoking = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .invoke(request("/slow", b""), CancellationToken::new())
                .await
        })
    };
    started_wait.await;
    assert!(server.has_dispatches_in_progress());

    let shutting_down = {
        let server = server.clone();
        tokio::spawn(async move { server.shutdown("draining", CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutting_down.is_finished());
    assert!(!invoking.is_finished());

    gate.add_permits(1);
    let response = invoking.await.unwrap().unwrap();
    assert_eq!(response.result_type, ResultType::Success);
    shutting_down.await.unwrap().unwrap();
    assert!(!server.has_dispatches_in_progress());
    assert!(!server.has_invocations_in_progress());
}

#[tokio::test]
async fn cancelled_shutdown_aborts_pending_invocations() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let handler_gate = gate.clone();
    let dispatcher = Arc::new(DispatchFn(move |mut request: IncomingRequest, _cancel| {
        let gate = handler_gate.clone();
        request.payload.complete(None);
        async move {
            let _permit = gate.acquire().await.unwrap();
            Ok::<_, Error>(OutgoingResponse::success(PayloadSource::empty()))
        }
    }));
    let (client, _server) = connected_pair(dispatcher).await;

    let outgoing = request("/slow", b"");
    let completed = outgoing.payload.completed();
    let invoking = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke(outgoing, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pre_cancelled = CancellationToken::new();
    pre_cancelled.cancel();
    client.shutdown("now", pre_cancelled).await.unwrap();

    assert!(matches!(invoking.await.unwrap(), Err(Error::Cancelled)));
    assert!(matches!(completed.wait().await, Some(Error::Cancelled)));
    gate.add_permits(1);
}

#[tokio::test]
async fn cancelled_shutdown_propagates_to_dispatch_tokens() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let token_slot: Arc<std::sync::Mutex<Option<CancellationToken>>> =
        Arc::new(std::sync::Mutex::new(None));
    let handler_gate = gate.clone();
    let handler_slot = token_slot.clone();
    let dispatcher = Arc::new(DispatchFn(move |mut request: IncomingRequest, cancel| {
        let gate = handler_gate.clone();
        *handler_slot.lock().unwrap() = Some(cancel);
        request.payload.complete(None);
        async move {
            let _permit = gate.acquire().await.unwrap();
            Ok::<_, Error>(OutgoingResponse::success(PayloadSource::empty()))
        }
    }));
    let (client, server) = connected_pair(dispatcher).await;

    let invoking = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .invoke(request("/slow", b""), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let dispatch_token = token_slot
        .lock()
        .unwrap()
        .clone()
        .expect("dispatch should have started");
    assert!(!dispatch_token.is_cancelled());

    let pre_cancelled = CancellationToken::new();
    pre_cancelled.cancel();
    server.shutdown("abort", pre_cancelled).await.unwrap();
    assert!(dispatch_token.is_cancelled());

    gate.add_permits(1);
    let _ = invoking.await.unwrap();
}

#[tokio::test]
async fn initialize_fields_are_exchanged_and_surfaced() {
    let client_options = IceRpcConnectionOptions {
        max_header_size: 34,
        fields: {
            let mut fields = floe_types::OutgoingFields::new();
            fields.insert(10, varuint_field(38));
            fields
        },
    };
    let server_options = IceRpcConnectionOptions {
        max_header_size: 56,
        fields: floe_types::OutgoingFields::new(),
    };
    let (client, server) =
        connected_pair_with_options(client_options, server_options, echo_dispatcher()).await;

    let client_view = client.peer_fields();
    assert_eq!(client_view.len(), 1);
    assert_eq!(
        decode_varuint_field(&client_view[&MAX_HEADER_SIZE]).unwrap(),
        56
    );

    let server_view = server.peer_fields();
    assert_eq!(server_view.len(), 2);
    assert_eq!(
        decode_varuint_field(&server_view[&MAX_HEADER_SIZE]).unwrap(),
        34
    );
    assert_eq!(decode_varuint_field(&server_view[&10]).unwrap(), 38);
}

#[tokio::test]
async fn dispatch_exceptions_map_to_failure_responses() {
    let dispatcher = Arc::new(DispatchFn(|mut request: IncomingRequest, _cancel| {
        let op = request.operation.clone();
        request.payload.complete(None);
        async move {
            match op.as_str() {
                "bad-data" => Err::<OutgoingResponse, _>(Error::InvalidData(
                    "malformed body".into(),
                )),
                _ => Err(Error::transport("handler exploded")),
            }
        }
    }));
    let (client, _server) = connected_pair(dispatcher).await;

    let mut outgoing = request("/svc", b"");
    outgoing.operation = "bad-data".into();
    let mut response = client
        .invoke(outgoing, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.result_type, ResultType::Failure);
    let payload = response.payload.read_to_end().await.unwrap();
    response.payload.complete(None);
    let exception = decode_dispatch_exception(&payload).unwrap();
    assert_eq!(exception.code, DispatchErrorCode::InvalidData);

    let mut outgoing = request("/svc", b"");
    outgoing.operation = "explode".into();
    let mut response = client
        .invoke(outgoing, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.result_type, ResultType::Failure);
    let payload = response.payload.read_to_end().await.unwrap();
    response.payload.complete(None);
    let exception = decode_dispatch_exception(&payload).unwrap();
    assert_eq!(exception.code, DispatchErrorCode::UnhandledException);
}

#[tokio::test]
async fn failures_before_send_are_marked_retryable() {
    let (client, _server) = connected_pair(echo_dispatcher()).await;
    client
        .shutdown("", CancellationToken::new())
        .await
        .unwrap();

    let outgoing = request("/echo", b"");
    let hint = outgoing.retry_hint.clone();
    let _ = client.invoke(outgoing, CancellationToken::new()).await;
    assert_eq!(hint.get(), floe::RetryPolicy::Immediately);
}

#[tokio::test]
async fn go_away_triggers_peer_shutdown_callback() {
    let (client, server) = connected_pair(echo_dispatcher()).await;

    let (notified_tx, notified_rx) = tokio::sync::oneshot::channel();
    server.on_peer_shutdown(move |message| {
        let _ = notified_tx.send(message.to_owned());
    });

    client
        .shutdown("moving on", CancellationToken::new())
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(1), notified_rx)
        .await
        .expect("peer shutdown callback should fire")
        .unwrap();
    assert_eq!(message, "moving on");
}

#[tokio::test]
async fn expired_deadline_cancels_the_invocation() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let handler_gate = gate.clone();
    let dispatcher = Arc::new(DispatchFn(move |mut request: IncomingRequest, _cancel| {
        let gate = handler_gate.clone();
        request.payload.complete(None);
        async move {
            let _permit = gate.acquire().await.unwrap();
            Ok::<_, Error>(OutgoingResponse::success(PayloadSource::empty()))
        }
    }));
    let (client, _server) = connected_pair(dispatcher).await;

    let mut outgoing = request("/slow", b"");
    outgoing.deadline = floe::Deadline::after(Duration::from_millis(30));
    let completed = outgoing.payload.completed();
    let result = client.invoke(outgoing, CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(matches!(completed.wait().await, Some(Error::Cancelled)));
    gate.add_permits(1);
}
