//! Connection lifecycle scenarios against an in-memory gateway.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use pinchy_client::{CallError, GatewayClient};
use pinchy_core::{ClientConfig, ConnectionStatus, Frame, Payload};
use pinchy_transport::{
    Connection, Connector, TransportError,
    memory::{MemoryConnector, MemoryListener, MemoryPeer, memory_pair},
};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};

fn obj(v: Value) -> Payload {
    match v {
        Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

fn setup(config: ClientConfig) -> (GatewayClient, MemoryConnector, MemoryListener) {
    let (connector, listener) = memory_pair();
    let client = GatewayClient::new(config, Arc::new(connector.clone()));
    (client, connector, listener)
}

fn default_config() -> ClientConfig {
    ClientConfig::new("ws://gateway.test", "secret")
}

async fn wait_for_status(client: &GatewayClient, status: ConnectionStatus) {
    let mut rx = client.status_receiver();
    rx.wait_for(|s| *s == status).await.unwrap();
}

/// Play the server side of the handshake and return the `connect` params.
async fn accept_handshake(peer: &mut MemoryPeer) -> Payload {
    peer.send_frame(&Frame::event("connect.challenge", obj(json!({"nonce": "n-1"}))));
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected connect request");
    };
    assert_eq!(req.method, "connect");
    peer.send_frame(&Frame::ok(
        req.id,
        obj(json!({"type": "hello-ok", "protocol": 3, "policy": {"maxPayload": 2_097_152}})),
    ));
    req.params
}

async fn connected(config: ClientConfig) -> (GatewayClient, MemoryConnector, MemoryListener, MemoryPeer) {
    let (client, connector, mut listener) = setup(config);
    client.connect();
    let mut peer = listener.accept().await.unwrap();
    accept_handshake(&mut peer).await;
    wait_for_status(&client, ConnectionStatus::Connected).await;
    (client, connector, listener, peer)
}

#[tokio::test(start_paused = true)]
async fn test_handshake_success() {
    let (client, _connector, mut listener) = setup(default_config());
    let mut seen = client.status_receiver();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);

    client.connect();
    let mut peer = listener.accept().await.unwrap();
    assert_eq!(peer.url(), "ws://gateway.test/?token=secret");
    seen.wait_for(|s| *s == ConnectionStatus::Handshaking)
        .await
        .unwrap();

    let params = accept_handshake(&mut peer).await;
    assert_eq!(params["role"], "operator");
    assert_eq!(params["scopes"], json!(["operator.read", "operator.write"]));
    assert_eq!(params["auth"]["token"], "secret");
    assert_eq!(params["client"]["id"], "pinchy-desktop");
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);

    wait_for_status(&client, ConnectionStatus::Connected).await;
    assert_eq!(client.retry_count(), 0);
    assert_eq!(client.hello().unwrap().protocol, 3);
    assert_eq!(client.max_payload(), 2_097_152);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_call_not_connected_does_not_touch_socket() {
    let (client, _connector, mut listener) = setup(default_config());
    client.connect();
    let mut peer = listener.accept().await.unwrap();
    wait_for_status(&client, ConnectionStatus::Handshaking).await;

    let err = client
        .call("chat.history", Payload::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::NotConnected {
            status: ConnectionStatus::Handshaking,
            ..
        }
    ));
    assert_eq!(client.pending_count(), 0);

    // Only the handshake goes out once the challenge arrives.
    let params = accept_handshake(&mut peer).await;
    assert_eq!(params["role"], "operator");
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_and_clears_pending() {
    let (client, _connector, _listener, mut peer) = connected(default_config()).await;

    let caller = client.clone();
    let started = Instant::now();
    let call = tokio::spawn(async move {
        caller
            .call_with_timeout(
                "chat.history",
                obj(json!({"sessionKey": "agent:main:main"})),
                Duration::from_millis(30),
            )
            .await
    });

    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected request");
    };
    assert!(client.is_pending(&req.id));

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Request \"chat.history\" timed out after 30ms");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(30));
    assert!(elapsed < Duration::from_millis(40));
    assert!(!client.is_pending(&req.id));
    assert_eq!(client.pending_count(), 0);

    // The late response is dropped without disturbing the connection.
    peer.send_frame(&Frame::ok(req.id, Payload::new()));
    tokio::task::yield_now().await;
    assert_eq!(client.status(), ConnectionStatus::Connected);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_call_leaves_no_pending_entry() {
    let (client, _connector, _listener, mut peer) = connected(default_config()).await;

    tokio::select! {
        _ = client.call("chat.history", Payload::new()) => panic!("no response was sent"),
        () = tokio::time::sleep(Duration::from_millis(10)) => {}
    }
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected request");
    };
    assert_eq!(client.pending_count(), 0);
    assert!(!client.is_pending(&req.id));

    // The late response is unmatched and harmless.
    peer.send_frame(&Frame::ok(req.id, Payload::new()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.status(), ConnectionStatus::Connected);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_response_leaves_other_calls() {
    let (client, _connector, _listener, mut peer) = connected(default_config()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("sessions.list", Payload::new()).await });
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected request");
    };

    peer.send_frame(&Frame::ok("pd-9999", Payload::new()));
    peer.send_text("{not json");
    peer.send_text(r#"{"type":"mystery"}"#);
    peer.send_frame(&Frame::ok(req.id, obj(json!({"sessions": []}))));

    let payload = tokio_test::assert_ok!(call.await.unwrap());
    assert_eq!(payload["sessions"], json!([]));
    assert_eq!(client.status(), ConnectionStatus::Connected);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_response_carries_message() {
    let (client, _connector, _listener, mut peer) = connected(default_config()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("chat.send", Payload::new()).await });
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected request");
    };
    peer.send_frame(&Frame::err(req.id, Some("INVALID".into()), "sessionKey required"));

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        CallError::Rejected {
            code: Some("INVALID".into()),
            message: "sessionKey required".into()
        }
    );
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_typed_request() {
    use pinchy_core::protocol::{ChatAbort, ChatAbortParams};

    let (client, _connector, _listener, mut peer) = connected(default_config()).await;
    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller
            .request::<ChatAbort>(&ChatAbortParams {
                session_key: "agent:main:main".into(),
            })
            .await
    });

    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected request");
    };
    assert_eq!(req.method, "chat.abort");
    assert_eq!(req.params["sessionKey"], "agent:main:main");
    peer.send_frame(&Frame::ok(
        req.id,
        obj(json!({"ok": true, "aborted": true, "runIds": ["run-1"]})),
    ));

    let res = call.await.unwrap().unwrap();
    assert!(res.aborted);
    assert_eq!(res.run_ids, Some(vec!["run-1".to_string()]));
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_rejects_pending_and_reconnects() {
    let (client, connector, mut listener, mut peer) = connected(default_config()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("chat.history", Payload::new()).await });
    let Some(Frame::Request(_)) = peer.recv_frame().await else {
        panic!("expected request");
    };

    peer.close(1006, "abnormal");
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::ConnectionLost(_)));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.status(), ConnectionStatus::Connecting);
    assert_eq!(client.retry_count(), 1);

    let mut peer = listener.accept().await.unwrap();
    assert_eq!(connector.attempts().len(), 2);
    accept_handshake(&mut peer).await;
    wait_for_status(&client, ConnectionStatus::Connected).await;
    assert_eq!(client.retry_count(), 0);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_bad_hello_enters_error_and_closes() {
    // No retries, so the error status is where it rests.
    let mut config = default_config();
    config.max_retries = 0;
    let (client, connector, mut listener) = setup(config);
    let mut seen = client.status_receiver();
    client.connect();
    let mut peer = listener.accept().await.unwrap();

    peer.send_frame(&Frame::event("connect.challenge", Payload::new()));
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected connect request");
    };
    peer.send_frame(&Frame::ok(req.id, obj(json!({"type": "nope"}))));

    seen.wait_for(|s| *s == ConnectionStatus::Error).await.unwrap();
    // Forced close from the client side.
    assert_eq!(peer.recv_text().await, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.status(), ConnectionStatus::Error);
    assert_eq!(connector.attempts().len(), 1);
    assert!(client.hello().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_enters_error() {
    let mut config = default_config();
    config.request_timeout_ms = 50;
    config.max_retries = 0;
    let (client, _connector, mut listener) = setup(config);
    let mut seen = client.status_receiver();
    client.connect();
    let mut peer = listener.accept().await.unwrap();

    peer.send_frame(&Frame::event("connect.challenge", Payload::new()));
    let Some(Frame::Request(_)) = peer.recv_frame().await else {
        panic!("expected connect request");
    };
    seen.wait_for(|s| *s == ConnectionStatus::Error).await.unwrap();
    assert_eq!(peer.recv_text().await, None);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_pending_and_stops_reconnecting() {
    let (client, connector, _listener, mut peer) = connected(default_config()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("chat.history", Payload::new()).await });
    let Some(Frame::Request(_)) = peer.recv_frame().await else {
        panic!("expected request");
    };

    client.disconnect();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        call.await.unwrap().unwrap_err(),
        CallError::ConnectionLost(_)
    ));
    assert_eq!(peer.recv_text().await, None);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_hello_after_disconnect_does_not_connect() {
    let (client, connector, mut listener) = setup(default_config());
    client.connect();
    let mut peer = listener.accept().await.unwrap();
    peer.send_frame(&Frame::event("connect.challenge", Payload::new()));
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected connect request");
    };

    // hello-ok is already queued when the user disconnects.
    peer.send_frame(&Frame::ok(
        req.id,
        obj(json!({"type": "hello-ok", "protocol": 3})),
    ));
    client.disconnect();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(client.hello().is_none());
    assert_eq!(client.pending_count(), 0);
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_events_fan_out_except_challenge() {
    let (client, _connector, _listener, peer) = connected(default_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let tx_a = tx.clone();
    let _a = client.subscribe("chat", move |payload| {
        tx_a.send(format!("a:{}", payload["seq"])).ok();
        Ok(())
    });
    let _failing = client.subscribe("chat", |_| Err("subscriber failed".into()));
    let tx_b = tx.clone();
    let _b = client.subscribe("chat", move |payload| {
        tx_b.send(format!("b:{}", payload["seq"])).ok();
        Ok(())
    });
    let tx_all = tx;
    let _all = client.subscribe_all(move |event, _| {
        tx_all.send(format!("all:{event}")).ok();
        Ok(())
    });

    peer.send_frame(&Frame::event("connect.challenge", Payload::new()));
    peer.send_frame(&Frame::event("tick", Payload::new()));
    peer.send_frame(&Frame::event("chat", obj(json!({"seq": 1}))));

    let mut got = Vec::new();
    for _ in 0..4 {
        got.push(rx.recv().await.unwrap());
    }
    got.sort();
    assert_eq!(got, ["a:1", "all:chat", "all:tick", "b:1"]);
    assert!(rx.try_recv().is_err());
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery() {
    let (client, _connector, _listener, peer) = connected(default_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
    let sub = client.subscribe("agent", move |payload| {
        tx.send(payload["n"].as_u64().unwrap_or_default()).ok();
        Ok(())
    });
    peer.send_frame(&Frame::event("agent", obj(json!({"n": 1}))));
    assert_eq!(rx.recv().await, Some(1));

    sub.unsubscribe();
    peer.send_frame(&Frame::event("agent", obj(json!({"n": 2}))));
    // Closes the channel once the callback is dropped.
    assert_eq!(rx.recv().await, None);
    client.disconnect();
}

/// Opens sockets that close straight away and records when each attempt began.
#[derive(Default)]
struct ClosingConnector {
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Connector for ClosingConnector {
    async fn connect(&self, _url: &str) -> Result<Connection, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let (outbound, _server_rx) = mpsc::unbounded_channel();
        let (_server_tx, inbound) = mpsc::unbounded_channel();
        Ok(Connection { outbound, inbound })
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhaust_into_error() {
    let mut config = default_config();
    config.max_retries = 5;
    config.base_delay_ms = 100;
    config.max_delay_ms = 400;

    let connector = Arc::new(ClosingConnector::default());
    let client = GatewayClient::new(config, connector.clone());
    client.connect();
    wait_for_status(&client, ConnectionStatus::Error).await;

    let attempts = connector.attempts.lock().unwrap().clone();
    // The initial attempt plus exactly five reconnects.
    assert_eq!(attempts.len(), 6);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [100, 200, 400, 400, 400].map(Duration::from_millis);
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(*gap >= want, "gap {gap:?} shorter than {want:?}");
        assert!(*gap < want + Duration::from_millis(50));
    }
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));

    // Stays in error; no further attempts.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts.lock().unwrap().len(), 6);
    assert_eq!(client.status(), ConnectionStatus::Error);

    // An explicit connect starts the cycle again.
    client.connect();
    assert_eq!(client.retry_count(), 0);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(connector.attempts.lock().unwrap().len() > 6);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_schedules_reconnect() {
    let (client, connector, mut listener) = setup(default_config());
    connector.set_refuse(true);
    client.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.status(), ConnectionStatus::Connecting);
    assert_eq!(client.retry_count(), 1);

    connector.set_refuse(false);
    let mut peer = listener.accept().await.unwrap();
    accept_handshake(&mut peer).await;
    wait_for_status(&client, ConnectionStatus::Connected).await;
    assert_eq!(connector.attempts().len(), 2);
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_independent_clients() {
    let (a, _ca, mut la) = setup(default_config());
    let (b, _cb, _lb) = setup(ClientConfig::new("ws://other.test", "t2"));
    a.connect();
    let mut peer = la.accept().await.unwrap();
    accept_handshake(&mut peer).await;
    wait_for_status(&a, ConnectionStatus::Connected).await;
    assert_eq!(b.status(), ConnectionStatus::Disconnected);
    a.disconnect();
}
