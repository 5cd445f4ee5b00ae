//! Scripted gateway for session tests.

#![allow(dead_code)]

use std::sync::Arc;

use pinchy_client::GatewayClient;
use pinchy_core::{ClientConfig, Frame, Payload, RequestFrame};
use pinchy_transport::memory::{MemoryListener, MemoryPeer, memory_pair};
use serde_json::{Value, json};

pub const MAIN: &str = "agent:main:main";

pub fn obj(v: Value) -> Payload {
    match v {
        Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

/// A client that has not connected yet, plus the listener its sockets land on.
pub fn client() -> (GatewayClient, MemoryListener) {
    let (connector, listener) = memory_pair();
    let client = GatewayClient::new(
        ClientConfig::new("ws://gateway.test", "secret"),
        Arc::new(connector),
    );
    (client, listener)
}

pub struct Gateway {
    pub peer: MemoryPeer,
    pub listener: MemoryListener,
}

/// Connect `client` and complete the handshake.
pub async fn connect(client: &GatewayClient, mut listener: MemoryListener) -> Gateway {
    client.connect();
    let mut peer = listener.accept().await.expect("client connects");
    peer.send_frame(&Frame::event("connect.challenge", Payload::new()));
    let Some(Frame::Request(req)) = peer.recv_frame().await else {
        panic!("expected connect request");
    };
    assert_eq!(req.method, "connect");
    peer.send_frame(&Frame::ok(
        req.id,
        obj(json!({"type": "hello-ok", "protocol": 3, "policy": {"maxPayload": 2_097_152}})),
    ));
    client
        .status_receiver()
        .wait_for(|s| s.is_connected())
        .await
        .unwrap();
    Gateway { peer, listener }
}

impl Gateway {
    /// Next request for `method`; anything else is answered with an empty
    /// default on the way.
    pub async fn next_request(&mut self, method: &str) -> RequestFrame {
        loop {
            let Some(Frame::Request(req)) = self.peer.recv_frame().await else {
                panic!("client went away while waiting for {method}");
            };
            if req.method == method {
                return req;
            }
            self.answer_default(&req);
        }
    }

    /// Answer the requests issued on connect: `sessions.list` (empty) and,
    /// when `history` is given, `chat.history`.
    pub async fn settle(&mut self, history: Option<Value>) {
        let mut expected = vec!["sessions.list"];
        if history.is_some() {
            expected.push("chat.history");
        }
        while !expected.is_empty() {
            let Some(Frame::Request(req)) = self.peer.recv_frame().await else {
                panic!("client went away during setup");
            };
            expected.retain(|m| *m != req.method);
            match (&history, req.method.as_str()) {
                (Some(messages), "chat.history") => self.reply(
                    &req,
                    json!({"sessionKey": req.params["sessionKey"], "messages": messages}),
                ),
                _ => self.answer_default(&req),
            }
        }
    }

    pub fn answer_default(&self, req: &RequestFrame) {
        let payload = match req.method.as_str() {
            "sessions.list" => json!({"sessions": []}),
            "chat.history" => json!({"sessionKey": req.params["sessionKey"], "messages": []}),
            _ => json!({}),
        };
        self.reply(req, payload);
    }

    pub fn reply(&self, req: &RequestFrame, payload: Value) {
        self.peer.send_frame(&Frame::ok(req.id.clone(), obj(payload)));
    }

    pub fn reject(&self, req: &RequestFrame, message: &str) {
        self.peer
            .send_frame(&Frame::err(req.id.clone(), None, message));
    }

    pub fn chat_event(&self, payload: Value) {
        self.peer.send_frame(&Frame::event("chat", obj(payload)));
    }
}

pub fn delta(session: &str, run: &str, seq: u64, text: &str) -> Value {
    json!({
        "runId": run,
        "sessionKey": session,
        "seq": seq,
        "state": "delta",
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
    })
}

pub fn final_event(session: &str, run: &str, seq: u64, text: &str) -> Value {
    json!({
        "runId": run,
        "sessionKey": session,
        "seq": seq,
        "state": "final",
        "message": {
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "timestamp": 1_767_225_600_000_u64
        }
    })
}
