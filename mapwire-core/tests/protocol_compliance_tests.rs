// Frame-level protocol behavior, driven over a raw transport end: literal
// push/pull/resolve exchanges, forbidden-key filtering, release handling,
// and the error conditions that abort a session.

use async_trait::async_trait;
use bytes::Bytes;
use mapwire_core::protocol::{parse_frame, Message, Transport};
use mapwire_core::{channel_transport, ChannelTransport, RpcError, RpcSession, RpcTarget, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct TestApi;

#[async_trait]
impl RpcTarget for TestApi {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "add" => {
                let mut total = 0;
                for arg in &args {
                    if let Value::Number(n) = arg {
                        total += n.as_i64().unwrap_or(0);
                    }
                }
                Ok(Value::from(total))
            }
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Undefined)),
            _ => Err(RpcError::target(format!("no such method: {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "foo" => Ok(Value::from(42i64)),
            _ => Err(RpcError::path(format!("no such property: {}", property))),
        }
    }
}

/// A session under test plus the raw peer end of its transport.
struct Harness {
    wire: ChannelTransport,
    _session: Arc<RpcSession>,
}

impl Harness {
    fn start() -> Self {
        let (wire, session_end) = channel_transport();
        let session = Arc::new(RpcSession::new(Arc::new(TestApi)));
        {
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.run(session_end).await;
            });
        }
        Harness {
            wire,
            _session: session,
        }
    }

    async fn send_raw(&mut self, frame: &str) {
        self.wire
            .send(Bytes::from(frame.to_string()))
            .await
            .unwrap();
    }

    async fn send(&mut self, frame: serde_json::Value) {
        self.send_raw(&frame.to_string()).await;
    }

    async fn recv(&mut self) -> Message {
        let bytes = tokio::time::timeout(Duration::from_secs(5), self.wire.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("transport closed");
        parse_frame(&bytes).unwrap()
    }
}

#[tokio::test]
async fn test_property_pull_exchange() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, ["pipeline", 0, ["foo"]]])).await;
    h.send(json!(["pull", 1])).await;

    let reply = h.recv().await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!(["resolve", 1, 42])
    );
}

#[tokio::test]
async fn test_pipelined_call_exchange() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, ["pipeline", 0, ["add"], [5, 3]]]))
        .await;
    h.send(json!(["pull", 1])).await;

    let reply = h.recv().await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!(["resolve", 1, 8])
    );
}

#[tokio::test]
async fn test_pull_of_literal_push() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, {"x": [1, 2, 3]}])).await;
    h.send(json!(["pull", 1])).await;

    let reply = h.recv().await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!(["resolve", 1, {"x": [1, 2, 3]}])
    );
}

#[tokio::test]
async fn test_forbidden_keys_are_dropped() {
    let mut h = Harness::start();

    h.send(json!([
        "push",
        1,
        ["pipeline", 0, ["echo"], [{"__proto__": {"x": 1}, "y": 2}]]
    ]))
    .await;
    h.send(json!(["pull", 1])).await;

    let reply = h.recv().await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!(["resolve", 1, {"y": 2}])
    );
}

#[tokio::test]
async fn test_target_error_is_rejected_not_fatal() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, ["pipeline", 0, ["nope"], []]]))
        .await;
    h.send(json!(["pull", 1])).await;

    let reply = h.recv().await;
    match &reply {
        Message::Reject(id, _) => assert_eq!(id.0, 1),
        other => panic!("expected reject, got {:?}", other),
    }

    // The session is still alive.
    h.send(json!(["push", 2, ["pipeline", 0, ["foo"]]])).await;
    h.send(json!(["pull", 2])).await;
    assert_eq!(
        serde_json::to_value(&h.recv().await).unwrap(),
        json!(["resolve", 2, 42])
    );
}

#[tokio::test]
async fn test_resolution_consumes_one_reference() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, ["pipeline", 0, ["foo"]]])).await;
    h.send(json!(["pull", 1])).await;
    let _ = h.recv().await; // resolve(1, 42)

    // The entry was released by its resolution; referencing it again is a
    // protocol violation.
    h.send(json!(["pull", 1])).await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_push_id_aborts() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, 10])).await;
    h.send(json!(["push", 1, 11])).await;

    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pull_of_unknown_id_aborts() {
    let mut h = Harness::start();

    h.send(json!(["pull", 99])).await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_release_then_reference_aborts() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, {"keep": true}])).await;
    h.send(json!(["release", 1, 1])).await;
    h.send(json!(["pull", 1])).await;

    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_refcount_underflow_aborts() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, 5])).await;
    h.send(json!(["release", 1, 2])).await;

    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_release_of_bootstrap_aborts() {
    let mut h = Harness::start();

    h.send(json!(["release", 0, 1])).await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_tag_aborts() {
    let mut h = Harness::start();

    h.send(json!(["frobnicate", 1])).await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_json_aborts() {
    let mut h = Harness::start();

    h.send_raw("this is not json").await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_forbidden_path_key_aborts() {
    let mut h = Harness::start();

    h.send(json!(["push", 1, ["pipeline", 0, ["__proto__"]]]))
        .await;
    match h.recv().await {
        Message::Abort(_) => {}
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_abort_ends_the_loop() {
    let (mut wire, session_end) = channel_transport();
    let session = Arc::new(RpcSession::new(Arc::new(TestApi)));
    let handle = {
        let session = session.clone();
        tokio::spawn(async move { session.run(session_end).await })
    };

    wire.send(Bytes::from(
        json!(["abort", ["error", "generic", "done"]]).to_string(),
    ))
    .await
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_escaped_array_literal_roundtrip() {
    let mut h = Harness::start();

    // A literal array whose first element collides with a tag must arrive
    // escaped, and is re-escaped on the way out. The argument list itself
    // is a one-element array of an array, so it carries its own escape.
    h.send(json!(["push", 1, ["pipeline", 0, ["echo"], [[[["date", 5]]]]]]))
        .await;
    h.send(json!(["pull", 1])).await;

    assert_eq!(
        serde_json::to_value(&h.recv().await).unwrap(),
        json!(["resolve", 1, [["date", 5]]])
    );
}
