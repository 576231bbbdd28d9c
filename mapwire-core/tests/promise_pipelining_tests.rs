// Promise pipelining over a two-session in-memory transport: property
// pulls, chained calls issued before their parents resolve, and breakage
// on transport loss.

use async_trait::async_trait;
use mapwire_core::protocol::PropertyKey;
use mapwire_core::{
    channel_transport, ErrorCode, Hook, Payload, RpcError, RpcSession, RpcTarget, Value,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct TestApi;

#[async_trait]
impl RpcTarget for TestApi {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "makeCounter" => {
                let start = int_arg(&args, 0)?;
                Ok(Value::Stub(Hook::for_target(Arc::new(Counter {
                    count: AtomicI64::new(start),
                }))))
            }
            "echo" => Ok(args
                .into_iter()
                .next()
                .unwrap_or(Value::Undefined)),
            "fail" => Err(RpcError::target("deliberate failure")),
            _ => Err(RpcError::target(format!("no such method: {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "foo" => Ok(Value::from(42i64)),
            "nested" => {
                let mut inner = indexmap::IndexMap::new();
                inner.insert("deep".to_string(), Value::from("treasure"));
                let mut outer = indexmap::IndexMap::new();
                outer.insert("inner".to_string(), Value::Object(inner));
                Ok(Value::Object(outer))
            }
            _ => Err(RpcError::path(format!("no such property: {}", property))),
        }
    }
}

#[derive(Debug)]
struct Counter {
    count: AtomicI64,
}

#[async_trait]
impl RpcTarget for Counter {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "increment" => {
                let by = int_arg(&args, 0)?;
                let new = self.count.fetch_add(by, Ordering::SeqCst) + by;
                Ok(Value::from(new))
            }
            _ => Err(RpcError::target(format!("no such method: {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "value" => Ok(Value::from(self.count.load(Ordering::SeqCst))),
            _ => Err(RpcError::path(format!("no such property: {}", property))),
        }
    }
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, RpcError> {
    match args.get(index) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| RpcError::target("expected an integer")),
        _ => Err(RpcError::target("missing argument")),
    }
}

fn path(parts: &[&str]) -> Vec<PropertyKey> {
    parts.iter().map(|p| PropertyKey::from(*p)).collect()
}

#[derive(Debug)]
struct EmptyApi;

#[async_trait]
impl RpcTarget for EmptyApi {
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::target(format!("no such method: {}", method)))
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::path(format!("no such property: {}", property)))
    }
}

/// Wire up a client session against a server exporting `TestApi`.
fn start_pair() -> (Arc<RpcSession>, Arc<RpcSession>) {
    let (client_end, server_end) = channel_transport();
    let server = Arc::new(RpcSession::new(Arc::new(TestApi)));
    let client = Arc::new(RpcSession::new(Arc::new(EmptyApi)));
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.run(server_end).await;
        });
    }
    {
        let client = client.clone();
        tokio::spawn(async move {
            let _ = client.run(client_end).await;
        });
    }
    (client, server)
}

#[tokio::test]
async fn test_property_pull() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();
    let foo = stub.get(&path(&["foo"])).unwrap();
    let payload = foo.pull().await.unwrap();
    assert_eq!(payload.into_value(), Value::from(42i64));
    foo.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_deep_property_pull() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();
    let deep = stub.get(&path(&["nested", "inner", "deep"])).unwrap();
    let payload = deep.pull().await.unwrap();
    assert_eq!(payload.into_value(), Value::from("treasure"));
    deep.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_pipelined_counter_calls() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();

    // Both pushes go out before anything resolves.
    let counter = stub
        .call(&path(&["makeCounter"]), vec![Value::from(4i64)])
        .unwrap();
    let incremented = counter
        .call(&path(&["increment"]), vec![Value::from(3i64)])
        .unwrap();

    let payload = incremented.pull().await.unwrap();
    assert_eq!(payload.into_value(), Value::from(7i64));

    incremented.dispose();
    counter.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_pipelined_calls_preserve_order() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();

    let counter = stub
        .call(&path(&["makeCounter"]), vec![Value::from(0i64)])
        .unwrap();
    let a = counter
        .call(&path(&["increment"]), vec![Value::from(1i64)])
        .unwrap();
    let b = counter
        .call(&path(&["increment"]), vec![Value::from(10i64)])
        .unwrap();

    // Queued in arrival order on the pending counter.
    assert_eq!(a.pull().await.unwrap().into_value(), Value::from(1i64));
    assert_eq!(b.pull().await.unwrap().into_value(), Value::from(11i64));

    a.dispose();
    b.dispose();
    counter.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_counter_stub_in_resolution() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();

    let counter = stub
        .call(&path(&["makeCounter"]), vec![Value::from(10i64)])
        .unwrap();
    // Pulling the call result yields the capability itself.
    let payload = counter.pull().await.unwrap();
    let counter_stub = match payload.into_value() {
        Value::Stub(hook) => hook,
        other => panic!("expected a stub, got {:?}", other),
    };

    let value = counter_stub.get(&path(&["value"])).unwrap();
    assert_eq!(value.pull().await.unwrap().into_value(), Value::from(10i64));

    value.dispose();
    counter_stub.dispose();
    counter.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_echo_roundtrips_structures() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();

    let mut obj = indexmap::IndexMap::new();
    obj.insert(
        "items".to_string(),
        Value::Array(vec![Value::from(1i64), Value::from("two"), Value::Null]),
    );
    obj.insert("when".to_string(), Value::Date(1700000000000.0));
    let sent = Value::Object(obj);
    let expected = sent.deep_copy();

    let echoed = stub.call(&path(&["echo"]), vec![sent]).unwrap();
    assert_eq!(echoed.pull().await.unwrap().into_value(), expected);

    echoed.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_target_error_rejects_only_that_call() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();

    let failing = stub.call(&path(&["fail"]), vec![]).unwrap();
    let err = failing.pull().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Target);
    assert!(err.message.contains("deliberate failure"));
    failing.dispose();

    // The session survives per-call failures.
    let foo = stub.get(&path(&["foo"])).unwrap();
    assert_eq!(foo.pull().await.unwrap().into_value(), Value::from(42i64));
    foo.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_transport_loss_breaks_pending_imports() {
    let (client_end, server_end) = channel_transport();
    let client = Arc::new(RpcSession::new(Arc::new(EmptyApi)));
    {
        let client = client.clone();
        tokio::spawn(async move {
            let _ = client.run(client_end).await;
        });
    }

    let stub = client.bootstrap();
    let pending = stub.call(&path(&["anything"]), vec![]).unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    pending.on_broken(move |err| {
        let _ = tx.send(err.message);
    });

    // The peer never ran; dropping its end closes the transport.
    drop(server_end);

    let err = pending.pull().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Broken);

    let message = rx.await.unwrap();
    assert!(message.contains("transport closed"));

    pending.dispose();
    stub.dispose();
}

#[tokio::test]
async fn test_payload_deep_copy_of_pulled_value() {
    let (client, _server) = start_pair();
    let stub = client.bootstrap();
    let foo = stub.get(&path(&["foo"])).unwrap();

    // Pulling twice hands out independent payloads.
    let first: Payload = foo.pull().await.unwrap();
    let second: Payload = foo.pull().await.unwrap();
    assert_eq!(first.value(), second.value());
    first.dispose();
    second.dispose();

    foo.dispose();
    stub.dispose();
}
