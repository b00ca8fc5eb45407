// Integration tests: engines wired to each other through their streams.
// Each file in the tests directory is its own crate.

use async_trait::async_trait;
use json_rpc_stream::stream::{
    engine_stream, pipe, stream_middleware, EngineBuilder, HandlerRegistry, MessageSink,
    Notification, Request, RequestId, ResponseSlot, Result,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const JSONRPC: &str = "2.0";

/// Stores whatever the engine pushes, like a writable sink at the far end.
#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Value>>,
}

#[async_trait]
impl MessageSink for Recorder {
    async fn write(&self, message: Value) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

impl Recorder {
    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_forwards_messages_between_streams() {
    let (client, client_stream) = stream_middleware(None);

    let mut registry = HandlerRegistry::new();
    registry.register_handler("test", |_| async { Ok(json!("test")) });
    let (server, server_stream) = engine_stream(Arc::new(registry));

    pipe(client_stream, server.clone());
    pipe(server_stream, client.clone());

    let response = client
        .send(json!({"id": 1, "jsonrpc": JSONRPC, "method": "test"}))
        .await
        .unwrap()
        .expect("a request resolves to a response");

    assert_eq!(
        Value::Object(response),
        json!({"id": 1, "jsonrpc": JSONRPC, "result": "test"})
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (client, mut client_stream) = stream_middleware(None);

    let mut calls = Vec::new();
    for id in 1..=3 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call_request(Request::with_id(RequestId::from(id), "work", None))
                .await
        }));
    }
    for _ in 0..3 {
        client_stream.recv().await.unwrap();
    }
    assert_eq!(client.pending_count(), 3);

    for id in [3, 1, 2] {
        client
            .write(json!({"id": id, "jsonrpc": JSONRPC, "result": id * 10}))
            .await
            .unwrap();
    }

    for (index, call) in calls.into_iter().enumerate() {
        let response = call.await.unwrap().unwrap();
        let id = index as i64 + 1;
        assert_eq!(
            Value::Object(response),
            json!({"id": id, "jsonrpc": JSONRPC, "result": id * 10})
        );
    }
}

#[tokio::test]
async fn test_back_to_back_responses_complete_in_arrival_order() {
    let (client, mut client_stream) = stream_middleware(None);
    let completed = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for id in 1..=4 {
        let request = Request::with_id(RequestId::from(id), "work", None);
        let (completion, done) = oneshot::channel();
        client
            .send_request(request.clone(), ResponseSlot::for_request(&request), completion)
            .unwrap();
        client_stream.recv().await.unwrap();

        let completed = completed.clone();
        waiters.push(tokio::spawn(async move {
            done.await.unwrap();
            completed.lock().unwrap().push(id);
        }));
    }
    // Every waiter is parked on its receiver before any response lands.
    settle().await;

    let arrival = [3, 1, 4, 2];
    for id in arrival {
        client
            .write(json!({"id": id, "jsonrpc": JSONRPC, "result": id}))
            .await
            .unwrap();
    }
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*completed.lock().unwrap(), arrival.to_vec());
}

#[tokio::test]
async fn test_processes_inbound_and_outbound_requests_and_responses() {
    let mut registry = HandlerRegistry::new();
    registry.register_handler("testIn", |_| async { Ok(json!("received")) });
    let (engine, stream) = EngineBuilder::new().dispatcher(Arc::new(registry)).build();

    let recorder = Arc::new(Recorder::default());
    pipe(stream, recorder.clone());

    engine
        .write(json!({"id": 1, "jsonrpc": JSONRPC, "method": "testIn"}))
        .await
        .unwrap();

    let caller = engine.clone();
    let outgoing = tokio::spawn(async move {
        caller
            .send(json!({"id": 2, "jsonrpc": JSONRPC, "method": "testOut"}))
            .await
    });
    settle().await;

    let expected_response = json!({"id": 2, "jsonrpc": JSONRPC, "result": "foo"});
    engine.write(expected_response.clone()).await.unwrap();
    let received = outgoing.await.unwrap().unwrap().unwrap();
    assert_eq!(Value::Object(received), expected_response);

    settle().await;
    let outgoing_messages = recorder.take();
    assert_eq!(outgoing_messages.len(), 2);
    assert!(outgoing_messages.contains(&json!({"id": 1, "jsonrpc": JSONRPC, "result": "received"})));
    assert!(outgoing_messages.contains(&json!({"id": 2, "jsonrpc": JSONRPC, "method": "testOut"})));
}

#[tokio::test]
async fn test_processes_inbound_and_outbound_notifications() {
    let inbound = Arc::new(Mutex::new(Vec::<Notification>::new()));
    let outbound = Arc::new(Mutex::new(Vec::<Notification>::new()));
    let inbound_log = inbound.clone();
    let outbound_log = outbound.clone();

    let (engine, stream) = EngineBuilder::new()
        .notification_handler(move |notification: &Notification| {
            inbound_log.lock().unwrap().push(notification.clone());
        })
        .outbound_notification_hook(move |notification: &Notification| {
            outbound_log.lock().unwrap().push(notification.clone());
        })
        .build();

    let recorder = Arc::new(Recorder::default());
    pipe(stream, recorder.clone());

    engine
        .write(json!({"jsonrpc": JSONRPC, "method": "notifIn"}))
        .await
        .unwrap();
    let sent = engine
        .send(json!({"jsonrpc": JSONRPC, "method": "notifOut"}))
        .await
        .unwrap();
    assert!(sent.is_none());
    settle().await;

    let inbound = inbound.lock().unwrap().clone();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].method(), "notifIn");

    let outbound = outbound.lock().unwrap().clone();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].method(), "notifOut");

    assert_eq!(
        recorder.take(),
        vec![json!({"jsonrpc": JSONRPC, "method": "notifOut"})]
    );
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn test_recovery_signal_resends_stuck_requests() {
    let (client, mut client_stream) = stream_middleware(Some("reconnected"));

    let mut calls = Vec::new();
    for id in 1..=4 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call_request(Request::with_id(RequestId::from(id), "stuck", Some(json!([id]))))
                .await
        }));
    }
    let mut originals = Vec::new();
    for _ in 0..4 {
        originals.push(client_stream.recv().await.unwrap());
    }

    client
        .write(json!({"jsonrpc": JSONRPC, "method": "reconnected"}))
        .await
        .unwrap();
    assert_eq!(client.pending_count(), 4);

    let mut resent = Vec::new();
    while let Some(message) = client_stream.try_recv() {
        resent.push(message);
    }
    assert_eq!(resent.len(), 4);
    for message in &resent {
        assert!(originals.contains(message));
    }

    // The peer answers each once; every caller still completes exactly once.
    for id in 1..=4 {
        client
            .write(json!({"id": id, "jsonrpc": JSONRPC, "result": "done"}))
            .await
            .unwrap();
    }
    for call in calls {
        let response = call.await.unwrap().unwrap();
        assert_eq!(response["result"], json!("done"));
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_bad_messages_do_not_break_the_pipe() {
    let (client, client_stream) = stream_middleware(None);
    let mut registry = HandlerRegistry::new();
    registry.register_handler("test", |_| async { Ok(json!("test")) });
    let (server, server_stream) = engine_stream(Arc::new(registry));

    pipe(client_stream, server.clone());
    pipe(server_stream, client.clone());

    // Responses nobody asked for land on the client and are rejected there.
    server
        .send(json!({"id": 404, "jsonrpc": JSONRPC, "result": "stray"}))
        .await
        .unwrap();
    settle().await;

    let response = client.call("test", None).await.unwrap();
    assert_eq!(response["result"], json!("test"));
}
