// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end tests over a real socket: the axum transport, the HTTP
//! client store, and the worker loop.

use std::sync::Arc;

use bytes::Bytes;
use memodb::{
    cid, handle_http, poll_once, publish_worker_info, Evaluator, HttpStore, Node, NodeOrCid,
    Server,
};
use memodb_store::{Call, Head, MemoryStore, Name, Store};

fn request(method: &str, uri: &str, body: &[u8], content_type: Option<&str>) -> http::Request<Bytes> {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header("Content-Type", content_type);
    }
    builder.body(Bytes::copy_from_slice(body)).unwrap()
}

#[test]
fn adapter_maps_requests_and_responses() {
    let server = Server::new(Arc::new(MemoryStore::new()));

    let response = handle_http(
        &server,
        request("POST", "/cid", b"\"cookie\"", Some("application/json")),
    );
    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/cid/uAXEAB2Zjb29raWU"
    );

    let response = handle_http(&server, request("GET", "/cid/uAXEAB2Zjb29raWU", b"", None));
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("server").unwrap(), "MemoDB");
    assert_eq!(&response.body()[..], b"\"cookie\"");

    // HEAD gets the headers but no body.
    let response = handle_http(&server, request("HEAD", "/cid/uAXEAB2Zjb29raWU", b"", None));
    assert_eq!(response.status(), 200);
    assert!(response.body().is_empty());
}

fn spawn_server(server: Arc<Server>) -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            memodb::serve(server, listener).await.unwrap();
        });
    });
    format!("http://{addr}")
}

#[test]
fn client_store_round_trips() {
    let (base, backing) = {
        let backing = Arc::new(MemoryStore::new());
        let server = Arc::new(Server::new(backing.clone() as Arc<dyn Store>));
        (spawn_server(server), backing)
    };
    let client = HttpStore::open(&base).unwrap();

    let node = Node::map([
        ("kind", Node::from("remote")),
        ("payload", Node::bytes(vec![1u8; 64])),
    ]);
    let stored = client.put(&node).unwrap();
    assert_eq!(client.get(&stored).unwrap(), node);
    assert!(backing.has(&stored).unwrap());

    client.set(&Name::Head(Head::new("latest")), &stored).unwrap();
    assert_eq!(
        client.resolve(&Name::Head(Head::new("latest"))).unwrap(),
        stored
    );

    let mut heads = Vec::new();
    client
        .each_head(&mut |head| {
            heads.push(head.clone());
            false
        })
        .unwrap();
    assert_eq!(heads, vec![Head::new("latest")]);

    // Inline nodes short-circuit without any network traffic.
    let inline = client.put(&Node::from("tiny")).unwrap();
    assert!(cid::is_inline(&inline));
    assert_eq!(client.get(&inline).unwrap(), Node::from("tiny"));
}

#[test]
fn remote_evaluation_through_a_worker() {
    let base = {
        let server = Arc::new(Server::new(Arc::new(MemoryStore::new()) as Arc<dyn Store>));
        spawn_server(server)
    };
    let client = HttpStore::open(&base).unwrap();

    let x = client.put(&Node::bytes(vec![2u8; 64])).unwrap();
    let call = Call::new("identity", vec![x]);

    // Nothing cached: the server queues the call.
    assert_eq!(client.evaluate_remote(&call, 60).unwrap(), None);

    // A worker picks it up, evaluates, and posts the result.
    let worker_store = Arc::new(HttpStore::open(&base).unwrap());
    let evaluator = Evaluator::local(worker_store as Arc<dyn Store>, 0);
    evaluator.register_func("identity", |_, args| Ok(NodeOrCid::Cid(*args[0].cid())));
    let worker_client = HttpStore::open(&base).unwrap();
    let info = publish_worker_info(&evaluator, &worker_client).unwrap();
    assert!(poll_once(&evaluator, &worker_client, &info).unwrap());
    assert!(!poll_once(&evaluator, &worker_client, &info).unwrap());

    // Every later evaluation answers synchronously with the result.
    assert_eq!(client.evaluate_remote(&call, 60).unwrap(), Some(x));
    assert_eq!(client.resolve(&Name::Call(call)).unwrap(), x);
}
