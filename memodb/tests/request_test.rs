// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

mod util;

use memodb::{cid, CacheControl, Method, Node, Request};
use util::TestRequest;

#[test]
fn method_parsing() {
    assert_eq!(TestRequest::new("get", Some("/cid")).method(), Some(Method::Get));
    assert_eq!(TestRequest::new("HEAD", Some("/cid")).method(), Some(Method::Get));
    assert_eq!(TestRequest::new("POST", Some("/cid")).method(), Some(Method::Post));
    assert_eq!(TestRequest::new("DANCE", Some("/cid")).method(), None);
}

#[test]
fn get_content_node_cbor() {
    let mut request = TestRequest::new("POST", Some("/cid"))
        .with_body("application/cbor", vec![0x82, 0x01, 0x61, 0x32]);
    assert_eq!(
        request.get_content_node(None),
        Some(Node::list(vec![Node::from(1i64), Node::from("2")]))
    );
    assert_eq!(request.status, None);
}

#[test]
fn get_content_node_json() {
    let mut request =
        TestRequest::new("POST", Some("/cid")).with_body("application/json", "[1,\"2\"]");
    assert_eq!(
        request.get_content_node(None),
        Some(Node::list(vec![Node::from(1i64), Node::from("2")]))
    );
    assert_eq!(request.status, None);
}

#[test]
fn get_content_node_octet_stream() {
    let mut request =
        TestRequest::new("POST", Some("/cid")).with_body("application/octet-stream", "test");
    assert_eq!(
        request.get_content_node(None),
        Some(Node::bytes(b"test".to_vec()))
    );
    assert_eq!(request.status, None);
}

#[test]
fn get_content_node_unsupported_type() {
    let mut request = TestRequest::new("POST", Some("/cid")).with_body("text/plain", "test");
    assert_eq!(request.get_content_node(None), None);
    assert_eq!(request.status, Some(415));
    assert_eq!(
        request.response_header("content-type"),
        Some("application/problem+json")
    );
    assert_eq!(
        request.response_text(),
        "{\"title\":\"Unsupported Media Type\",\"status\":415}"
    );
}

#[test]
fn get_content_node_invalid_cbor() {
    let mut request = TestRequest::new("POST", Some("/cid"))
        .with_body("application/cbor", vec![0x82, 0x01, 0x61]);
    assert_eq!(request.get_content_node(None), None);
    assert_eq!(request.status, Some(400));
    assert_eq!(
        request.response_text(),
        "{\"type\":\"/problems/invalid-or-unsupported-cbor\",\
         \"title\":\"Invalid or unsupported CBOR\",\"status\":400,\
         \"detail\":\"Invalid CBOR: missing data from string\"}"
    );
}

#[test]
fn get_content_node_invalid_json_node() {
    let mut request =
        TestRequest::new("POST", Some("/cid")).with_body("application/json", "{\"one\":1}");
    assert_eq!(request.get_content_node(None), None);
    assert_eq!(request.status, Some(400));
    assert_eq!(
        request.response_text(),
        "{\"type\":\"/problems/invalid-or-unsupported-json\",\
         \"title\":\"Invalid or unsupported JSON\",\"status\":400,\
         \"detail\":\"Invalid MemoDB JSON: Invalid special JSON object\"}"
    );
}

#[test]
fn get_content_node_missing_body_default() {
    let mut request = TestRequest::new("POST", Some("/evaluate"));
    assert_eq!(
        request.get_content_node(Some(Node::Null)),
        Some(Node::Null)
    );
    let mut request = TestRequest::new("POST", Some("/cid"));
    assert_eq!(request.get_content_node(None), None);
    assert_eq!(request.status, Some(400));
}

#[test]
fn send_content_node_cbor() {
    let mut request =
        TestRequest::new("GET", Some("/cid/foo")).with_header("accept", "application/cbor");
    request.send_content_node(
        &Node::from(12i64),
        Some(&cid::parse("uAXEAAQw").unwrap()),
        CacheControl::Mutable,
    );
    assert_eq!(request.status, Some(200));
    assert_eq!(
        request.response_header("cache-control"),
        Some("max-age=0, must-revalidate")
    );
    assert_eq!(request.response_header("content-type"), Some("application/cbor"));
    assert_eq!(request.response_header("etag"), Some("\"cbor+uAXEAAQw\""));
    assert_eq!(request.response_header("server"), Some("MemoDB"));
    assert_eq!(request.response_header("vary"), Some("Accept, Accept-Encoding"));
    assert_eq!(request.response_body.as_deref(), Some(&[0x0c][..]));
}

#[test]
fn send_content_node_json_by_default() {
    let mut request = TestRequest::new("GET", Some("/cid/foo"));
    request.send_content_node(&Node::from(12i64), None, CacheControl::Ephemeral);
    assert_eq!(request.status, Some(200));
    assert_eq!(request.response_header("content-type"), Some("application/json"));
    assert_eq!(request.response_header("etag"), Some("\"json+uAXEAAQw\""));
    assert_eq!(request.response_text(), "12");
}

#[test]
fn send_content_node_accept_all_is_json() {
    // curl and Python's requests module send "Accept: */*" by default.
    let mut request = TestRequest::new("GET", Some("/cid/foo")).with_header("accept", "*/*");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Ephemeral);
    assert_eq!(request.response_header("content-type"), Some("application/json"));
    assert_eq!(request.response_text(), "12");
}

#[test]
fn send_content_node_octet_stream() {
    let mut request = TestRequest::new("GET", Some("/cid/foo"))
        .with_header("accept", "application/octet-stream;q=0.1,application/json;q=0.01");
    request.send_content_node(&Node::bytes(b"12".to_vec()), None, CacheControl::Immutable);
    assert_eq!(request.status, Some(200));
    assert_eq!(
        request.response_header("cache-control"),
        Some("max-age=604800, immutable")
    );
    assert_eq!(
        request.response_header("content-type"),
        Some("application/octet-stream")
    );
    assert_eq!(request.response_header("etag"), Some("\"raw+uAVUAAjEy\""));
    assert_eq!(request.response_body.as_deref(), Some(&b"12"[..]));
}

#[test]
fn octet_stream_needs_byte_nodes() {
    // A non-bytes node never goes out as octet-stream.
    let mut request = TestRequest::new("GET", Some("/cid/foo"))
        .with_header("accept", "application/octet-stream,application/json;q=0.5");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Ephemeral);
    assert_eq!(request.response_header("content-type"), Some("application/json"));
}

#[test]
fn content_negotiation_prefers_cbor_when_asked() {
    let mut request = TestRequest::new("GET", Some("/cid/foo"))
        .with_header("accept", "application/cbor,application/json;q=0.5");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Ephemeral);
    assert_eq!(request.response_header("content-type"), Some("application/cbor"));
}

#[test]
fn etag_if_none_match() {
    let mut request = TestRequest::new("GET", Some("/cid/foo"))
        .with_header("if-none-match", "\"json+uAXEAAQw\"");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Immutable);
    assert_eq!(request.status, Some(304));
    assert_eq!(request.response_header("etag"), Some("\"json+uAXEAAQw\""));
    assert_eq!(request.response_body.as_deref(), Some(&[][..]));

    // A weak or list-form validator still matches.
    let mut request = TestRequest::new("GET", Some("/cid/foo"))
        .with_header("if-none-match", "W/\"other\", \"json+uAXEAAQw\"");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Immutable);
    assert_eq!(request.status, Some(304));

    let mut request =
        TestRequest::new("GET", Some("/cid/foo")).with_header("if-none-match", "\"stale\"");
    request.send_content_node(&Node::from(12i64), None, CacheControl::Immutable);
    assert_eq!(request.status, Some(200));
}

#[test]
fn send_created() {
    let mut request = TestRequest::new("POST", Some("/cid"));
    request.send_created(None);
    assert_eq!(request.status, Some(201));
    assert_eq!(request.response_header("location"), None);
    assert_eq!(request.response_body.as_deref(), Some(&[][..]));
}

#[test]
fn send_created_with_path() {
    let mut request = TestRequest::new("POST", Some("/cid"));
    let mut path = memodb::Uri::default();
    path.path_segments = vec!["cid".to_owned(), "2".to_owned()];
    request.send_created(Some(&path));
    assert_eq!(request.status, Some(201));
    assert_eq!(request.response_header("location"), Some("/cid/2"));
}

#[test]
fn send_deleted() {
    let mut request = TestRequest::new("POST", Some("/cid"));
    request.send_deleted();
    assert_eq!(request.status, Some(204));
    assert_eq!(request.response_body.as_deref(), Some(&[][..]));
}

#[test]
fn errors_as_html_when_preferred() {
    let mut request =
        TestRequest::new("GET", Some("/cid/x")).with_header("accept", "text/html");
    request.send_error(
        memodb::Status::NotFound,
        None,
        "Not Found",
        Some("missing <thing>"),
    );
    assert_eq!(request.status, Some(404));
    assert_eq!(request.response_header("content-type"), Some("text/html"));
    assert!(request.response_text().contains("Error 404: Not Found"));
    assert!(request.response_text().contains("missing &lt;thing>"));
}
