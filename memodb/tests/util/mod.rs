// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! A scriptable request for driving the request/server layer in tests.

use std::collections::HashMap;

use memodb::{Method, Request, Uri};

pub struct TestRequest {
    method: Option<Method>,
    uri: Option<Uri>,
    headers: HashMap<String, String>,
    body: Vec<u8>,

    pub status: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<Vec<u8>>,
}

impl TestRequest {
    pub fn new(method: &str, uri: Option<&str>) -> TestRequest {
        let method = if method.eq_ignore_ascii_case("get") || method.eq_ignore_ascii_case("head") {
            Some(Method::Get)
        } else if method.eq_ignore_ascii_case("post") {
            Some(Method::Post)
        } else if method.eq_ignore_ascii_case("put") {
            Some(Method::Put)
        } else if method.eq_ignore_ascii_case("delete") {
            Some(Method::Delete)
        } else {
            None
        };
        TestRequest {
            method,
            uri: uri.and_then(|u| Uri::parse(u, false)),
            headers: HashMap::new(),
            body: Vec::new(),
            status: None,
            response_headers: HashMap::new(),
            response_body: None,
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> TestRequest {
        self.headers.insert(key.to_ascii_lowercase(), value.to_owned());
        self
    }

    pub fn with_body(self, content_type: &str, body: impl Into<Vec<u8>>) -> TestRequest {
        let mut request = self.with_header("content-type", content_type);
        request.body = body.into();
        request
    }

    pub fn response_header(&self, key: &str) -> Option<&str> {
        self.response_headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn response_text(&self) -> &str {
        std::str::from_utf8(self.response_body.as_deref().unwrap_or_default()).unwrap()
    }
}

impl Request for TestRequest {
    fn method(&self) -> Option<Method> {
        self.method
    }

    fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn send_status(&mut self, status: u16) {
        assert_eq!(self.status, None, "status sent twice");
        self.status = Some(status);
    }

    fn send_header(&mut self, key: &str, value: &str) {
        assert!(self.status.is_some(), "header sent before status");
        assert!(self.response_body.is_none(), "header sent after body");
        let key = key.to_ascii_lowercase();
        assert!(
            !self.response_headers.contains_key(&key),
            "header {key} sent twice"
        );
        self.response_headers.insert(key, value.to_owned());
    }

    fn send_body(&mut self, body: &[u8]) {
        assert!(self.status.is_some(), "body sent before status");
        assert!(self.response_body.is_none(), "body sent twice");
        self.response_body = Some(body.to_vec());
    }

    fn responded(&self) -> bool {
        self.response_body.is_some()
    }
}
