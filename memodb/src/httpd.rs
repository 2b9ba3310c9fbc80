// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! HTTP transport: adapts `http` request/response types to the [`Request`]
//! trait and serves a [`Server`] over TCP with axum.

use std::sync::Arc;

use bytes::Bytes;
use memodb_store::Uri;

use crate::request::{Method, Request};
use crate::server::Server;

/// A single HTTP exchange. Tests construct these directly from
/// `http::Request` values; the axum adapter below does the same.
pub struct HttpRequest {
    method: Option<Method>,
    uri: Option<Uri>,
    headers: http::HeaderMap,
    body: Bytes,

    status: Option<u16>,
    response_headers: Vec<(String, String)>,
    response_body: Option<Vec<u8>>,
    head_only: bool,
}

impl HttpRequest {
    pub fn new(request: http::Request<Bytes>) -> HttpRequest {
        let head_only = request.method() == http::Method::HEAD;
        let method = match *request.method() {
            http::Method::GET | http::Method::HEAD => Some(Method::Get),
            http::Method::POST => Some(Method::Post),
            http::Method::PUT => Some(Method::Put),
            http::Method::DELETE => Some(Method::Delete),
            _ => None,
        };
        let uri = request
            .uri()
            .path_and_query()
            .and_then(|pq| Uri::parse(pq.as_str(), false));
        let (parts, body) = request.into_parts();
        HttpRequest {
            method,
            uri,
            headers: parts.headers,
            body,
            status: None,
            response_headers: Vec::new(),
            response_body: None,
            head_only,
        }
    }

    /// The accumulated response. Only valid after `Server::handle`.
    pub fn into_response(self) -> http::Response<Bytes> {
        let mut builder = http::Response::builder().status(self.status.unwrap_or(500));
        for (key, value) in &self.response_headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let body = if self.head_only {
            Bytes::new()
        } else {
            Bytes::from(self.response_body.unwrap_or_default())
        };
        builder
            .body(body)
            .unwrap_or_else(|_| fallback_response())
    }
}

fn fallback_response() -> http::Response<Bytes> {
    let mut response = http::Response::new(Bytes::new());
    *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
    response
}

impl Request for HttpRequest {
    fn method(&self) -> Option<Method> {
        self.method
    }

    fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn send_status(&mut self, status: u16) {
        debug_assert!(self.status.is_none());
        self.status = Some(status);
    }

    fn send_header(&mut self, key: &str, value: &str) {
        debug_assert!(self.status.is_some());
        debug_assert!(self.response_body.is_none());
        self.response_headers.push((key.to_owned(), value.to_owned()));
    }

    fn send_body(&mut self, body: &[u8]) {
        debug_assert!(self.status.is_some());
        debug_assert!(self.response_body.is_none());
        self.response_body = Some(body.to_vec());
    }

    fn responded(&self) -> bool {
        self.response_body.is_some()
    }
}

/// Handle one exchange synchronously.
pub fn handle_http(server: &Server, request: http::Request<Bytes>) -> http::Response<Bytes> {
    let mut exchange = HttpRequest::new(request);
    server.handle(&mut exchange);
    exchange.into_response()
}

/// Serve until the listener fails. Requests run on blocking threads, since
/// store engines do synchronous I/O.
pub async fn serve(server: Arc<Server>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    use axum::extract::State;

    async fn fallback(
        State(server): State<Arc<Server>>,
        request: axum::extract::Request,
    ) -> http::Response<axum::body::Body> {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(_) => return fallback_response().map(axum::body::Body::from),
        };
        let request = http::Request::from_parts(parts, bytes);
        let response =
            tokio::task::spawn_blocking(move || handle_http(&server, request)).await;
        match response {
            Ok(response) => response.map(axum::body::Body::from),
            Err(e) => {
                log::error!("request handler panicked: {e}");
                fallback_response().map(axum::body::Body::from)
            }
        }
    }

    let app = axum::Router::new()
        .fallback(fallback)
        .with_state(server);
    log::info!("server listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
