// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! MemoDB: a content-addressed store with memoized evaluation.
//!
//! This crate ties the data model and store contract together with the
//! pieces that make the system a service: the [`Evaluator`], the
//! transport-independent [`Request`] surface, the [`Server`] that maps
//! requests onto store and dispatch operations, and the HTTP client store
//! and worker loop that extend evaluation across processes.

mod client;
mod dispatch;
mod evaluator;
mod httpd;
mod link;
mod request;
mod server;
mod worker;

use std::sync::Arc;

pub use client::HttpStore;
pub use evaluator::{EvalError, Evaluator, Func, FuncResult, Future, NodeOrCid};
pub use httpd::{handle_http, serve, HttpRequest};
pub use link::Link;
pub use request::{CacheControl, ContentType, Method, Request, Status};
pub use server::Server;
pub use worker::{poll_once, publish_worker_info, run_worker};

pub use memodb_ipld::{cbor, cid, json, Cid, Kind, Node};
pub use memodb_store::{Call, Head, Name, Store, Uri};

/// Open a store by URI, accepting `http:`/`https:` server URLs in
/// addition to the on-disk engines of [`memodb_store::open`].
pub fn open_store(uri: &str, create_if_missing: bool) -> memodb_store::Result<Arc<dyn Store>> {
    if uri.starts_with("http:") || uri.starts_with("https:") {
        Ok(Arc::new(HttpStore::open(uri)?))
    } else {
        memodb_store::open(uri, create_if_missing).map(Arc::from)
    }
}
