// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Maps requests onto store and dispatch operations.
//!
//! Routes:
//!
//! | Route                              | Methods    |
//! |------------------------------------|------------|
//! | `/cid`                             | POST       |
//! | `/cid/{cid}`                       | GET        |
//! | `/cid/{cid}/users`                 | GET        |
//! | `/head`                            | GET        |
//! | `/head/{name...}`                  | GET, PUT   |
//! | `/call`                            | GET        |
//! | `/call/{func}`                     | GET, DELETE|
//! | `/call/{func}/{cid,cid,…}`         | GET, PUT   |
//! | `/call/{func}/{args}/evaluate`     | POST       |
//! | `/worker`                          | POST       |

use std::sync::Arc;

use memodb_ipld::{cid, Node};
use memodb_store::{Call, Head, Name, Store, Uri};

use crate::dispatch::{Dispatcher, EvaluateOutcome};
use crate::request::{CacheControl, Method, Request, Status};

pub struct Server {
    store: Arc<dyn Store>,
    dispatch: Dispatcher,
}

impl Server {
    pub fn new(store: Arc<dyn Store>) -> Server {
        Server {
            store,
            dispatch: Dispatcher::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn handle(&self, request: &mut dyn Request) {
        self.route(request);
        debug_assert!(request.responded());
    }

    fn route(&self, request: &mut dyn Request) {
        if request.method().is_none() {
            return request.send_error(Status::NotImplemented, None, "Not Implemented", None);
        }
        let uri = request
            .uri()
            .filter(|uri| !uri.rootless || uri.path_segments.is_empty())
            .cloned();
        let uri = match uri {
            Some(uri) => uri,
            None => return request.send_error(Status::BadRequest, None, "Bad Request", None),
        };
        let segments: Vec<&str> = uri.path_segments.iter().map(String::as_str).collect();

        match segments.split_first() {
            Some((&"cid", rest)) => match rest {
                [] => self.handle_cid_root(request),
                [cid_str] => self.handle_cid(request, cid_str, None),
                [cid_str, sub] => self.handle_cid(request, cid_str, Some(sub)),
                _ => request.send_error(Status::NotFound, None, "Not Found", None),
            },
            Some((&"head", rest)) => match rest {
                [] => self.handle_head_root(request),
                _ => {
                    // Head names may contain slashes; rejoin the segments.
                    let name = uri.path_string(1);
                    self.handle_head(request, &name)
                }
            },
            Some((&"call", rest)) => match rest {
                [] => self.handle_call_root(request),
                [func] => self.handle_func(request, func),
                [func, args] => self.handle_call(request, func, args, None),
                [func, args, sub] => self.handle_call(request, func, args, Some(sub)),
                _ => request.send_error(Status::NotFound, None, "Not Found", None),
            },
            Some((&"worker", [])) => self.handle_worker(request),
            _ => request.send_error(Status::NotFound, None, "Not Found", None),
        }
    }

    fn or_crash<T>(&self, request: &mut dyn Request, result: memodb_store::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                log::error!("store failure while handling request: {e}");
                request.send_status(500);
                request.send_body(&[]);
                None
            }
        }
    }

    // POST /cid
    fn handle_cid_root(&self, request: &mut dyn Request) {
        if request.method() != Some(Method::Post) {
            return request.send_method_not_allowed("POST");
        }
        let node = match request.get_content_node(None) {
            Some(node) => node,
            None => return,
        };
        let stored = match self.or_crash(request, self.store.put(&node)) {
            Some(stored) => stored,
            None => return,
        };
        let mut location = Uri::default();
        location.path_segments = vec!["cid".to_owned(), cid::to_text(&stored)];
        request.send_created(Some(&location));
    }

    // GET /cid/{cid} and /cid/{cid}/users
    fn handle_cid(&self, request: &mut dyn Request, cid_str: &str, sub: Option<&str>) {
        if request.method() != Some(Method::Get) {
            return request.send_method_not_allowed("GET, HEAD");
        }
        let target = match cid::parse(cid_str) {
            Ok(target) => target,
            Err(_) => {
                return request.send_error(
                    Status::BadRequest,
                    Some("/problems/invalid-or-unsupported-cid"),
                    "Invalid or unsupported CID",
                    Some(&format!("CID \"{cid_str}\" could not be parsed.")),
                )
            }
        };
        match sub {
            Some("users") => {
                let names = match self.or_crash(request, self.store.list_names_using(&target)) {
                    Some(names) => names,
                    None => return,
                };
                let uris: Vec<Uri> = names.iter().map(Name::to_uri).collect();
                request.send_content_uris(&uris, CacheControl::Mutable);
            }
            Some(_) => request.send_error(Status::NotFound, None, "Not Found", None),
            None => {
                let node = match self.or_crash(request, self.store.get_optional(&target)) {
                    Some(node) => node,
                    None => return,
                };
                match node {
                    Some(node) => {
                        request.send_content_node(&node, Some(&target), CacheControl::Immutable)
                    }
                    None => request.send_error(
                        Status::NotFound,
                        None,
                        "Not Found",
                        Some(&format!("CID \"{cid_str}\" not found in store.")),
                    ),
                }
            }
        }
    }

    // GET /head
    fn handle_head_root(&self, request: &mut dyn Request) {
        if request.method() != Some(Method::Get) {
            return request.send_method_not_allowed("GET, HEAD");
        }
        let mut uris = Vec::new();
        let listed = self.store.each_head(&mut |head| {
            uris.push(Name::Head(head.clone()).to_uri());
            false
        });
        if self.or_crash(request, listed).is_none() {
            return;
        }
        request.send_content_uris(&uris, CacheControl::Mutable);
    }

    // GET and PUT /head/{name...}
    fn handle_head(&self, request: &mut dyn Request, name: &str) {
        match request.method() {
            Some(Method::Get) => {
                let resolved = self
                    .store
                    .resolve_optional(&Name::Head(Head::new(name)));
                match self.or_crash(request, resolved) {
                    Some(Some(stored)) => request.send_content_node(
                        &Node::Link(stored),
                        None,
                        CacheControl::Mutable,
                    ),
                    Some(None) => request.send_error(
                        Status::NotFound,
                        None,
                        "Not Found",
                        Some(&format!("Head \"{name}\" not found in store.")),
                    ),
                    None => {}
                }
            }
            Some(Method::Put) => {
                if name.is_empty() {
                    return request.send_error(
                        Status::BadRequest,
                        Some("/problems/invalid-string"),
                        "Invalid UTF-8 or unexpected empty string",
                        None,
                    );
                }
                let node = match request.get_content_node(None) {
                    Some(node) => node,
                    None => return,
                };
                let target = match node.as_link() {
                    Ok(target) => *target,
                    Err(_) => {
                        return request.send_error(
                            Status::BadRequest,
                            Some("/problems/expected-cid"),
                            "Expected CID but got another kind of node",
                            None,
                        )
                    }
                };
                let stored = self.store.set(&Name::Head(Head::new(name)), &target);
                if self.or_crash(request, stored).is_some() {
                    request.send_created(None);
                }
            }
            _ => request.send_method_not_allowed("GET, HEAD, PUT"),
        }
    }

    // GET /call
    fn handle_call_root(&self, request: &mut dyn Request) {
        if request.method() != Some(Method::Get) {
            return request.send_method_not_allowed("GET, HEAD");
        }
        let funcs = match self.or_crash(request, self.store.list_funcs()) {
            Some(funcs) => funcs,
            None => return,
        };
        let uris: Vec<Uri> = funcs
            .into_iter()
            .map(|func| {
                let mut uri = Uri::default();
                uri.path_segments = vec!["call".to_owned(), func];
                uri
            })
            .collect();
        request.send_content_uris(&uris, CacheControl::Mutable);
    }

    // GET and DELETE /call/{func}
    fn handle_func(&self, request: &mut dyn Request, func: &str) {
        if func.is_empty() {
            return request.send_error(
                Status::BadRequest,
                Some("/problems/invalid-string"),
                "Invalid UTF-8 or unexpected empty string",
                None,
            );
        }
        match request.method() {
            Some(Method::Get) => {
                let mut uris = Vec::new();
                let listed = self.store.each_call(func, &mut |call| {
                    uris.push(Name::Call(call.clone()).to_uri());
                    false
                });
                if self.or_crash(request, listed).is_none() {
                    return;
                }
                request.send_content_uris(&uris, CacheControl::Mutable);
            }
            Some(Method::Delete) => {
                if self
                    .or_crash(request, self.store.call_invalidate(func))
                    .is_some()
                {
                    request.send_deleted();
                }
            }
            _ => request.send_method_not_allowed("DELETE, GET, HEAD"),
        }
    }

    fn parse_call(&self, request: &mut dyn Request, func: &str, args: &str) -> Option<Call> {
        if func.is_empty() {
            request.send_error(
                Status::BadRequest,
                Some("/problems/invalid-string"),
                "Invalid UTF-8 or unexpected empty string",
                None,
            );
            return None;
        }
        let mut call = Call::new(func, Vec::new());
        for arg in args.split(',') {
            match cid::parse(arg) {
                Ok(parsed) => call.args.push(parsed),
                Err(_) => {
                    request.send_error(
                        Status::BadRequest,
                        Some("/problems/invalid-or-unsupported-cid"),
                        "Invalid or unsupported CID",
                        Some(&format!("CID \"{arg}\" could not be parsed.")),
                    );
                    return None;
                }
            }
        }
        Some(call)
    }

    // GET and PUT /call/{func}/{args}, POST /call/{func}/{args}/evaluate
    fn handle_call(
        &self,
        request: &mut dyn Request,
        func: &str,
        args: &str,
        sub: Option<&str>,
    ) {
        let call = match self.parse_call(request, func, args) {
            Some(call) => call,
            None => return,
        };
        match sub {
            Some("evaluate") => self.handle_evaluate(request, call),
            Some(_) => request.send_error(Status::NotFound, None, "Not Found", None),
            None => match request.method() {
                Some(Method::Get) => {
                    let resolved = self.store.resolve_optional(&Name::Call(call));
                    match self.or_crash(request, resolved) {
                        Some(Some(stored)) => request.send_content_node(
                            &Node::Link(stored),
                            None,
                            CacheControl::Mutable,
                        ),
                        Some(None) => request.send_error(
                            Status::NotFound,
                            None,
                            "Not Found",
                            Some("Call not found in store."),
                        ),
                        None => {}
                    }
                }
                Some(Method::Put) => {
                    let node = match request.get_content_node(None) {
                        Some(node) => node,
                        None => return,
                    };
                    let target = match node.as_link() {
                        Ok(target) => *target,
                        Err(_) => {
                            return request.send_error(
                                Status::BadRequest,
                                Some("/problems/expected-cid"),
                                "Expected CID but got another kind of node",
                                None,
                            )
                        }
                    };
                    let stored = self.store.set(&Name::Call(call.clone()), &target);
                    if self.or_crash(request, stored).is_none() {
                        return;
                    }
                    self.dispatch.on_result(&call);
                    request.send_created(None);
                }
                _ => request.send_method_not_allowed("GET, HEAD, PUT"),
            },
        }
    }

    // POST /call/{func}/{args}/evaluate
    fn handle_evaluate(&self, request: &mut dyn Request, call: Call) {
        if request.method() != Some(Method::Post) {
            return request.send_method_not_allowed("POST");
        }
        let body = match request.get_content_node(Some(Node::Map(memodb_ipld::Map::new()))) {
            Some(body) => body,
            None => return,
        };
        if !body.is_map() {
            return request.send_error(Status::BadRequest, None, "Invalid body kind", None);
        }
        if let Some(timeout) = body.entry("timeout") {
            if timeout.as_u64().is_err() {
                return request.send_error(
                    Status::BadRequest,
                    None,
                    "Invalid body field: timeout",
                    None,
                );
            }
        }

        // The result is often already cached; check before locking.
        let resolved = self.store.resolve_optional(&Name::Call(call.clone()));
        match self.or_crash(request, resolved) {
            Some(Some(stored)) => {
                return request.send_content_node(&Node::Link(stored), None, CacheControl::Mutable)
            }
            Some(None) => {}
            None => return,
        }

        let name = Name::Call(call.clone());
        let outcome = self.dispatch.with_group(&call.name, |group| {
            // Re-check under the group lock: a result PUT may have landed
            // between the optimistic lookup and here.
            match self.store.resolve_optional(&name) {
                Ok(Some(stored)) => Err(Ok(stored)),
                Ok(None) => Ok(group.upsert_pending(&call)),
                Err(e) => Err(Err(e)),
            }
        });
        match outcome {
            Err(Ok(stored)) => {
                request.send_content_node(&Node::Link(stored), None, CacheControl::Mutable)
            }
            Err(Err(e)) => {
                let failed: memodb_store::Result<()> = Err(e);
                self.or_crash(request, failed);
            }
            Ok(EvaluateOutcome::Queued | EvaluateOutcome::AlreadyPending) => {
                request.send_accepted();
            }
        }
    }

    // POST /worker
    fn handle_worker(&self, request: &mut dyn Request) {
        if request.method() != Some(Method::Post) {
            return request.send_method_not_allowed("POST");
        }
        let node = match request.get_content_node(None) {
            Some(node) => node,
            None => return,
        };
        let worker_cid = match node.as_link() {
            Ok(worker_cid) => *worker_cid,
            Err(_) => {
                return request.send_error(
                    Status::BadRequest,
                    Some("/problems/expected-cid"),
                    "Expected CID but got another kind of node",
                    None,
                )
            }
        };
        let key = worker_cid.to_bytes();

        if !self.dispatch.has_worker_group(&key) {
            let info = match self.or_crash(request, self.store.get_optional(&worker_cid)) {
                Some(info) => info,
                None => return,
            };
            let info = match info {
                Some(info) => info,
                None => {
                    return request.send_error(
                        Status::BadRequest,
                        Some("/problems/unknown-cid"),
                        "Provided CID was missing from the store",
                        None,
                    )
                }
            };
            let funcs = match info.entry("funcs").map(Node::as_list) {
                Some(Ok(funcs)) if info.is_map() => funcs,
                _ => {
                    return request.send_error(
                        Status::BadRequest,
                        Some("/problems/invalid-worker-info"),
                        "Provided worker info is invalid",
                        None,
                    )
                }
            };
            let names: Vec<String> = funcs
                .iter()
                .filter_map(|f| f.as_str().ok().map(str::to_owned))
                .collect();
            self.dispatch.register_worker_group(key.clone(), &names);
        }

        match self.dispatch.take_call_for_worker(&key) {
            Some(call) => {
                let args: Vec<Node> = call.args.iter().map(|arg| Node::Link(*arg)).collect();
                let job = Node::map([
                    ("func", Node::from(call.name.as_str())),
                    ("args", Node::List(args)),
                ]);
                request.send_content_node(&job, None, CacheControl::Ephemeral);
            }
            None => request.send_content_node(&Node::Null, None, CacheControl::Ephemeral),
        }
    }
}
