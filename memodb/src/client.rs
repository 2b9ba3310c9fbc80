// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! A [`Store`] implementation backed by a remote MemoDB server.
//!
//! Every operation maps onto the public HTTP surface with CBOR bodies, so
//! anything that works against a local engine (the evaluator, `transfer`)
//! works across processes too. Head deletion has no route and is reported
//! unsupported.

use memodb_ipld::{cbor, cid, save_as_ipld, Cid, Node};
use memodb_store::{Call, Error, Head, Name, Result, Store, Uri};
use reqwest::blocking::Client;
use reqwest::StatusCode;

pub struct HttpStore {
    base: String,
    client: Client,
}

impl HttpStore {
    /// `base` is the server root, e.g. `http://127.0.0.1:29179`.
    pub fn open(base: &str) -> Result<HttpStore> {
        let base = base.trim_end_matches('/').to_owned();
        if !base.starts_with("http:") && !base.starts_with("https:") {
            return Err(Error::unsupported(format!("unsupported URI {base}")));
        }
        Ok(HttpStore {
            base,
            client: Client::new(),
        })
    }

    fn url(&self, name: &Name) -> String {
        format!("{}{}", self.base, name.to_uri().encode())
    }

    fn get_node(&self, url: &str) -> Result<Option<Node>> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/cbor")
            .send()
            .map_err(Error::crash)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().map_err(Error::crash)?;
                Ok(Some(cbor::decode(&body)?))
            }
            status => Err(Error::crash(format!("GET {url} failed with {status}"))),
        }
    }

    fn put_link(&self, url: &str, value: &Cid) -> Result<()> {
        let body = cbor::encode(&Node::Link(*value)).bytes;
        let response = self
            .client
            .put(url)
            .header("Content-Type", "application/cbor")
            .body(body)
            .send()
            .map_err(Error::crash)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::crash(format!(
                "PUT {url} failed with {}",
                response.status()
            )))
        }
    }

    fn list_uris(&self, url: &str) -> Result<Vec<Uri>> {
        let node = self.get_node(url)?.ok_or(Error::NotFound)?;
        let mut uris = Vec::new();
        for item in node.as_list()? {
            let text = item.as_str()?;
            let uri = Uri::parse(text, false)
                .ok_or_else(|| Error::invalid(format!("server returned bad URI {text:?}")))?;
            uris.push(uri);
        }
        Ok(uris)
    }

    /// Long-poll the worker endpoint. `None` means no work is pending.
    pub fn poll_worker(&self, info: &Cid) -> Result<Option<Node>> {
        let body = cbor::encode(&Node::Link(*info)).bytes;
        let response = self
            .client
            .post(format!("{}/worker", self.base))
            .header("Content-Type", "application/cbor")
            .header("Accept", "application/cbor")
            .body(body)
            .send()
            .map_err(Error::crash)?;
        if !response.status().is_success() {
            return Err(Error::crash(format!(
                "POST /worker failed with {}",
                response.status()
            )));
        }
        let bytes = response.bytes().map_err(Error::crash)?;
        let node = cbor::decode(&bytes)?;
        Ok((!node.is_null()).then_some(node))
    }

    /// Ask the server to evaluate a call. Returns the result when it was
    /// already cached; `None` when the request was queued (202).
    pub fn evaluate_remote(&self, call: &Call, timeout_seconds: u64) -> Result<Option<Cid>> {
        let url = format!("{}/evaluate", self.url(&Name::Call(call.clone())));
        let body = cbor::encode(&Node::map([("timeout", Node::from(timeout_seconds))])).bytes;
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/cbor")
            .header("Accept", "application/cbor")
            .body(body)
            .send()
            .map_err(Error::crash)?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().map_err(Error::crash)?;
                Ok(Some(*cbor::decode(&bytes)?.as_link()?))
            }
            status => Err(Error::crash(format!("POST {url} failed with {status}"))),
        }
    }
}

fn name_from_uri(uri: &Uri) -> Result<Name> {
    let bad = || Error::invalid("server returned an unrecognized name URI");
    let (first, rest) = uri.path_segments.split_first().ok_or_else(bad)?;
    match (first.as_str(), rest) {
        ("cid", [text]) => Ok(Name::Cid(cid::parse(text)?)),
        ("head", rest) if !rest.is_empty() => Ok(Name::Head(Head::new(rest.join("/")))),
        ("call", [func, args]) => {
            let mut call = Call::new(func.clone(), Vec::new());
            for arg in args.split(',') {
                call.args.push(cid::parse(arg)?);
            }
            Ok(Name::Call(call))
        }
        _ => Err(bad()),
    }
}

impl Store for HttpStore {
    fn get_optional(&self, target: &Cid) -> Result<Option<Node>> {
        if cid::is_inline(target) {
            return Ok(Some(memodb_ipld::load_from_ipld(target, &[])?));
        }
        self.get_node(&self.url(&Name::Cid(*target)))
    }

    fn put(&self, node: &Node) -> Result<Cid> {
        let (target, bytes) = save_as_ipld(node);
        if bytes.is_empty() {
            return Ok(target);
        }
        let body = cbor::encode(node).bytes;
        let response = self
            .client
            .post(format!("{}/cid", self.base))
            .header("Content-Type", "application/cbor")
            .body(body)
            .send()
            .map_err(Error::crash)?;
        if !response.status().is_success() {
            return Err(Error::crash(format!(
                "POST /cid failed with {}",
                response.status()
            )));
        }
        Ok(target)
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>> {
        match name {
            Name::Cid(c) => Ok(Some(*c)),
            other => match self.get_node(&self.url(other))? {
                Some(node) => Ok(Some(*node.as_link()?)),
                None => Ok(None),
            },
        }
    }

    fn set(&self, name: &Name, value: &Cid) -> Result<()> {
        match name {
            Name::Cid(_) => Err(Error::invalid("can't set a CID")),
            other => self.put_link(&self.url(other), value),
        }
    }

    fn head_delete(&self, _head: &Head) -> Result<()> {
        Err(Error::unsupported("head deletion over HTTP"))
    }

    fn call_invalidate(&self, func: &str) -> Result<()> {
        let mut uri = Uri::default();
        uri.path_segments = vec!["call".to_owned(), func.to_owned()];
        let url = format!("{}{}", self.base, uri.encode());
        let response = self.client.delete(&url).send().map_err(Error::crash)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::crash(format!(
                "DELETE {url} failed with {}",
                response.status()
            )))
        }
    }

    fn list_names_using(&self, target: &Cid) -> Result<Vec<Name>> {
        let url = format!("{}/users", self.url(&Name::Cid(*target)));
        let uris = self.list_uris(&url)?;
        uris.iter().map(name_from_uri).collect()
    }

    fn list_funcs(&self) -> Result<Vec<String>> {
        let uris = self.list_uris(&format!("{}/call", self.base))?;
        let mut funcs = Vec::new();
        for uri in &uris {
            match uri.path_segments.as_slice() {
                [first, func] if first == "call" => funcs.push(func.clone()),
                _ => return Err(Error::invalid("unexpected entry in /call listing")),
            }
        }
        Ok(funcs)
    }

    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()> {
        let uris = self.list_uris(&format!("{}/head", self.base))?;
        for uri in &uris {
            if let Ok(Name::Head(head)) = name_from_uri(uri) {
                if f(&head) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()> {
        let mut base = Uri::default();
        base.path_segments = vec!["call".to_owned(), func.to_owned()];
        let uris = self.list_uris(&format!("{}{}", self.base, base.encode()))?;
        for uri in &uris {
            if let Ok(Name::Call(call)) = name_from_uri(uri) {
                if f(&call) {
                    break;
                }
            }
        }
        Ok(())
    }
}
