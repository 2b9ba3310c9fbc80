// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! An in-process engine, used by tests and as the simplest reference for
//! the contract. All four tables live under one mutex, so every operation
//! is trivially atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use memodb_ipld::{cid, load_from_ipld, save_as_ipld, Cid, Node};

use crate::error::{Error, Result};
use crate::key::{self, KIND_BLOCK, KIND_CALL, KIND_HEAD};
use crate::name::{Call, Head, Name};
use crate::Store;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<Cid, Vec<u8>>,
    heads: BTreeMap<String, Cid>,
    calls: BTreeMap<Vec<u8>, Cid>,
    refs: BTreeSet<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Number of persisted blocks; inline nodes never count.
    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn add_ref(&mut self, used: &Cid, kind: u8, user: &[u8]) {
        if !cid::is_inline(used) {
            self.refs.insert(key::ref_key(used, kind, user));
        }
    }

    fn del_ref(&mut self, used: &Cid, kind: u8, user: &[u8]) {
        if !cid::is_inline(used) {
            self.refs.remove(&key::ref_key(used, kind, user));
        }
    }

    fn user_exists(&self, name: &Name) -> bool {
        match name {
            Name::Cid(c) => self.blocks.contains_key(c),
            Name::Head(head) => self.heads.contains_key(&head.0),
            Name::Call(call) => self.calls.contains_key(&key::call_key(call)),
        }
    }
}

impl Store for MemoryStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>> {
        if cid::is_inline(cid) {
            return Ok(Some(load_from_ipld(cid, &[])?));
        }
        match self.lock().blocks.get(cid) {
            Some(bytes) => Ok(Some(load_from_ipld(cid, bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, node: &Node) -> Result<Cid> {
        let (cid, bytes) = save_as_ipld(node);
        if bytes.is_empty() {
            return Ok(cid);
        }
        let mut inner = self.lock();
        if inner.blocks.contains_key(&cid) {
            return Ok(cid);
        }
        let user = cid.to_bytes();
        node.each_link(&mut |link| inner.add_ref(link, KIND_BLOCK, &user));
        inner.blocks.insert(cid, bytes);
        Ok(cid)
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>> {
        let inner = self.lock();
        match name {
            Name::Cid(c) => Ok(Some(*c)),
            Name::Head(head) => Ok(inner.heads.get(&head.0).copied()),
            Name::Call(call) => Ok(inner.calls.get(&key::call_key(call)).copied()),
        }
    }

    fn set(&self, name: &Name, value: &Cid) -> Result<()> {
        let mut inner = self.lock();
        match name {
            Name::Cid(_) => Err(Error::invalid("can't set a CID")),
            Name::Head(head) => {
                let user = head.0.as_bytes().to_vec();
                if let Some(old) = inner.heads.get(&head.0).copied() {
                    inner.del_ref(&old, KIND_HEAD, &user);
                }
                inner.heads.insert(head.0.clone(), *value);
                inner.add_ref(value, KIND_HEAD, &user);
                Ok(())
            }
            Name::Call(call) => {
                let user = key::call_key(call);
                if let Some(old) = inner.calls.get(&user).copied() {
                    inner.del_ref(&old, KIND_CALL, &user);
                }
                inner.calls.insert(user.clone(), *value);
                inner.add_ref(value, KIND_CALL, &user);
                for arg in &call.args {
                    inner.add_ref(arg, KIND_CALL, &user);
                }
                Ok(())
            }
        }
    }

    fn head_delete(&self, head: &Head) -> Result<()> {
        let mut inner = self.lock();
        if let Some(old) = inner.heads.remove(&head.0) {
            inner.del_ref(&old, KIND_HEAD, head.0.as_bytes());
        }
        Ok(())
    }

    fn call_invalidate(&self, func: &str) -> Result<()> {
        let prefix = key::func_prefix(func);
        let mut inner = self.lock();
        let doomed: Vec<(Vec<u8>, Cid)> = inner
            .calls
            .range::<Vec<u8>, _>((Bound::Included(&prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (call_key, result) in doomed {
            inner.del_ref(&result, KIND_CALL, &call_key);
            for arg in key::parse_call_key(&call_key)?.args {
                inner.del_ref(&arg, KIND_CALL, &call_key);
            }
            inner.calls.remove(&call_key);
        }
        Ok(())
    }

    fn list_names_using(&self, cid: &Cid) -> Result<Vec<Name>> {
        if cid::is_inline(cid) {
            return Ok(Vec::new());
        }
        let prefix = cid.to_bytes();
        let inner = self.lock();
        let mut result = Vec::new();
        for entry in inner
            .refs
            .range::<Vec<u8>, _>((Bound::Included(&prefix), Bound::Unbounded))
            .take_while(|entry| entry.starts_with(&prefix))
        {
            let name = key::parse_ref_user(&entry[prefix.len()..])?;
            if inner.user_exists(&name) {
                result.push(name);
            }
        }
        Ok(result)
    }

    fn list_funcs(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut funcs = BTreeSet::new();
        for call_key in inner.calls.keys() {
            funcs.insert(key::parse_call_key(call_key)?.name);
        }
        Ok(funcs.into_iter().collect())
    }

    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()> {
        let heads: Vec<String> = self.lock().heads.keys().cloned().collect();
        for name in heads {
            if f(&Head(name)) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()> {
        let prefix = key::func_prefix(func);
        let keys: Vec<Vec<u8>> = self
            .lock()
            .calls
            .range::<Vec<u8>, _>((Bound::Included(&prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for call_key in keys {
            let call = Call::new(func, key::parse_call_args(func, &call_key)?);
            if f(&call) {
                break;
            }
        }
        Ok(())
    }
}
