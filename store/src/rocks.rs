// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! RocksDB engine.
//!
//! Column families:
//!
//! - `default`: ("format", "MemoDB") and ("version", "0").
//! - `blocks`: (CID, content) for every persisted block.
//! - `heads`: (name, CID).
//! - `calls`: (cbor(func) ++ arg CIDs, CID).
//! - `refs`: (used CID ++ kind ++ user key, "") per reference.
//!
//! Read-modify-write mutations hold the engine write lock, which keeps
//! each key's updates linearizable without an optimistic retry loop. Every
//! mutation goes through one WriteBatch so the primary entry and its refs
//! commit together.

use std::sync::Mutex;

use memodb_ipld::{cid, load_from_ipld, save_as_ipld, Cid, Node};
use rocksdb::{ColumnFamily, DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::error::{Error, Result};
use crate::key::{self, KIND_BLOCK, KIND_CALL, KIND_HEAD};
use crate::name::{Call, Head, Name};
use crate::Store;

type Db = DBWithThreadMode<MultiThreaded>;

const FAMILIES: [&str; 4] = ["blocks", "calls", "heads", "refs"];

pub struct RocksStore {
    db: Db,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: &str, create_if_missing: bool) -> Result<RocksStore> {
        let mut options = Options::default();
        options.create_if_missing(create_if_missing);
        options.create_missing_column_families(create_if_missing);
        options.increase_parallelism(num_threads());
        let db = Db::open_cf(&options, path, FAMILIES).map_err(Error::crash)?;

        match db.get(b"format").map_err(Error::crash)? {
            None => {
                db.put(b"format", b"MemoDB").map_err(Error::crash)?;
                db.put(b"version", b"0").map_err(Error::crash)?;
            }
            Some(format) if format == b"MemoDB" => {
                let version = db.get(b"version").map_err(Error::crash)?;
                if version.as_deref() != Some(b"0") {
                    return Err(Error::crash("unsupported database version"));
                }
            }
            Some(_) => return Err(Error::crash("this is not a MemoDB database")),
        }

        Ok(RocksStore {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn family(&self, name: &str) -> std::sync::Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| unreachable!("column family {name} opened at startup"))
    }

    fn add_ref(&self, batch: &mut WriteBatch, used: &Cid, kind: u8, user: &[u8]) {
        if !cid::is_inline(used) {
            batch.put_cf(&self.family("refs"), key::ref_key(used, kind, user), []);
        }
    }

    fn del_ref(&self, batch: &mut WriteBatch, used: &[u8], kind: u8, user: &[u8]) {
        let mut entry = used.to_vec();
        entry.push(kind);
        entry.extend_from_slice(user);
        batch.delete_cf(&self.family("refs"), entry);
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch).map_err(Error::crash)
    }
}

fn num_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl Store for RocksStore {
    fn get_optional(&self, target: &Cid) -> Result<Option<Node>> {
        if cid::is_inline(target) {
            return Ok(Some(load_from_ipld(target, &[])?));
        }
        let content = self
            .db
            .get_cf(&self.family("blocks"), target.to_bytes())
            .map_err(Error::crash)?;
        match content {
            Some(bytes) => Ok(Some(load_from_ipld(target, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, node: &Node) -> Result<Cid> {
        let (target, bytes) = save_as_ipld(node);
        if bytes.is_empty() {
            return Ok(target);
        }
        let cid_bytes = target.to_bytes();
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self
            .db
            .get_cf(&self.family("blocks"), &cid_bytes)
            .map_err(Error::crash)?
            .is_some()
        {
            return Ok(target);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.family("blocks"), &cid_bytes, &bytes);
        node.each_link(&mut |link| self.add_ref(&mut batch, link, KIND_BLOCK, &cid_bytes));
        self.write(batch)?;
        Ok(target)
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>> {
        let stored = match name {
            Name::Cid(c) => return Ok(Some(*c)),
            Name::Head(head) => self
                .db
                .get_cf(&self.family("heads"), head.0.as_bytes())
                .map_err(Error::crash)?,
            Name::Call(call) => self
                .db
                .get_cf(&self.family("calls"), key::call_key(call))
                .map_err(Error::crash)?,
        };
        stored
            .map(|bytes| cid::from_bytes(&bytes).map_err(Error::from))
            .transpose()
    }

    fn set(&self, name: &Name, value: &Cid) -> Result<()> {
        let value_bytes = value.to_bytes();
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut batch = WriteBatch::default();
        match name {
            Name::Cid(_) => return Err(Error::invalid("can't set a CID")),
            Name::Head(head) => {
                let user = head.0.as_bytes();
                if let Some(old) = self
                    .db
                    .get_cf(&self.family("heads"), user)
                    .map_err(Error::crash)?
                {
                    self.del_ref(&mut batch, &old, KIND_HEAD, user);
                }
                batch.put_cf(&self.family("heads"), user, &value_bytes);
                self.add_ref(&mut batch, value, KIND_HEAD, user);
            }
            Name::Call(call) => {
                let user = key::call_key(call);
                if let Some(old) = self
                    .db
                    .get_cf(&self.family("calls"), &user)
                    .map_err(Error::crash)?
                {
                    self.del_ref(&mut batch, &old, KIND_CALL, &user);
                }
                batch.put_cf(&self.family("calls"), &user, &value_bytes);
                self.add_ref(&mut batch, value, KIND_CALL, &user);
                for arg in &call.args {
                    self.add_ref(&mut batch, arg, KIND_CALL, &user);
                }
            }
        }
        self.write(batch)
    }

    fn head_delete(&self, head: &Head) -> Result<()> {
        let user = head.0.as_bytes();
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut batch = WriteBatch::default();
        if let Some(old) = self
            .db
            .get_cf(&self.family("heads"), user)
            .map_err(Error::crash)?
        {
            self.del_ref(&mut batch, &old, KIND_HEAD, user);
        }
        batch.delete_cf(&self.family("heads"), user);
        self.write(batch)
    }

    fn call_invalidate(&self, func: &str) -> Result<()> {
        let prefix = key::func_prefix(func);
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let calls = self.family("calls");
        let iter = self.db.iterator_cf(
            &calls,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (call_key, result) = item.map_err(Error::crash)?;
            if !call_key.starts_with(&prefix) {
                break;
            }
            // One batch per call keeps each deletion atomic with its refs.
            let mut batch = WriteBatch::default();
            batch.delete_cf(&calls, &call_key);
            self.del_ref(&mut batch, &result, KIND_CALL, &call_key);
            for arg in key::parse_call_key(&call_key)?.args {
                self.del_ref(&mut batch, &arg.to_bytes(), KIND_CALL, &call_key);
            }
            self.write(batch)?;
        }
        Ok(())
    }

    fn list_names_using(&self, target: &Cid) -> Result<Vec<Name>> {
        if cid::is_inline(target) {
            return Ok(Vec::new());
        }
        let prefix = target.to_bytes();
        let refs = self.family("refs");
        let iter = self.db.iterator_cf(
            &refs,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        let mut result = Vec::new();
        for item in iter {
            let (entry, _) = item.map_err(Error::crash)?;
            if !entry.starts_with(&prefix) {
                break;
            }
            let name = key::parse_ref_user(&entry[prefix.len()..])?;
            let exists = match &name {
                Name::Cid(c) => self.has(c)?,
                other => self.resolve_optional(other)?.is_some(),
            };
            if exists {
                result.push(name);
            } else {
                log::warn!("skipping dangling refs entry for {name}");
            }
        }
        Ok(result)
    }

    fn list_funcs(&self) -> Result<Vec<String>> {
        let calls = self.family("calls");
        let mut result = std::collections::BTreeSet::new();
        for item in self.db.iterator_cf(&calls, IteratorMode::Start) {
            let (call_key, _) = item.map_err(Error::crash)?;
            result.insert(key::parse_call_key(&call_key)?.name);
        }
        Ok(result.into_iter().collect())
    }

    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()> {
        let heads = self.family("heads");
        for item in self.db.iterator_cf(&heads, IteratorMode::Start) {
            let (name, _) = item.map_err(Error::crash)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| Error::crash("invalid UTF-8 in head name"))?;
            if f(&Head(name)) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()> {
        let prefix = key::func_prefix(func);
        let calls = self.family("calls");
        let iter = self.db.iterator_cf(
            &calls,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (call_key, _) = item.map_err(Error::crash)?;
            if !call_key.starts_with(&prefix) {
                break;
            }
            let call = Call::new(func, key::parse_call_args(func, &call_key)?);
            if f(&call) {
                break;
            }
        }
        Ok(())
    }
}
