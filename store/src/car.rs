// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Read-only CARv1 engine.
//!
//! A CAR file is a varint-framed header block followed by varint-framed
//! `CID ++ content` blocks. The single root must be a map
//! `{format: "MemoDB CAR", version: 0, heads: {...}, calls: {...}}`; heads
//! and calls are resolved out of that root node, and block offsets are
//! indexed once at open. Every mutation fails: export a new file instead.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use memodb_ipld::{cbor, cid, load_from_ipld, Cid, Node};

use crate::error::{Error, Result};
use crate::name::{Call, Head, Name};
use crate::Store;

pub struct CarStore {
    file: Mutex<File>,
    root: Node,
    // CID -> (offset of the block body, body length)
    positions: HashMap<Cid, (u64, u64)>,
}

const READ_ONLY: &str = "CAR stores are read-only";

fn read_varint(file: &mut File) -> Result<Option<u64>> {
    match unsigned_varint::io::read_u64(&mut *file) {
        Ok(len) => Ok(Some(len)),
        Err(unsigned_varint::io::ReadError::Io(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Ok(None)
        }
        Err(e) => Err(Error::invalid(format!("bad varint frame: {e}"))),
    }
}

fn read_frame(file: &mut File) -> Result<Option<Vec<u8>>> {
    const MAX_ALLOC: usize = 1 << 20;
    let len = match read_varint(file)? {
        Some(len) => len,
        None => return Ok(None),
    };
    let len = usize::try_from(len).map_err(|_| Error::invalid("oversized frame"))?;
    let mut buf = Vec::with_capacity(len.min(MAX_ALLOC));
    let read = file
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(Error::crash)?;
    if read != len {
        return Err(Error::invalid("unexpected end of file in block"));
    }
    Ok(Some(buf))
}

impl CarStore {
    pub fn open(path: &str) -> Result<CarStore> {
        let mut file = File::open(path).map_err(Error::crash)?;

        let header_bytes = read_frame(&mut file)?
            .ok_or_else(|| Error::invalid("missing CAR header"))?;
        let header = cbor::decode(&header_bytes)?;
        let roots = header
            .entry("roots")
            .ok_or_else(|| Error::invalid("unsupported CAR header"))?
            .as_list()?;
        if header.entry("version") != Some(&Node::from(1u64)) || roots.len() != 1 {
            return Err(Error::invalid("unsupported CAR header"));
        }
        let root_cid = *roots[0].as_link()?;

        let mut positions = HashMap::new();
        loop {
            let frame = match read_frame(&mut file)? {
                Some(frame) => frame,
                None => break,
            };
            let mut content = frame.as_slice();
            let block_cid = cid::load_from_sequence(&mut content)?;
            // The file position now sits just past the frame, so the
            // content starts `content.len()` bytes back.
            let after = file.stream_position().map_err(Error::crash)?;
            positions.insert(block_cid, (after - content.len() as u64, content.len() as u64));
        }

        let mut store = CarStore {
            file: Mutex::new(file),
            root: Node::Null,
            positions,
        };
        let root = store
            .get_optional(&root_cid)?
            .ok_or_else(|| Error::invalid("CAR root block missing"))?;
        if root.entry("format") != Some(&Node::from("MemoDB CAR"))
            || root.entry("version") != Some(&Node::from(0u64))
        {
            return Err(Error::invalid("unsupported MemoDB CAR version"));
        }
        store.root = root;
        Ok(store)
    }

    fn calls_for(&self, func: &str) -> Option<&Node> {
        self.root.entry("calls")?.entry(func)
    }
}

/// Call-table keys inside the root node: args printed in the default
/// textual form, joined by "/".
fn args_key(args: &[Cid]) -> String {
    args.iter().map(cid::to_text).collect::<Vec<_>>().join("/")
}

impl Store for CarStore {
    fn get_optional(&self, target: &Cid) -> Result<Option<Node>> {
        if cid::is_inline(target) {
            return Ok(Some(load_from_ipld(target, &[])?));
        }
        let (offset, len) = match self.positions.get(target) {
            Some(position) => *position,
            None => return Ok(None),
        };
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.seek(SeekFrom::Start(offset)).map_err(Error::crash)?;
        let mut content =
            vec![0u8; usize::try_from(len).map_err(|_| Error::crash("oversized block"))?];
        file.read_exact(&mut content)
            .map_err(|_| Error::crash("file changed while reading"))?;
        drop(file);
        Ok(Some(load_from_ipld(target, &content)?))
    }

    fn put(&self, _node: &Node) -> Result<Cid> {
        Err(Error::unsupported(READ_ONLY))
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>> {
        match name {
            Name::Cid(c) => Ok(Some(*c)),
            Name::Head(head) => match self.root.entry("heads").and_then(|h| h.entry(&head.0)) {
                Some(node) => Ok(Some(*node.as_link()?)),
                None => Ok(None),
            },
            Name::Call(call) => {
                let entry = self
                    .calls_for(&call.name)
                    .and_then(|calls| calls.entry(&args_key(&call.args)));
                match entry.and_then(|e| e.entry("result")) {
                    Some(node) => Ok(Some(*node.as_link()?)),
                    None => Ok(None),
                }
            }
        }
    }

    fn set(&self, _name: &Name, _value: &Cid) -> Result<()> {
        Err(Error::unsupported(READ_ONLY))
    }

    fn head_delete(&self, _head: &Head) -> Result<()> {
        Err(Error::unsupported(READ_ONLY))
    }

    fn call_invalidate(&self, _func: &str) -> Result<()> {
        Err(Error::unsupported(READ_ONLY))
    }

    fn list_names_using(&self, _cid: &Cid) -> Result<Vec<Name>> {
        // There is no refs index in a CAR file. This function is not
        // required to find every reference.
        Ok(Vec::new())
    }

    fn list_funcs(&self) -> Result<Vec<String>> {
        match self.root.entry("calls") {
            Some(calls) => Ok(calls.as_map()?.keys().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()> {
        if let Some(heads) = self.root.entry("heads") {
            for name in heads.as_map()?.keys() {
                if f(&Head::new(name.clone())) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()> {
        if let Some(calls) = self.calls_for(func) {
            for entry in calls.as_map()?.values() {
                let mut call = Call::new(func, Vec::new());
                for arg in entry
                    .entry("args")
                    .ok_or_else(|| Error::invalid("malformed CAR call entry"))?
                    .as_list()?
                {
                    call.args.push(*arg.as_link()?);
                }
                if f(&call) {
                    break;
                }
            }
        }
        Ok(())
    }
}
