// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The MemoDB store: a content-addressed block store plus the mutable name
//! surface (heads and calls) and a reverse-reference index over all three.
//!
//! [`Store`] is the abstract contract; [`open`] selects an engine by URI
//! scheme. All operations are linearizable per key, and every mutation
//! updates the refs index in the same atomic step as the primary entry.

mod car;
mod error;
pub mod key;
mod memory;
mod name;
mod paths;
#[cfg(feature = "rocksdb")]
mod rocks;
mod sqlite;
mod transfer;
mod uri;

use memodb_ipld::{cid, Cid, Node};

pub use self::car::CarStore;
pub use self::error::{Error, Result};
pub use self::memory::MemoryStore;
pub use self::name::{Call, Head, Name, Path, PathStep};
pub use self::paths::list_paths_to;
#[cfg(feature = "rocksdb")]
pub use self::rocks::RocksStore;
pub use self::sqlite::SqliteStore;
pub use self::transfer::transfer;
pub use self::uri::Uri;

/// The store contract.
///
/// Engines must treat each mutating operation as one atomic transaction
/// covering both the primary entry and its refs-index entries.
pub trait Store: Send + Sync {
    /// Fetch a node. Inline CIDs resolve without touching storage.
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>>;

    /// Store a node, returning its CID. Idempotent; inline nodes are never
    /// persisted.
    fn put(&self, node: &Node) -> Result<Cid>;

    /// Resolve a name to a CID. A CID name resolves to itself.
    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>>;

    /// Point a head or call at a CID, atomically maintaining refs. Setting
    /// a CID name is an error.
    fn set(&self, name: &Name, value: &Cid) -> Result<()>;

    fn head_delete(&self, head: &Head) -> Result<()>;

    /// Delete every call under `func`, in per-call atomic batches.
    fn call_invalidate(&self, func: &str) -> Result<()>;

    /// Enumerate names whose values reference `cid`.
    ///
    /// Entries whose primary row has vanished (possible after a crash
    /// between sub-writes) are filtered out. Uses through inline CIDs are
    /// not reported, because inline CIDs are never indexed.
    fn list_names_using(&self, cid: &Cid) -> Result<Vec<Name>>;

    /// Distinct function names with at least one cached call.
    fn list_funcs(&self) -> Result<Vec<String>>;

    /// Iterate heads; the callback returns true to stop early.
    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()>;

    /// Iterate the calls of one function; the callback returns true to
    /// stop early.
    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()>;

    fn get(&self, cid: &Cid) -> Result<Node> {
        self.get_optional(cid)?.ok_or(Error::NotFound)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        if cid::is_inline(cid) {
            return Ok(true);
        }
        Ok(self.get_optional(cid)?.is_some())
    }

    fn resolve(&self, name: &Name) -> Result<Cid> {
        self.resolve_optional(name)?.ok_or(Error::NotFound)
    }
}

/// Open a store. The URI scheme selects the engine:
/// `memory:`, `sqlite:<path>[?mode=memory]`, `car:<path>`, and (when the
/// feature is enabled) `rocksdb:<path>`.
pub fn open(uri: &str, create_if_missing: bool) -> Result<Box<dyn Store>> {
    let parsed = Uri::parse(uri, true)
        .ok_or_else(|| Error::unsupported(format!("unsupported URI {uri}")))?;
    if !parsed.host.is_empty() || !parsed.fragment.is_empty() {
        return Err(Error::unsupported(format!("unsupported URI {uri}")));
    }
    let mut memory_mode = false;
    for param in &parsed.query_params {
        match param.as_str() {
            "mode=memory" if parsed.scheme == "sqlite" => memory_mode = true,
            _ => return Err(Error::unsupported(format!("unsupported URI {uri}"))),
        }
    }
    let path = parsed.path_string(0);
    log::debug!("opening {} store at {path:?}", parsed.scheme);
    match parsed.scheme.as_str() {
        "memory" => Ok(Box::new(MemoryStore::new())),
        "sqlite" if memory_mode => Ok(Box::new(SqliteStore::open_in_memory()?)),
        "sqlite" => Ok(Box::new(SqliteStore::open(&path, create_if_missing)?)),
        "car" => Ok(Box::new(CarStore::open(&path)?)),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => Ok(Box::new(RocksStore::open(&path, create_if_missing)?)),
        _ => Err(Error::unsupported(format!("unsupported URI {uri}"))),
    }
}
