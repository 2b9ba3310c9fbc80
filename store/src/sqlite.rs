// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! SQLite engine.
//!
//! Every mutation runs inside one transaction covering the primary table
//! and the refs index, so crashes can never split them. SQLite serializes
//! writers itself; the connection mutex here just makes the handle Sync.

use std::sync::Mutex;

use memodb_ipld::{cid, load_from_ipld, save_as_ipld, Cid, Node};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Error, Result};
use crate::key::{self, KIND_BLOCK, KIND_CALL, KIND_HEAD};
use crate::name::{Call, Head, Name};
use crate::Store;

const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS meta(
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS blocks(
  cid BLOB PRIMARY KEY,
  content BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS heads(
  name TEXT PRIMARY KEY,
  cid BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS calls(
  key BLOB PRIMARY KEY,
  func TEXT NOT NULL,
  result BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS calls_func ON calls(func);
CREATE TABLE IF NOT EXISTS refs(
  used BLOB NOT NULL,
  kind INTEGER NOT NULL,
  user BLOB NOT NULL,
  PRIMARY KEY(used, kind, user)
) WITHOUT ROWID;
";

/// How many calls are deleted per transaction during invalidation.
const INVALIDATE_BATCH: i64 = 256;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str, create_if_missing: bool) -> Result<SqliteStore> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(path, flags).map_err(Error::crash)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<SqliteStore> {
        let conn = Connection::open_in_memory().map_err(Error::crash)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<SqliteStore> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", 1).ok();
        conn.execute_batch(INIT_SQL).map_err(Error::crash)?;

        let format: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'format'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Error::crash)?;
        match format.as_deref() {
            None => {
                conn.execute(
                    "INSERT INTO meta(key, value) VALUES ('format', 'MemoDB'), ('version', '0')",
                    [],
                )
                .map_err(Error::crash)?;
            }
            Some("MemoDB") => {
                let version: String = conn
                    .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                        row.get(0)
                    })
                    .map_err(Error::crash)?;
                if version != "0" {
                    return Err(Error::crash("unsupported database version"));
                }
            }
            Some(_) => return Err(Error::crash("this is not a MemoDB database")),
        }
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn add_ref(tx: &rusqlite::Transaction<'_>, used: &Cid, kind: u8, user: &[u8]) -> Result<()> {
    if cid::is_inline(used) {
        return Ok(());
    }
    tx.execute(
        "INSERT OR IGNORE INTO refs(used, kind, user) VALUES (?1, ?2, ?3)",
        params![used.to_bytes(), kind, user],
    )
    .map_err(Error::crash)?;
    Ok(())
}

fn del_ref(tx: &rusqlite::Transaction<'_>, used: &[u8], kind: u8, user: &[u8]) -> Result<()> {
    tx.execute(
        "DELETE FROM refs WHERE used = ?1 AND kind = ?2 AND user = ?3",
        params![used, kind, user],
    )
    .map_err(Error::crash)?;
    Ok(())
}

impl Store for SqliteStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>> {
        if cid::is_inline(cid) {
            return Ok(Some(load_from_ipld(cid, &[])?));
        }
        let conn = self.lock();
        let content: Option<Vec<u8>> = conn
            .query_row(
                "SELECT content FROM blocks WHERE cid = ?1",
                params![cid.to_bytes()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::crash)?;
        match content {
            Some(bytes) => Ok(Some(load_from_ipld(cid, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, node: &Node) -> Result<Cid> {
        let (cid, bytes) = save_as_ipld(node);
        if bytes.is_empty() {
            return Ok(cid);
        }
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(Error::crash)?;
        let cid_bytes = cid.to_bytes();
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM blocks WHERE cid = ?1",
                params![cid_bytes],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::crash)?;
        if exists.is_none() {
            tx.execute(
                "INSERT INTO blocks(cid, content) VALUES (?1, ?2)",
                params![cid_bytes, bytes],
            )
            .map_err(Error::crash)?;
            let mut ref_error = Ok(());
            node.each_link(&mut |link| {
                if ref_error.is_ok() {
                    ref_error = add_ref(&tx, link, KIND_BLOCK, &cid_bytes);
                }
            });
            ref_error?;
        }
        tx.commit().map_err(Error::crash)?;
        Ok(cid)
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>> {
        let conn = self.lock();
        let stored: Option<Vec<u8>> = match name {
            Name::Cid(c) => return Ok(Some(*c)),
            Name::Head(head) => conn
                .query_row(
                    "SELECT cid FROM heads WHERE name = ?1",
                    params![head.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::crash)?,
            Name::Call(call) => conn
                .query_row(
                    "SELECT result FROM calls WHERE key = ?1",
                    params![key::call_key(call)],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::crash)?,
        };
        stored.map(|bytes| cid::from_bytes(&bytes).map_err(Error::from)).transpose()
    }

    fn set(&self, name: &Name, value: &Cid) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(Error::crash)?;
        match name {
            Name::Cid(_) => return Err(Error::invalid("can't set a CID")),
            Name::Head(head) => {
                let old: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT cid FROM heads WHERE name = ?1",
                        params![head.0],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(Error::crash)?;
                if let Some(old) = old {
                    del_ref(&tx, &old, KIND_HEAD, head.0.as_bytes())?;
                }
                tx.execute(
                    "INSERT OR REPLACE INTO heads(name, cid) VALUES (?1, ?2)",
                    params![head.0, value.to_bytes()],
                )
                .map_err(Error::crash)?;
                add_ref(&tx, value, KIND_HEAD, head.0.as_bytes())?;
            }
            Name::Call(call) => {
                let call_key = key::call_key(call);
                let old: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT result FROM calls WHERE key = ?1",
                        params![call_key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(Error::crash)?;
                if let Some(old) = old {
                    del_ref(&tx, &old, KIND_CALL, &call_key)?;
                }
                tx.execute(
                    "INSERT OR REPLACE INTO calls(key, func, result) VALUES (?1, ?2, ?3)",
                    params![call_key, call.name, value.to_bytes()],
                )
                .map_err(Error::crash)?;
                add_ref(&tx, value, KIND_CALL, &call_key)?;
                for arg in &call.args {
                    add_ref(&tx, arg, KIND_CALL, &call_key)?;
                }
            }
        }
        tx.commit().map_err(Error::crash)
    }

    fn head_delete(&self, head: &Head) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(Error::crash)?;
        let old: Option<Vec<u8>> = tx
            .query_row(
                "SELECT cid FROM heads WHERE name = ?1",
                params![head.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::crash)?;
        if let Some(old) = old {
            del_ref(&tx, &old, KIND_HEAD, head.0.as_bytes())?;
        }
        tx.execute("DELETE FROM heads WHERE name = ?1", params![head.0])
            .map_err(Error::crash)?;
        tx.commit().map_err(Error::crash)
    }

    fn call_invalidate(&self, func: &str) -> Result<()> {
        loop {
            let mut conn = self.lock();
            let tx = conn.transaction().map_err(Error::crash)?;
            let batch: Vec<(Vec<u8>, Vec<u8>)> = {
                let mut stmt = tx
                    .prepare("SELECT key, result FROM calls WHERE func = ?1 LIMIT ?2")
                    .map_err(Error::crash)?;
                let rows = stmt
                    .query_map(params![func, INVALIDATE_BATCH], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(Error::crash)?;
                rows.collect::<rusqlite::Result<_>>().map_err(Error::crash)?
            };
            if batch.is_empty() {
                return Ok(());
            }
            for (call_key, result) in &batch {
                del_ref(&tx, result, KIND_CALL, call_key)?;
                for arg in key::parse_call_key(call_key)?.args {
                    del_ref(&tx, &arg.to_bytes(), KIND_CALL, call_key)?;
                }
                tx.execute("DELETE FROM calls WHERE key = ?1", params![call_key])
                    .map_err(Error::crash)?;
            }
            tx.commit().map_err(Error::crash)?;
        }
    }

    fn list_names_using(&self, cid: &Cid) -> Result<Vec<Name>> {
        if cid::is_inline(cid) {
            return Ok(Vec::new());
        }
        let users: Vec<(u8, Vec<u8>)> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT kind, user FROM refs WHERE used = ?1")
                .map_err(Error::crash)?;
            let rows = stmt
                .query_map(params![cid.to_bytes()], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(Error::crash)?;
            rows.collect::<rusqlite::Result<_>>().map_err(Error::crash)?
        };
        let mut result = Vec::new();
        for (kind, user) in users {
            let mut suffix = vec![kind];
            suffix.extend_from_slice(&user);
            let name = key::parse_ref_user(&suffix)?;
            // A crash between sub-writes can leave a dangling entry; skip
            // entries whose primary row is gone.
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
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT func FROM calls ORDER BY func")
            .map_err(Error::crash)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(Error::crash)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Error::crash)
    }

    fn each_head(&self, f: &mut dyn FnMut(&Head) -> bool) -> Result<()> {
        let names: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT name FROM heads ORDER BY name")
                .map_err(Error::crash)?;
            let rows = stmt.query_map([], |row| row.get(0)).map_err(Error::crash)?;
            rows.collect::<rusqlite::Result<_>>().map_err(Error::crash)?
        };
        for name in names {
            if f(&Head(name)) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<()> {
        let keys: Vec<Vec<u8>> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT key FROM calls WHERE func = ?1 ORDER BY key")
                .map_err(Error::crash)?;
            let rows = stmt
                .query_map(params![func], |row| row.get(0))
                .map_err(Error::crash)?;
            rows.collect::<rusqlite::Result<_>>().map_err(Error::crash)?
        };
        for call_key in keys {
            let call = Call::new(func, key::parse_call_args(func, &call_key)?);
            if f(&call) {
                break;
            }
        }
        Ok(())
    }
}
