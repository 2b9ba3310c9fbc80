// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The Node value type.
//!
//! A [`Node`] is one self-describing, immutable value in the store's data
//! model. Nodes are plain values: equality is structural and kind-strict
//! (`Node::from(5)` is not equal to `Node::from(5.0)`), and mutation never
//! touches storage.

use std::collections::BTreeMap;

use cid::Cid;

use crate::error::{Error, Result};

/// Map storage. Iteration order is the key's natural byte order; the CBOR
/// encoder re-sorts into canonical length-first order when serializing.
pub type Map = BTreeMap<String, Node>;

/// List storage.
pub type List = Vec<Node>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Null,
    Bool,
    Integer,
    Float,
    Bytes,
    String,
    Link,
    List,
    Map,
}

/// A single value in the data model.
///
/// The integer kind logically covers a 65-bit range: every `i64` plus every
/// `u64` above `i64::MAX`, held here as an `i128`.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Integer(i128),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    Link(Cid),
    List(List),
    Map(Map),
}

impl Default for Node {
    fn default() -> Self {
        Node::Null
    }
}

impl Node {
    pub fn kind(&self) -> Kind {
        match self {
            Node::Null => Kind::Null,
            Node::Bool(_) => Kind::Bool,
            Node::Integer(_) => Kind::Integer,
            Node::Float(_) => Kind::Float,
            Node::Bytes(_) => Kind::Bytes,
            Node::String(_) => Kind::String,
            Node::Link(_) => Kind::Link,
            Node::List(_) => Kind::List,
            Node::Map(_) => Kind::Map,
        }
    }

    /// Byte-string constructor, disambiguated from UTF-8 strings.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Node {
        Node::Bytes(value.into())
    }

    /// UTF-8 string constructor from raw bytes, validating the encoding.
    pub fn string_from_utf8(value: Vec<u8>) -> Result<Node> {
        String::from_utf8(value)
            .map(Node::String)
            .map_err(|_| Error::InvalidUtf8)
    }

    pub fn list(items: impl Into<List>) -> Node {
        Node::List(items.into())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Node {
        Node::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Node::Bool(b) => Ok(*b),
            _ => Err(Error::WrongKind("bool")),
        }
    }

    pub fn as_integer(&self) -> Result<i128> {
        match self {
            Node::Integer(i) => Ok(*i),
            _ => Err(Error::WrongKind("integer")),
        }
    }

    /// The integer as a `u64`, for fields like timeouts and versions.
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Node::Integer(i) => u64::try_from(*i).map_err(|_| Error::WrongKind("unsigned integer")),
            _ => Err(Error::WrongKind("unsigned integer")),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Node::Float(f) => Ok(*f),
            _ => Err(Error::WrongKind("float")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Node::Bytes(b) => Ok(b),
            _ => Err(Error::WrongKind("byte string")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Node::String(s) => Ok(s),
            _ => Err(Error::WrongKind("text string")),
        }
    }

    pub fn as_link(&self) -> Result<&Cid> {
        match self {
            Node::Link(cid) => Ok(cid),
            _ => Err(Error::WrongKind("link")),
        }
    }

    pub fn as_list(&self) -> Result<&List> {
        match self {
            Node::List(items) => Ok(items),
            _ => Err(Error::WrongKind("list")),
        }
    }

    pub fn as_map(&self) -> Result<&Map> {
        match self {
            Node::Map(map) => Ok(map),
            _ => Err(Error::WrongKind("map")),
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Node::Link(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Node::Map(_))
    }

    /// Element count for lists, maps, byte strings and text strings; zero
    /// for scalar kinds.
    pub fn len(&self) -> usize {
        match self {
            Node::Bytes(b) => b.len(),
            Node::String(s) => s.len(),
            Node::List(items) => items.len(),
            Node::Map(map) => map.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List indexing.
    pub fn get(&self, index: usize) -> Option<&Node> {
        match self {
            Node::List(items) => items.get(index),
            _ => None,
        }
    }

    /// Map lookup.
    pub fn entry(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Append to a list.
    pub fn push(&mut self, value: Node) -> Result<()> {
        match self {
            Node::List(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(Error::WrongKind("list")),
        }
    }

    /// Insert or overwrite a map entry.
    pub fn insert(&mut self, key: impl Into<String>, value: Node) -> Result<()> {
        match self {
            Node::Map(map) => {
                map.insert(key.into(), value);
                Ok(())
            }
            _ => Err(Error::WrongKind("map")),
        }
    }

    /// Remove a map entry, returning the old value.
    pub fn remove(&mut self, key: &str) -> Result<Option<Node>> {
        match self {
            Node::Map(map) => Ok(map.remove(key)),
            _ => Err(Error::WrongKind("map")),
        }
    }

    /// Call `f` on every link in this value. Links are leaves of the value
    /// tree, so this never descends through them.
    pub fn each_link(&self, f: &mut impl FnMut(&Cid)) {
        match self {
            Node::Link(cid) => f(cid),
            Node::List(items) => {
                for item in items {
                    item.each_link(f);
                }
            }
            Node::Map(map) => {
                for value in map.values() {
                    value.each_link(f);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Node {
        Node::Bool(value)
    }
}

impl From<i32> for Node {
    fn from(value: i32) -> Node {
        Node::Integer(value.into())
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Node {
        Node::Integer(value.into())
    }
}

impl From<u32> for Node {
    fn from(value: u32) -> Node {
        Node::Integer(value.into())
    }
}

impl From<u64> for Node {
    fn from(value: u64) -> Node {
        Node::Integer(value.into())
    }
}

impl From<usize> for Node {
    fn from(value: usize) -> Node {
        Node::Integer(value as i128)
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Node {
        Node::Float(value)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Node {
        Node::String(value.to_owned())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Node {
        Node::String(value)
    }
}

impl From<Cid> for Node {
    fn from(value: Cid) -> Node {
        Node::Link(value)
    }
}

impl From<List> for Node {
    fn from(value: List) -> Node {
        Node::List(value)
    }
}

impl From<Map> for Node {
    fn from(value: Map) -> Node {
        Node::Map(value)
    }
}
