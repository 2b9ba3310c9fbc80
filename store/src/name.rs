// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Names: the unit of addressing at the API boundary.

use std::fmt;

use memodb_ipld::{cid, Cid};

use crate::uri::Uri;

/// A mutable, named pointer into the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Head(pub String);

impl Head {
    pub fn new(name: impl Into<String>) -> Head {
        Head(name.into())
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A memoized function invocation: `(func_name, [arg_cid…])`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Call {
    pub name: String,
    pub args: Vec<Cid>,
}

impl Call {
    pub fn new(name: impl Into<String>, args: Vec<Cid>) -> Call {
        Call {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call:{}", self.name)?;
        for arg in &self.args {
            write!(f, "/{}", cid::to_text(arg))?;
        }
        Ok(())
    }
}

/// One of the three ways to address a value in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Name {
    Cid(Cid),
    Head(Head),
    Call(Call),
}

impl Name {
    /// Render the name as a server-relative URI.
    pub fn to_uri(&self) -> Uri {
        let mut uri = Uri::default();
        match self {
            Name::Cid(c) => {
                uri.path_segments = vec!["cid".to_owned(), cid::to_text(c)];
            }
            Name::Head(head) => {
                uri.path_segments = vec!["head".to_owned(), head.0.clone()];
                uri.escape_slashes_in_segments = false;
            }
            Name::Call(call) => {
                let args: Vec<String> = call.args.iter().map(cid::to_text).collect();
                uri.path_segments = vec!["call".to_owned(), call.name.clone(), args.join(",")];
            }
        }
        uri
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Cid(c) => f.write_str(&cid::to_text(c)),
            Name::Head(head) => write!(f, "heads[{:?}]", head.0),
            Name::Call(call) => call.fmt(f),
        }
    }
}

impl From<Cid> for Name {
    fn from(value: Cid) -> Name {
        Name::Cid(value)
    }
}

impl From<Head> for Name {
    fn from(value: Head) -> Name {
        Name::Head(value)
    }
}

impl From<Call> for Name {
    fn from(value: Call) -> Name {
        Name::Call(value)
    }
}

/// One step of a path from a name down into a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStep {
    Index(usize),
    Field(String),
}

/// A location of a value: a root name plus steps through lists and maps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    pub name: Name,
    pub steps: Vec<PathStep>,
}
