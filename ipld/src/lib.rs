// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The MemoDB data model.
//!
//! This crate defines the [`Node`] value type, the restricted CID profile
//! used to address nodes, and the two codecs (canonical DAG-CBOR and the
//! MemoDB JSON projection) that serialize them.

pub mod cbor;
pub mod cid;
mod error;
mod ipld;
mod node;

pub mod json;

pub use self::error::{Error, Result};
pub use self::ipld::{load_from_ipld, save_as_ipld};
pub use self::node::{Kind, List, Map, Node};

// The identifier type itself comes from the `cid` crate; this crate layers
// profile validation and the inline-CID rules on top.
pub use ::cid::Cid;
