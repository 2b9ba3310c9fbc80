// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Mapping between nodes and IPLD blocks.

use cid::Cid;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::{cbor, cid as cidutil};

/// Serialize a node for storage, returning its CID and block content.
///
/// Byte-string nodes are stored under the raw codec with their content as
/// the block; everything else is canonical DAG-CBOR. When the CID comes out
/// inline the returned bytes are empty (inline CIDs are never persisted).
pub fn save_as_ipld(node: &Node) -> (Cid, Vec<u8>) {
    let (codec, payload) = match node {
        Node::Bytes(bytes) => (cidutil::RAW, bytes.clone()),
        _ => (cidutil::DAG_CBOR, cbor::encode(node).bytes),
    };
    let cid = cidutil::calculate(codec, &payload, None)
        .unwrap_or_else(|_| unreachable!("codec is always valid here"));
    if cidutil::is_inline(&cid) {
        (cid, Vec::new())
    } else {
        (cid, payload)
    }
}

/// Reconstruct a node from a CID and its block content.
///
/// For inline CIDs, `content` must be empty and the CID's own payload is
/// decoded. The hash of non-inline content is not re-verified here; that is
/// the store engine's responsibility.
pub fn load_from_ipld(cid: &Cid, content: &[u8]) -> Result<Node> {
    let payload = match cidutil::inline_payload(cid) {
        Some(inline) => {
            debug_assert!(content.is_empty());
            inline
        }
        None => content,
    };
    match cid.codec() {
        cidutil::RAW => Ok(Node::Bytes(payload.to_vec())),
        cidutil::DAG_CBOR => cbor::decode(payload),
        _ => Err(Error::InvalidCid("unsupported content type")),
    }
}
