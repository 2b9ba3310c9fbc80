// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The restricted CID profile used by the store.
//!
//! Identifiers follow the CID specification (https://github.com/multiformats/cid),
//! narrowed to CIDv1 with codec raw or dag-cbor and hash function identity or
//! Blake2b-256. Nodes small enough to fit in the identity digest are carried
//! inline in the CID itself and never persisted as blocks.

use cid::multibase::{self, Base};
use cid::{Cid, Version};
use multihash::{Code, MultihashDigest, MultihashGeneric};

use crate::error::{Error, Result};

/// Multicodec for raw byte content.
pub const RAW: u64 = 0x55;
/// Multicodec for MerkleDAG CBOR content.
pub const DAG_CBOR: u64 = 0x71;
/// Multihash code for the identity function (inline CIDs).
pub const IDENTITY: u64 = 0x00;
/// Multihash code for Blake2b-256.
pub const BLAKE2B_256: u64 = 0xb220;

// An inline CID is <version><codec><0x00><len><payload> (3 + 1 + len bytes)
// and a hashed CID is <version><codec><a0 e4 02><0x20><digest> (6 + 32
// bytes). A payload is stored inline whenever that makes the CID no longer
// than the hashed form.
pub const MAX_INLINE_LEN: usize = 34;

/// Parse a textual CID (multibase prefix + binary CID).
///
/// Base32 lower (`b…`) and base64url (`u…`) are the bases actually produced
/// by this implementation; any base the multibase decoder understands is
/// accepted on input. Unknown codecs and hash functions are rejected.
pub fn parse(text: &str) -> Result<Cid> {
    let (_, bytes) =
        multibase::decode(text).map_err(|_| Error::InvalidCid("invalid multibase encoding"))?;
    from_bytes(&bytes)
}

/// Decode a binary CID; the input must contain exactly one CID.
pub fn from_bytes(bytes: &[u8]) -> Result<Cid> {
    let mut input = bytes;
    let cid = load_from_sequence(&mut input)?;
    if !input.is_empty() {
        return Err(Error::InvalidCid("extra bytes after CID"));
    }
    Ok(cid)
}

/// Decode the CID at the front of `input`, advancing the slice past it.
pub fn load_from_sequence(input: &mut &[u8]) -> Result<Cid> {
    let mut cursor = std::io::Cursor::new(*input);
    let cid = Cid::read_bytes(&mut cursor).map_err(|_| Error::InvalidCid("malformed CID"))?;
    validate(&cid)?;
    *input = &input[cursor.position() as usize..];
    Ok(cid)
}

/// Print a CID in the default textual form (base64url, no padding).
pub fn to_text(cid: &Cid) -> String {
    to_text_multibase(cid, Base::Base64Url)
}

pub fn to_text_multibase(cid: &Cid, base: Base) -> String {
    cid.to_string_of_base(base)
        .unwrap_or_else(|_| unreachable!("CIDv1 is printable in any multibase"))
}

/// Compute the CID of `content` under `codec`.
///
/// Returns an inline CID when the payload fits [`MAX_INLINE_LEN`] and no
/// hash override was given; otherwise a Blake2b-256 CID.
pub fn calculate(codec: u64, content: &[u8], hash_override: Option<u64>) -> Result<Cid> {
    if codec != RAW && codec != DAG_CBOR {
        return Err(Error::InvalidCid("unsupported content type"));
    }
    match hash_override {
        None if content.len() <= MAX_INLINE_LEN => {
            let hash = MultihashGeneric::<64>::wrap(IDENTITY, content)
                .map_err(|_| Error::InvalidCid("inline payload too large"))?;
            Ok(Cid::new_v1(codec, hash))
        }
        None | Some(BLAKE2B_256) => Ok(Cid::new_v1(codec, Code::Blake2b256.digest(content))),
        Some(_) => Err(Error::InvalidCid("unsupported hash function")),
    }
}

/// Whether the CID carries its payload inline (identity multihash).
pub fn is_inline(cid: &Cid) -> bool {
    cid.hash().code() == IDENTITY
}

/// The inline payload of an identity CID.
pub fn inline_payload(cid: &Cid) -> Option<&[u8]> {
    is_inline(cid).then(|| cid.hash().digest())
}

fn validate(cid: &Cid) -> Result<()> {
    if cid.version() != Version::V1 {
        return Err(Error::InvalidCid("unsupported CID version"));
    }
    if cid.codec() != RAW && cid.codec() != DAG_CBOR {
        return Err(Error::InvalidCid("unsupported content type"));
    }
    match cid.hash().code() {
        IDENTITY => {
            if cid.hash().digest().len() > MAX_INLINE_LEN {
                return Err(Error::InvalidCid("inline payload too large"));
            }
        }
        BLAKE2B_256 => {
            if cid.hash().digest().len() != 32 {
                return Err(Error::InvalidCid("incorrect Blake2b-256 digest size"));
            }
        }
        _ => return Err(Error::InvalidCid("unsupported hash function")),
    }
    Ok(())
}
