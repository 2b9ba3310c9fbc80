// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Key derivations shared by every engine.
//!
//! Calls are keyed by `cbor(func_name) ++ arg0_cid ++ arg1_cid ++ …`, so
//! one function's calls form a contiguous key range. The refs index is
//! keyed by `used_cid ++ kind ++ user_key`, allowing a prefix scan to
//! answer "who references this CID?".

use memodb_ipld::{cbor, cid, Cid, Node};

use crate::error::{Error, Result};
use crate::name::{Call, Head, Name};

pub const KIND_BLOCK: u8 = b'b';
pub const KIND_CALL: u8 = b'c';
pub const KIND_HEAD: u8 = b'h';

/// The key prefix shared by every call of one function.
pub fn func_prefix(func: &str) -> Vec<u8> {
    cbor::encode(&Node::from(func)).bytes
}

pub fn call_key(call: &Call) -> Vec<u8> {
    let mut key = func_prefix(&call.name);
    for arg in &call.args {
        key.extend_from_slice(&arg.to_bytes());
    }
    key
}

/// Recover a call from its key.
pub fn parse_call_key(key: &[u8]) -> Result<Call> {
    let mut input = key;
    let func = cbor::decode_from_sequence(&mut input)?;
    let mut call = Call::new(func.as_str()?, Vec::new());
    while !input.is_empty() {
        call.args.push(cid::load_from_sequence(&mut input)?);
    }
    Ok(call)
}

/// Recover the argument CIDs of a call key whose function is already known.
pub fn parse_call_args(func: &str, key: &[u8]) -> Result<Vec<Cid>> {
    let prefix = func_prefix(func);
    let mut input = key
        .strip_prefix(prefix.as_slice())
        .ok_or_else(|| Error::invalid("call key does not match function"))?;
    let mut args = Vec::new();
    while !input.is_empty() {
        args.push(cid::load_from_sequence(&mut input)?);
    }
    Ok(args)
}

/// A refs-index entry key. Inline `used` CIDs are never indexed; callers
/// must skip them before calling this.
pub fn ref_key(used: &Cid, kind: u8, user: &[u8]) -> Vec<u8> {
    debug_assert!(!cid::is_inline(used));
    let mut key = used.to_bytes();
    key.push(kind);
    key.extend_from_slice(user);
    key
}

/// Decode the `kind ++ user_key` suffix of a refs entry into a name.
pub fn parse_ref_user(suffix: &[u8]) -> Result<Name> {
    let (kind, user) = suffix
        .split_first()
        .ok_or_else(|| Error::crash("missing kind in refs entry"))?;
    match *kind {
        KIND_BLOCK => Ok(Name::Cid(cid::from_bytes(user)?)),
        KIND_HEAD => {
            let name = std::str::from_utf8(user)
                .map_err(|_| Error::crash("invalid UTF-8 in refs entry"))?;
            Ok(Name::Head(Head::new(name)))
        }
        KIND_CALL => Ok(Name::Call(parse_call_key(user)?)),
        _ => Err(Error::crash("invalid kind in refs entry")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_key_round_trip() {
        let call = Call::new(
            "identity",
            vec![
                cid::parse("uAXEAAfY").unwrap(),
                cid::calculate(cid::RAW, &[1u8; 40], None).unwrap(),
            ],
        );
        let key = call_key(&call);
        assert_eq!(parse_call_key(&key).unwrap(), call);
        assert_eq!(parse_call_args("identity", &key).unwrap(), call.args);
        assert!(key.starts_with(&func_prefix("identity")));
    }

    #[test]
    fn ref_entries_round_trip() {
        let used = cid::calculate(cid::DAG_CBOR, &[2u8; 40], None).unwrap();
        let user = cid::calculate(cid::DAG_CBOR, &[3u8; 40], None).unwrap();

        let key = ref_key(&used, KIND_BLOCK, &user.to_bytes());
        assert!(key.starts_with(&used.to_bytes()));
        let suffix = &key[used.to_bytes().len()..];
        assert_eq!(parse_ref_user(suffix).unwrap(), Name::Cid(user));

        let key = ref_key(&used, KIND_HEAD, b"some/head");
        let suffix = &key[used.to_bytes().len()..];
        assert_eq!(
            parse_ref_user(suffix).unwrap(),
            Name::Head(Head::new("some/head"))
        );

        let call = Call::new("f", vec![used]);
        let key = ref_key(&used, KIND_CALL, &call_key(&call));
        let suffix = &key[used.to_bytes().len()..];
        assert_eq!(parse_ref_user(suffix).unwrap(), Name::Call(call));
    }
}
