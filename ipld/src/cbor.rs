// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The DAG-CBOR codec.
//!
//! Decoding accepts a superset of DAG-CBOR for compatibility with data
//! written by older tools: indefinite-length strings and containers, and
//! map keys that are byte strings or lists (coerced to UTF-8 text).
//! Encoding is strictly canonical: shortest integer heads, 64-bit floats
//! only, definite lengths, and maps sorted by the length-first order of the
//! encoded key, so equal nodes always produce byte-identical output.
//!
//! https://ipld.io/specs/codecs/dag-cbor/spec/

use crate::cid;
use crate::error::{Error, Result};
use crate::node::{Map, Node};

const CID_TAG: u64 = 42;

/// Result of encoding a node.
pub struct Encoded {
    pub bytes: Vec<u8>,
    /// False when the input could not be represented canonically (a
    /// non-finite float, or an integer above `i64::MAX`). The bytes are
    /// still produced.
    pub canonical: bool,
    /// Whether any link (tag 42) was emitted.
    pub has_links: bool,
}

/// Encode a node in canonical DAG-CBOR.
pub fn encode(node: &Node) -> Encoded {
    let mut encoder = Encoder::default();
    encoder.encode_node(node);
    Encoded {
        bytes: encoder.out,
        canonical: !encoder.not_dag_cbor,
        has_links: encoder.has_links,
    }
}

/// Decode exactly one data item.
pub fn decode(input: &[u8]) -> Result<Node> {
    let mut input = input;
    let node = decode_from_sequence(&mut input)?;
    if !input.is_empty() {
        return Err(Error::MalformedCbor("extra bytes after data item"));
    }
    Ok(node)
}

/// Decode the data item at the front of `input`, advancing past it.
pub fn decode_from_sequence(input: &mut &[u8]) -> Result<Node> {
    decode_item(input)
}

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
    has_links: bool,
    not_dag_cbor: bool,
}

impl Encoder {
    /// Encode one data-item head. `force_additional` pins the additional
    /// information value (and so the argument width); zero means shortest.
    fn head(&mut self, major: u8, argument: u64, force_additional: u8) {
        let additional = match force_additional {
            0 if argument < 24 => {
                self.out.push(major << 5 | argument as u8);
                return;
            }
            0 if argument < 0x100 => 24,
            0 if argument < 0x10000 => 25,
            0 if argument < 0x1_0000_0000 => 26,
            0 => 27,
            forced => forced,
        };
        self.out.push(major << 5 | additional);
        let num_bytes = 1usize << (additional - 24);
        for i in 0..num_bytes {
            self.out.push((argument >> (8 * (num_bytes - i - 1))) as u8);
        }
    }

    fn encode_node(&mut self, node: &Node) {
        match node {
            Node::Null => self.head(7, 22, 0),
            Node::Bool(false) => self.head(7, 20, 0),
            Node::Bool(true) => self.head(7, 21, 0),
            Node::Integer(value) => self.encode_integer(*value),
            Node::Float(value) => {
                if !value.is_finite() {
                    self.not_dag_cbor = true;
                }
                // DAG-CBOR allows only 64-bit floats. Normalize NaN to the
                // quiet pattern so equal nodes encode identically.
                let bits = if value.is_nan() {
                    0x7ff8_0000_0000_0000
                } else {
                    value.to_bits()
                };
                self.head(7, bits, 27);
            }
            Node::Bytes(bytes) => {
                self.head(2, bytes.len() as u64, 0);
                self.out.extend_from_slice(bytes);
            }
            Node::String(text) => {
                self.head(3, text.len() as u64, 0);
                self.out.extend_from_slice(text.as_bytes());
            }
            Node::Link(link) => {
                // https://github.com/ipld/cid-cbor/
                let bytes = link.to_bytes();
                self.head(6, CID_TAG, 0);
                self.head(2, bytes.len() as u64 + 1, 0);
                self.out.push(0x00); // DAG-CBOR requires the multibase prefix
                self.out.extend_from_slice(&bytes);
                self.has_links = true;
            }
            Node::List(items) => {
                self.head(4, items.len() as u64, 0);
                for item in items {
                    self.encode_node(item);
                }
            }
            Node::Map(map) => self.encode_map(map),
        }
    }

    fn encode_integer(&mut self, value: i128) {
        if value < 0 {
            let arg = -(value + 1);
            self.head(1, arg.min(i64::MAX as i128) as u64, 0);
        } else {
            if value > i64::MAX as i128 {
                self.not_dag_cbor = true;
            }
            self.head(0, value.min(u64::MAX as i128) as u64, 0);
        }
    }

    fn encode_map(&mut self, map: &Map) {
        let mut items: Vec<(Vec<u8>, &Node)> = map
            .iter()
            .map(|(key, value)| {
                let mut key_encoder = Encoder::default();
                key_encoder.encode_node(&Node::String(key.clone()));
                (key_encoder.out, value)
            })
            .collect();
        // RFC 8949 §4.2.3 length-first ordering of the encoded keys.
        items.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));
        self.head(5, items.len() as u64, 0);
        for (key_bytes, value) in items {
            self.out.extend_from_slice(&key_bytes);
            self.encode_node(value);
        }
    }
}

struct Head {
    major: u8,
    minor: u8,
    argument: u64,
    indefinite: bool,
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Error::MalformedCbor("unexpected end of input"));
    }
    let (front, rest) = input.split_at(n);
    *input = rest;
    Ok(front)
}

fn read_head(input: &mut &[u8]) -> Result<Head> {
    let byte = take(input, 1)?[0];
    let major = byte >> 5;
    let minor = byte & 0x1f;
    let mut argument = 0u64;
    let mut indefinite = false;
    if minor < 24 {
        argument = minor as u64;
    } else if minor < 28 {
        let num_bytes = 1usize << (minor - 24);
        for &b in take(input, num_bytes)? {
            argument = argument << 8 | b as u64;
        }
    } else if minor == 31 {
        indefinite = true;
    } else {
        return Err(Error::MalformedCbor("invalid additional information"));
    }
    Ok(Head {
        major,
        minor,
        argument,
        indefinite,
    })
}

/// Collect the content of a (possibly indefinite-length) string item.
fn read_string(input: &mut &[u8], head: &Head) -> Result<Vec<u8>> {
    if !head.indefinite {
        let len = usize::try_from(head.argument)
            .map_err(|_| Error::MalformedCbor("string too large"))?;
        if input.len() < len {
            return Err(Error::MalformedCbor("missing data from string"));
        }
        return Ok(take(input, len)?.to_vec());
    }
    let mut result = Vec::new();
    loop {
        if input.first() == Some(&0xff) {
            take(input, 1)?;
            return Ok(result);
        }
        let chunk = read_head(input)?;
        if chunk.major != head.major {
            return Err(Error::MalformedCbor("invalid indefinite-length string"));
        }
        if chunk.indefinite {
            return Err(Error::MalformedCbor("nested indefinite-length strings"));
        }
        let len = usize::try_from(chunk.argument)
            .map_err(|_| Error::MalformedCbor("string too large"))?;
        if input.len() < len {
            return Err(Error::MalformedCbor("missing data from string"));
        }
        result.extend_from_slice(take(input, len)?);
    }
}

/// Whether another element follows in a (possibly indefinite) container.
fn next_item(input: &mut &[u8], remaining: &mut u64, indefinite: bool) -> Result<bool> {
    if indefinite {
        if input.first() == Some(&0xff) {
            take(input, 1)?;
            return Ok(false);
        }
        if input.is_empty() {
            return Err(Error::MalformedCbor("unexpected end of input"));
        }
        Ok(true)
    } else if *remaining > 0 {
        *remaining -= 1;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Legacy producers sometimes wrote map keys as byte strings that are not
/// valid UTF-8. Keys must be text, so such bytes are interpreted as
/// ISO-8859-1 and up-projected to UTF-8.
pub(crate) fn latin1_to_utf8(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_item(input: &mut &[u8]) -> Result<Node> {
    // Tags are transparent except tag 42, which marks a CID.
    let mut is_cid = false;
    let head = loop {
        let head = read_head(input)?;
        if head.major != 6 {
            break head;
        }
        if head.indefinite {
            return Err(Error::MalformedCbor("tags may not be indefinite"));
        }
        if head.argument == CID_TAG {
            is_cid = true;
        }
    };
    if is_cid && head.major != 2 {
        return Err(Error::MalformedCbor("invalid CID type"));
    }

    match head.major {
        0 => {
            if head.indefinite {
                return Err(Error::MalformedCbor("integers may not be indefinite"));
            }
            Ok(Node::Integer(head.argument as i128))
        }
        1 => {
            if head.indefinite {
                return Err(Error::MalformedCbor("integers may not be indefinite"));
            }
            if head.argument > i64::MAX as u64 {
                return Err(Error::MalformedCbor("integer too large"));
            }
            Ok(Node::Integer(-1 - head.argument as i128))
        }
        2 => {
            let bytes = read_string(input, &head)?;
            if is_cid {
                if bytes.first() != Some(&0x00) {
                    return Err(Error::MalformedCbor("invalid encoded CID"));
                }
                let link = cid::from_bytes(&bytes[1..])
                    .map_err(|_| Error::MalformedCbor("invalid encoded CID"))?;
                return Ok(Node::Link(link));
            }
            Ok(Node::Bytes(bytes))
        }
        3 => {
            let bytes = read_string(input, &head)?;
            String::from_utf8(bytes)
                .map(Node::String)
                .map_err(|_| Error::MalformedCbor("invalid UTF-8 in string"))
        }
        4 => {
            let mut remaining = head.argument;
            let mut items = Vec::new();
            while next_item(input, &mut remaining, head.indefinite)? {
                items.push(decode_item(input)?);
            }
            Ok(Node::List(items))
        }
        5 => {
            let mut remaining = head.argument;
            let mut map = Map::new();
            while next_item(input, &mut remaining, head.indefinite)? {
                let key_node = decode_item(input)?;
                let key = match key_node {
                    Node::String(text) => text,
                    Node::Bytes(bytes) => latin1_to_utf8(&bytes),
                    // Needed for a legacy corpus that used list keys.
                    Node::List(_) => latin1_to_utf8(&encode(&key_node).bytes),
                    _ => return Err(Error::MalformedCbor("map keys must be strings")),
                };
                let value = decode_item(input)?;
                if map.insert(key, value).is_some() {
                    return Err(Error::MalformedCbor("duplicate map key"));
                }
            }
            Ok(Node::Map(map))
        }
        7 => {
            if head.indefinite {
                return Err(Error::MalformedCbor("unexpected break code"));
            }
            match head.minor {
                20 => Ok(Node::Bool(false)),
                21 => Ok(Node::Bool(true)),
                22 => Ok(Node::Null),
                23 => Ok(Node::Null), // undefined becomes null
                25 => Ok(Node::Float(decode_float(head.argument, 16, 10, 15))),
                26 => Ok(Node::Float(decode_float(head.argument, 32, 23, 127))),
                27 => Ok(Node::Float(f64::from_bits(head.argument))),
                _ => Err(Error::MalformedCbor("unsupported simple value")),
            }
        }
        _ => unreachable!("tags are consumed above"),
    }
}

/// Widen a 16- or 32-bit IEEE 754 value to f64.
fn decode_float(value: u64, total_size: u32, mantissa_size: u32, exponent_bias: i32) -> f64 {
    let exponent_mask = (1u64 << (total_size - mantissa_size - 1)) - 1;
    let exponent = (value >> mantissa_size) & exponent_mask;
    let mantissa = value & ((1u64 << mantissa_size) - 1);
    let magnitude = if exponent == 0 {
        // denormal
        mantissa as f64 * (2f64).powi(1 - (mantissa_size as i32 + exponent_bias))
    } else if exponent == exponent_mask {
        if mantissa == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        (mantissa + (1u64 << mantissa_size)) as f64
            * (2f64).powi(exponent as i32 - (mantissa_size as i32 + exponent_bias))
    };
    if value & (1u64 << (total_size - 1)) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
