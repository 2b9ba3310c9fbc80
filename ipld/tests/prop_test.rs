// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use memodb_ipld::{cbor, cid, json, save_as_ipld, Cid, Map, Node};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;

#[derive(Clone, Debug)]
struct ArbNode(Node);

impl Arbitrary for ArbNode {
    fn arbitrary(g: &mut Gen) -> Self {
        ArbNode(arbitrary_node(g, 3))
    }
}

fn arbitrary_cid(g: &mut Gen) -> Cid {
    let data = Vec::<u8>::arbitrary(g);
    let codec = if bool::arbitrary(g) { cid::RAW } else { cid::DAG_CBOR };
    cid::calculate(codec, &data, None).unwrap()
}

fn arbitrary_node(g: &mut Gen, depth: usize) -> Node {
    let scalar_kinds = 7u8;
    let kinds = if depth == 0 { scalar_kinds } else { scalar_kinds + 2 };
    match u8::arbitrary(g) % kinds {
        0 => Node::Null,
        1 => Node::Bool(bool::arbitrary(g)),
        2 => Node::Integer(i64::arbitrary(g) as i128),
        3 => Node::Integer(u64::arbitrary(g) as i128),
        4 => {
            let f = f64::arbitrary(g);
            // NaN breaks structural equality; everything else round-trips.
            Node::Float(if f.is_nan() { 0.0 } else { f })
        }
        5 => Node::Bytes(Vec::<u8>::arbitrary(g)),
        6 => Node::String(String::arbitrary(g)),
        7 if depth > 0 => {
            let len = usize::arbitrary(g) % 4;
            Node::List((0..len).map(|_| arbitrary_node(g, depth - 1)).collect())
        }
        _ => {
            if bool::arbitrary(g) {
                return Node::Link(arbitrary_cid(g));
            }
            let len = usize::arbitrary(g) % 4;
            let mut map = Map::new();
            for _ in 0..len {
                map.insert(String::arbitrary(g), arbitrary_node(g, depth - 1));
            }
            Node::Map(map)
        }
    }
}

#[quickcheck]
fn cbor_round_trip(node: ArbNode) -> bool {
    let encoded = cbor::encode(&node.0);
    cbor::decode(&encoded.bytes).unwrap() == node.0
}

#[quickcheck]
fn cbor_canonicalization_is_stable(node: ArbNode) -> bool {
    let first = cbor::encode(&node.0).bytes;
    let reencoded = cbor::encode(&cbor::decode(&first).unwrap()).bytes;
    first == reencoded
}

#[quickcheck]
fn json_round_trip(node: ArbNode) -> bool {
    let encoded = json::encode(&node.0);
    json::decode(&encoded).unwrap() == node.0
}

#[quickcheck]
fn cid_text_round_trip(data: Vec<u8>) -> bool {
    let c = cid::calculate(cid::DAG_CBOR, &data, None).unwrap();
    cid::parse(&cid::to_text(&c)).unwrap() == c
        && cid::from_bytes(&c.to_bytes()).unwrap() == c
}

#[quickcheck]
fn inline_cids_have_no_block(node: ArbNode) -> bool {
    let (c, bytes) = save_as_ipld(&node.0);
    cid::is_inline(&c) == bytes.is_empty()
}
