// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reverse path enumeration over the ref-graph.

use memodb_ipld::{Cid, Node};

use crate::error::Result;
use crate::name::{Name, Path, PathStep};
use crate::Store;

/// Enumerate every path from a head or call down to `target`.
///
/// Walks `list_names_using` upward; block parents are loaded to find the
/// exact sub-locations equal to `target`, then recursed into. Cycles are
/// impossible: a block containing its own CID would make that CID depend
/// on itself.
pub fn list_paths_to(store: &dyn Store, target: &Cid) -> Result<Vec<Path>> {
    let mut result = Vec::new();
    let mut backwards = Vec::new();
    recurse(store, target, &mut backwards, &mut result)?;
    Ok(result)
}

fn recurse(
    store: &dyn Store,
    target: &Cid,
    backwards: &mut Vec<PathStep>,
    result: &mut Vec<Path>,
) -> Result<()> {
    for parent in store.list_names_using(target)? {
        if let Name::Cid(parent_cid) = &parent {
            let node = store.get(parent_cid)?;
            for subpath in paths_within(&node, target) {
                backwards.extend(subpath.iter().rev().cloned());
                recurse(store, parent_cid, backwards, result)?;
                backwards.truncate(backwards.len() - subpath.len());
            }
        } else {
            result.push(Path {
                name: parent,
                steps: backwards.iter().rev().cloned().collect(),
            });
        }
    }
    Ok(())
}

/// Every location inside `node` (not descending through links) whose value
/// is a link to `target`.
fn paths_within(node: &Node, target: &Cid) -> Vec<Vec<PathStep>> {
    let mut result = Vec::new();
    let mut current = Vec::new();
    walk(node, target, &mut current, &mut result);
    result
}

fn walk(
    node: &Node,
    target: &Cid,
    current: &mut Vec<PathStep>,
    result: &mut Vec<Vec<PathStep>>,
) {
    match node {
        Node::Link(link) => {
            if link == target {
                result.push(current.clone());
            }
        }
        Node::List(items) => {
            for (i, item) in items.iter().enumerate() {
                current.push(PathStep::Index(i));
                walk(item, target, current, result);
                current.pop();
            }
        }
        Node::Map(map) => {
            for (key, value) in map {
                current.push(PathStep::Field(key.clone()));
                walk(value, target, current, result);
                current.pop();
            }
        }
        _ => {}
    }
}
