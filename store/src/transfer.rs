// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Copying values between stores using only the public contract.

use std::collections::HashSet;

use memodb_ipld::{cid, Cid};

use crate::error::Result;
use crate::name::Name;
use crate::Store;

/// Copy the given names and every block reachable from them from `src`
/// into `dst`. Blocks are written children-first, and the head / call
/// pointers last, so `dst` never exposes a name whose closure is missing.
pub fn transfer(src: &dyn Store, dst: &dyn Store, names: &[Name]) -> Result<()> {
    let mut copied = HashSet::new();
    for name in names {
        let root = src.resolve(name)?;
        copy_closure(src, dst, &root, &mut copied)?;
        match name {
            Name::Cid(_) => {}
            other => dst.set(other, &root)?,
        }
    }
    Ok(())
}

fn copy_closure(
    src: &dyn Store,
    dst: &dyn Store,
    target: &Cid,
    copied: &mut HashSet<Cid>,
) -> Result<()> {
    if cid::is_inline(target) || !copied.insert(*target) {
        return Ok(());
    }
    if dst.has(target)? {
        return Ok(());
    }
    let node = src.get(target)?;
    let mut links = Vec::new();
    node.each_link(&mut |link| links.push(*link));
    for link in links {
        copy_closure(src, dst, &link, copied)?;
    }
    dst.put(&node)?;
    Ok(())
}
