// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::sync::{Arc, OnceLock};

use memodb_ipld::{cid, Cid, Node};
use memodb_store::Store;

use crate::evaluator::EvalError;

/// A lazy handle to a stored node: the CID is always available, the node
/// itself is loaded from the store on first access and cached.
#[derive(Clone)]
pub struct Link {
    store: Arc<dyn Store>,
    cid: Cid,
    node: Arc<OnceLock<Node>>,
}

impl Link {
    pub fn new(store: Arc<dyn Store>, cid: Cid) -> Link {
        Link {
            store,
            cid,
            node: Arc::new(OnceLock::new()),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Load the node, caching it for later accesses.
    pub fn node(&self) -> Result<&Node, EvalError> {
        if let Some(node) = self.node.get() {
            return Ok(node);
        }
        let loaded = self.store.get(&self.cid).map_err(EvalError::from)?;
        Ok(self.node.get_or_init(|| loaded))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Link").field(&cid::to_text(&self.cid)).finish()
    }
}
