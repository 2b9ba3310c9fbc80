// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Contract tests run against every read-write engine.

use memodb_ipld::{cid, Node};
use memodb_store::{list_paths_to, Call, Head, Name, PathStep, Store};

mod subtests {
    use super::*;

    pub fn put_get(store: &dyn Store) {
        let node = Node::map([
            ("name", Node::from("block")),
            ("data", Node::bytes(vec![1u8; 64])),
        ]);
        let cid = store.put(&node).unwrap();
        assert!(!cid::is_inline(&cid));
        assert!(store.has(&cid).unwrap());
        assert_eq!(store.get(&cid).unwrap(), node);
    }

    pub fn put_is_idempotent(store: &dyn Store) {
        let node = Node::bytes(vec![2u8; 100]);
        let first = store.put(&node).unwrap();
        let second = store.put(&node).unwrap();
        assert_eq!(first, second);
    }

    pub fn inline_nodes_resolve_without_storage(store: &dyn Store) {
        let cid = store.put(&Node::from("cookie")).unwrap();
        assert!(cid::is_inline(&cid));
        assert_eq!(cid::to_text(&cid), "uAXEAB2Zjb29raWU");
        assert_eq!(store.get(&cid).unwrap(), Node::from("cookie"));
        assert!(store.has(&cid).unwrap());
    }

    pub fn missing_block_is_not_found(store: &dyn Store) {
        let absent =
            cid::calculate(cid::RAW, b"a block that was never stored anywhere at all", None)
                .unwrap();
        assert!(store.get_optional(&absent).unwrap().is_none());
        assert!(store.get(&absent).is_err());
        assert!(!store.has(&absent).unwrap());
    }

    pub fn head_set_get_delete(store: &dyn Store) {
        let cid = store.put(&Node::bytes(vec![3u8; 50])).unwrap();
        let head = Name::Head(Head::new("latest"));
        assert!(store.resolve_optional(&head).unwrap().is_none());
        store.set(&head, &cid).unwrap();
        assert_eq!(store.resolve(&head).unwrap(), cid);

        let mut heads = Vec::new();
        store
            .each_head(&mut |h| {
                heads.push(h.clone());
                false
            })
            .unwrap();
        assert!(heads.contains(&Head::new("latest")));

        store.head_delete(&Head::new("latest")).unwrap();
        assert!(store.resolve_optional(&head).unwrap().is_none());
        assert!(store.list_names_using(&cid).unwrap().is_empty());
    }

    pub fn head_overwrite_moves_refs(store: &dyn Store) {
        let first = store.put(&Node::bytes(vec![4u8; 50])).unwrap();
        let second = store.put(&Node::bytes(vec![5u8; 50])).unwrap();
        let head = Name::Head(Head::new("moving"));
        store.set(&head, &first).unwrap();
        store.set(&head, &second).unwrap();

        assert!(!store
            .list_names_using(&first)
            .unwrap()
            .contains(&head));
        assert!(store.list_names_using(&second).unwrap().contains(&head));
    }

    pub fn call_ref_graph(store: &dyn Store) {
        let a = store.put(&Node::bytes(vec![6u8; 50])).unwrap();
        let b = store.put(&Node::bytes(vec![7u8; 50])).unwrap();
        let c = store.put(&Node::bytes(vec![8u8; 50])).unwrap();
        let call = Name::Call(Call::new("combine", vec![a, b]));
        store.set(&call, &c).unwrap();

        for used in [&a, &b, &c] {
            assert!(
                store.list_names_using(used).unwrap().contains(&call),
                "missing call ref for {used}"
            );
        }
        assert_eq!(store.resolve(&call).unwrap(), c);
    }

    pub fn block_refs(store: &dyn Store) {
        let child = store.put(&Node::bytes(vec![9u8; 50])).unwrap();
        let parent = store
            .put(&Node::map([("child", Node::Link(child))]))
            .unwrap();
        assert_eq!(
            store.list_names_using(&child).unwrap(),
            vec![Name::Cid(parent)]
        );
    }

    pub fn invalidate_clears_one_function(store: &dyn Store) {
        let x = store.put(&Node::bytes(vec![10u8; 50])).unwrap();
        let y = store.put(&Node::bytes(vec![11u8; 50])).unwrap();
        store
            .set(&Name::Call(Call::new("identity", vec![x])), &x)
            .unwrap();
        store
            .set(&Name::Call(Call::new("identity", vec![y])), &y)
            .unwrap();
        store
            .set(&Name::Call(Call::new("const_empty", vec![])), &x)
            .unwrap();

        assert_eq!(
            store.list_funcs().unwrap(),
            vec!["const_empty".to_owned(), "identity".to_owned()]
        );

        store.call_invalidate("identity").unwrap();
        assert_eq!(store.list_funcs().unwrap(), vec!["const_empty".to_owned()]);
        assert!(store
            .resolve_optional(&Name::Call(Call::new("identity", vec![x])))
            .unwrap()
            .is_none());
        // The const_empty call still references x; the identity refs are gone.
        let users = store.list_names_using(&x).unwrap();
        assert!(users.contains(&Name::Call(Call::new("const_empty", vec![]))));
        assert!(!users.contains(&Name::Call(Call::new("identity", vec![x]))));
    }

    pub fn each_call_enumerates_args(store: &dyn Store) {
        let x = store.put(&Node::bytes(vec![12u8; 50])).unwrap();
        let y = store.put(&Node::bytes(vec![13u8; 50])).unwrap();
        store
            .set(&Name::Call(Call::new("pair", vec![x, y])), &x)
            .unwrap();
        store
            .set(&Name::Call(Call::new("pair", vec![y])), &y)
            .unwrap();

        let mut calls = Vec::new();
        store
            .each_call("pair", &mut |call| {
                calls.push(call.clone());
                false
            })
            .unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&Call::new("pair", vec![x, y])));
        assert!(calls.contains(&Call::new("pair", vec![y])));

        // Early exit works.
        let mut count = 0;
        store
            .each_call("pair", &mut |_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    pub fn paths_to(store: &dyn Store) {
        let leaf = store.put(&Node::bytes(vec![14u8; 50])).unwrap();
        let middle = store
            .put(&Node::list(vec![Node::from(0i64), Node::Link(leaf)]))
            .unwrap();
        store
            .set(&Name::Head(Head::new("paths-root")), &middle)
            .unwrap();

        let paths = list_paths_to(store, &leaf).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].name, Name::Head(Head::new("paths-root")));
        assert_eq!(paths[0].steps, vec![PathStep::Index(1)]);
    }

    pub fn set_cid_name_is_invalid(store: &dyn Store) {
        let cid = store.put(&Node::bytes(vec![15u8; 50])).unwrap();
        assert!(store.set(&Name::Cid(cid), &cid).is_err());
    }
}

macro_rules! engine_tests {
    ($engine:ident, $open:expr) => {
        mod $engine {
            use super::*;

            fn run(subtest: fn(&dyn Store)) {
                let store = $open;
                subtest(store.as_ref());
            }

            #[test]
            fn put_get() {
                run(subtests::put_get);
            }
            #[test]
            fn put_is_idempotent() {
                run(subtests::put_is_idempotent);
            }
            #[test]
            fn inline_nodes_resolve_without_storage() {
                run(subtests::inline_nodes_resolve_without_storage);
            }
            #[test]
            fn missing_block_is_not_found() {
                run(subtests::missing_block_is_not_found);
            }
            #[test]
            fn head_set_get_delete() {
                run(subtests::head_set_get_delete);
            }
            #[test]
            fn head_overwrite_moves_refs() {
                run(subtests::head_overwrite_moves_refs);
            }
            #[test]
            fn call_ref_graph() {
                run(subtests::call_ref_graph);
            }
            #[test]
            fn block_refs() {
                run(subtests::block_refs);
            }
            #[test]
            fn invalidate_clears_one_function() {
                run(subtests::invalidate_clears_one_function);
            }
            #[test]
            fn each_call_enumerates_args() {
                run(subtests::each_call_enumerates_args);
            }
            #[test]
            fn paths_to() {
                run(subtests::paths_to);
            }
            #[test]
            fn set_cid_name_is_invalid() {
                run(subtests::set_cid_name_is_invalid);
            }
        }
    };
}

engine_tests!(memory, memodb_store::open("memory:", true).unwrap());
engine_tests!(sqlite_memory, memodb_store::open("sqlite:test?mode=memory", true).unwrap());

mod sqlite_disk {
    use super::*;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite:{}/store.db", dir.path().display());
        let cid = {
            let store = memodb_store::open(&uri, true).unwrap();
            let cid = store.put(&Node::bytes(vec![16u8; 50])).unwrap();
            store
                .set(&Name::Head(Head::new("persisted")), &cid)
                .unwrap();
            cid
        };
        let store = memodb_store::open(&uri, false).unwrap();
        assert_eq!(
            store.resolve(&Name::Head(Head::new("persisted"))).unwrap(),
            cid
        );
        assert_eq!(store.get(&cid).unwrap(), Node::bytes(vec![16u8; 50]));
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite:{}/nope.db", dir.path().display());
        assert!(memodb_store::open(&uri, false).is_err());
    }
}

#[cfg(feature = "rocksdb")]
mod rocks_disk {
    use super::*;

    fn run(subtest: fn(&dyn Store)) {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("rocksdb:{}/db", dir.path().display());
        let store = memodb_store::open(&uri, true).unwrap();
        subtest(store.as_ref());
    }

    #[test]
    fn put_get() {
        run(subtests::put_get);
    }
    #[test]
    fn put_is_idempotent() {
        run(subtests::put_is_idempotent);
    }
    #[test]
    fn head_set_get_delete() {
        run(subtests::head_set_get_delete);
    }
    #[test]
    fn head_overwrite_moves_refs() {
        run(subtests::head_overwrite_moves_refs);
    }
    #[test]
    fn call_ref_graph() {
        run(subtests::call_ref_graph);
    }
    #[test]
    fn invalidate_clears_one_function() {
        run(subtests::invalidate_clears_one_function);
    }
    #[test]
    fn paths_to() {
        run(subtests::paths_to);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("rocksdb:{}/db", dir.path().display());
        let cid = {
            let store = memodb_store::open(&uri, true).unwrap();
            let cid = store.put(&Node::bytes(vec![17u8; 50])).unwrap();
            store
                .set(&Name::Head(Head::new("persisted")), &cid)
                .unwrap();
            cid
        };
        let store = memodb_store::open(&uri, false).unwrap();
        assert_eq!(
            store.resolve(&Name::Head(Head::new("persisted"))).unwrap(),
            cid
        );
    }
}

#[test]
fn unknown_scheme_is_unsupported() {
    assert!(memodb_store::open("leveldb:whatever", true).is_err());
    assert!(memodb_store::open("sqlite:x?mode=bogus", true).is_err());
    assert!(memodb_store::open("sqlite://host/x", true).is_err());
}
