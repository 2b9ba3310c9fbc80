// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memodb::{cid, EvalError, Evaluator, Node, NodeOrCid};
use memodb_store::{Call, MemoryStore, Name, Store};

fn new_evaluator(threads: usize) -> Evaluator {
    Evaluator::local(Arc::new(MemoryStore::new()), threads)
}

#[test]
fn nullary() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("nullary", |_, _| Ok(NodeOrCid::Node(Node::from("nullary"))));

    let call = Call::new("nullary", vec![]);
    let result = evaluator.evaluate(&call).unwrap();
    assert_eq!(result.cid(), &cid::parse("uAXEACGdudWxsYXJ5").unwrap());
    assert_eq!(result.node().unwrap(), &Node::from("nullary"));

    // The result is memoized through the store.
    assert_eq!(
        evaluator
            .store()
            .resolve(&Name::Call(call))
            .unwrap(),
        cid::parse("uAXEACGdudWxsYXJ5").unwrap()
    );
}

#[test]
fn nullary_cached() {
    let evaluator = new_evaluator(0);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    evaluator.register_func("nullary", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOrCid::Node(Node::from("nullary")))
    });

    let call = Call::new("nullary", vec![]);
    let cached = cid::parse("uAXEACGdudWxsYXJ5").unwrap();
    evaluator
        .store()
        .set(&Name::Call(call.clone()), &cached)
        .unwrap();
    assert_eq!(evaluator.evaluate(&call).unwrap().cid(), &cached);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn unary() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("unary", |_, args| {
        Ok(NodeOrCid::Node(Node::map([(
            "unary",
            args[0].node()?.clone(),
        )])))
    });

    let arg = evaluator.store().put(&Node::from("test")).unwrap();
    assert_eq!(arg, cid::parse("uAXEABWR0ZXN0").unwrap());
    let result = evaluator.evaluate(&Call::new("unary", vec![arg])).unwrap();
    assert_eq!(result.cid(), &cid::parse("uAXEADKFldW5hcnlkdGVzdA").unwrap());
}

#[test]
fn binary() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("binary", |_, args| {
        let a = args[0].node()?.as_integer().map_err(|e| EvalError::FuncFailed(e.to_string()))?;
        let b = args[1].node()?.as_integer().map_err(|e| EvalError::FuncFailed(e.to_string()))?;
        Ok(NodeOrCid::Node(Node::Integer(a - b)))
    });

    let a = evaluator.store().put(&Node::from(5i64)).unwrap();
    let b = evaluator.store().put(&Node::from(3i64)).unwrap();
    assert_eq!(a, cid::parse("uAXEAAQU").unwrap());
    assert_eq!(b, cid::parse("uAXEAAQM").unwrap());
    let result = evaluator.evaluate(&Call::new("binary", vec![a, b])).unwrap();
    assert_eq!(result.cid(), &cid::parse("uAXEAAQI").unwrap());
}

#[test]
fn async_future() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("binary", |_, args| {
        let a = args[0].node()?.as_integer().unwrap_or(0);
        let b = args[1].node()?.as_integer().unwrap_or(0);
        Ok(NodeOrCid::Node(Node::Integer(a - b)))
    });

    let a = evaluator.store().put(&Node::from(5i64)).unwrap();
    let b = evaluator.store().put(&Node::from(3i64)).unwrap();
    let mut call = Call::new("binary", vec![a, b]);
    let future = evaluator.evaluate_async(&call);
    // The future must hold its own copy of the call.
    call.name = "invalid".to_owned();
    assert_eq!(future.get().unwrap().cid(), &cid::parse("uAXEAAQI").unwrap());
}

#[test]
fn thread_pool() {
    let evaluator = new_evaluator(1);
    evaluator.register_func("binary", |_, args| {
        let a = args[0].node()?.as_integer().unwrap_or(0);
        let b = args[1].node()?.as_integer().unwrap_or(0);
        Ok(NodeOrCid::Node(Node::Integer(a - b)))
    });

    let a = evaluator.store().put(&Node::from(5i64)).unwrap();
    let b = evaluator.store().put(&Node::from(3i64)).unwrap();
    let future = evaluator.evaluate_async(&Call::new("binary", vec![a, b]));
    for _ in 0..100 {
        if future.check_for_result() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(future.get().unwrap().cid(), &cid::parse("uAXEAAQI").unwrap());
}

#[test]
fn function_returning_cid() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("store-it", |evaluator, _| {
        let stored = evaluator
            .store()
            .put(&Node::bytes(vec![1u8; 64]))
            .map_err(EvalError::from)?;
        Ok(NodeOrCid::Cid(stored))
    });
    let result = evaluator.evaluate(&Call::new("store-it", vec![])).unwrap();
    assert_eq!(result.node().unwrap(), &Node::bytes(vec![1u8; 64]));
}

#[test]
fn recursive_evaluation() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("leaf", |_, _| Ok(NodeOrCid::Node(Node::from(7i64))));
    evaluator.register_func("outer", |evaluator, _| {
        let inner = evaluator.evaluate(&Call::new("leaf", vec![]))?;
        let value = inner.node()?.as_integer().unwrap_or(0);
        Ok(NodeOrCid::Node(Node::Integer(value + 1)))
    });
    let result = evaluator.evaluate(&Call::new("outer", vec![])).unwrap();
    assert_eq!(result.node().unwrap(), &Node::Integer(8));
}

#[test]
fn concurrent_evaluations_invoke_once() {
    let evaluator = new_evaluator(0);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    evaluator.register_func("slow", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(NodeOrCid::Node(Node::from("done")))
    });

    let call = Call::new("slow", vec![]);
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let evaluator = evaluator.clone();
                let call = call.clone();
                scope.spawn(move || evaluator.evaluate(&call).map(|link| *link.cid()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), first);
    }
}

#[test]
fn errors_propagate_and_are_not_memoized() {
    let evaluator = new_evaluator(0);
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    evaluator.register_func("flaky", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(EvalError::FuncFailed("boom".to_owned()))
    });

    let call = Call::new("flaky", vec![]);
    assert_eq!(
        evaluator.evaluate(&call).map(|link| *link.cid()).unwrap_err(),
        EvalError::FuncFailed("boom".to_owned())
    );
    assert!(evaluator
        .store()
        .resolve_optional(&Name::Call(call.clone()))
        .unwrap()
        .is_none());

    // A later evaluation runs the function again.
    assert!(evaluator.evaluate(&call).is_err());
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[test]
fn unknown_function_fails() {
    let evaluator = new_evaluator(0);
    assert_eq!(
        evaluator
            .evaluate(&Call::new("nope", vec![]))
            .map(|link| *link.cid())
            .unwrap_err(),
        EvalError::NoSuchFunc("nope".to_owned())
    );
}

#[test]
fn missing_argument_fails() {
    let evaluator = new_evaluator(0);
    evaluator.register_func("id", |_, args| Ok(NodeOrCid::Cid(*args[0].cid())));
    let absent = cid::calculate(cid::RAW, &[0u8; 64], None).unwrap();
    assert!(matches!(
        evaluator.evaluate(&Call::new("id", vec![absent])),
        Err(EvalError::Store(_))
    ));
}
