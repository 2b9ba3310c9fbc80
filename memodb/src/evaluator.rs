// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The evaluator: memoized, at-most-once execution of registered pure
//! functions over stored nodes.
//!
//! A call's result is first looked up in the store; on a miss the
//! evaluation is coordinated through an in-flight map so that at most one
//! invocation per call runs in this process at a time. Concurrent
//! requesters attach to the running evaluation. Results are written back
//! as `set(call, cid)`; errors propagate to every attached waiter and are
//! never memoized.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use memodb_ipld::{Cid, Node};
use memodb_store::{Call, Name, Store};
use thiserror::Error;

use crate::link::Link;

/// What a registered function returns: either a fresh node to be stored,
/// or the CID of a node it already stored itself.
pub enum NodeOrCid {
    Node(Node),
    Cid(Cid),
}

impl From<Node> for NodeOrCid {
    fn from(value: Node) -> NodeOrCid {
        NodeOrCid::Node(value)
    }
}

impl From<Cid> for NodeOrCid {
    fn from(value: Cid) -> NodeOrCid {
        NodeOrCid::Cid(value)
    }
}

/// Evaluation failures fan out to every waiter, so they must be cheap to
/// clone; store errors are carried as text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("no registered function named {0:?}")]
    NoSuchFunc(String),
    #[error("function failed: {0}")]
    FuncFailed(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<memodb_store::Error> for EvalError {
    fn from(e: memodb_store::Error) -> EvalError {
        EvalError::Store(e.to_string())
    }
}

pub type FuncResult = Result<NodeOrCid, EvalError>;
pub type Func = Arc<dyn Fn(&Evaluator, &[Link]) -> FuncResult + Send + Sync>;

/// The registered functions must be deterministic pure functions of their
/// argument nodes; caching assumes it, and nothing verifies it.
#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    funcs: RwLock<HashMap<String, Func>>,
    inflight: Mutex<HashMap<Call, Arc<Task>>>,
    queue: Mutex<VecDeque<Arc<Task>>>,
    queue_cond: Condvar,
}

struct Task {
    call: Call,
    state: Mutex<TaskState>,
    cond: Condvar,
}

enum TaskState {
    /// Waiting in the pool queue; any thread may claim it.
    Queued,
    Running,
    Done(Result<Cid, EvalError>),
}

impl Task {
    fn new(call: Call, state: TaskState) -> Arc<Task> {
        Arc::new(Task {
            call,
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    /// Move a queued task to running. Returns false if some other thread
    /// already took it.
    fn claim(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(*state, TaskState::Queued) {
            *state = TaskState::Running;
            true
        } else {
            false
        }
    }

    fn finish(&self, result: Result<Cid, EvalError>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = TaskState::Done(result);
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<Cid, EvalError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let TaskState::Done(result) = &*state {
                return result.clone();
            }
            state = self.cond.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }

    fn is_done(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|p| p.into_inner()),
            TaskState::Done(_)
        )
    }
}

impl Evaluator {
    /// An evaluator that runs registered functions in this process, with
    /// `thread_count` pool threads serving [`Evaluator::evaluate_async`].
    /// With a zero-sized pool, async evaluations run on whichever thread
    /// first inspects the future.
    pub fn local(store: Arc<dyn Store>, thread_count: usize) -> Evaluator {
        let evaluator = Evaluator {
            inner: Arc::new(Inner {
                store,
                funcs: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_cond: Condvar::new(),
            }),
        };
        for i in 0..thread_count {
            let weak = Arc::downgrade(&evaluator.inner);
            std::thread::Builder::new()
                .name(format!("memodb-eval-{i}"))
                .spawn(move || pool_loop(weak))
                .unwrap_or_else(|e| panic!("failed to spawn evaluator thread: {e}"));
        }
        evaluator
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn register_func(
        &self,
        name: impl Into<String>,
        func: impl Fn(&Evaluator, &[Link]) -> FuncResult + Send + Sync + 'static,
    ) {
        self.inner
            .funcs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), Arc::new(func));
    }

    /// Names of all registered functions.
    pub fn func_names(&self) -> Vec<String> {
        self.inner
            .funcs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Evaluate a call, blocking until its result is available.
    pub fn evaluate(&self, call: &Call) -> Result<Link, EvalError> {
        if let Some(cid) = self.inner.store.resolve_optional(&Name::Call(call.clone()))? {
            return Ok(self.link(cid));
        }
        let (task, ours) = self.attach(call, TaskState::Running);
        if ours {
            self.run(&task);
        } else if task.claim() {
            // It was queued for the pool; steal it rather than wait.
            self.run(&task);
        }
        task.wait().map(|cid| self.link(cid))
    }

    /// Begin evaluating a call without blocking.
    pub fn evaluate_async(&self, call: &Call) -> Future {
        let resolved = self
            .inner
            .store
            .resolve_optional(&Name::Call(call.clone()));
        match resolved {
            Ok(Some(cid)) => Future {
                evaluator: self.clone(),
                kind: FutureKind::Ready(Ok(cid)),
            },
            Err(e) => Future {
                evaluator: self.clone(),
                kind: FutureKind::Ready(Err(e.into())),
            },
            Ok(None) => {
                let (task, ours) = self.attach(call, TaskState::Queued);
                if ours {
                    let mut queue = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
                    queue.push_back(task.clone());
                    self.inner.queue_cond.notify_one();
                }
                Future {
                    evaluator: self.clone(),
                    kind: FutureKind::Pending(task),
                }
            }
        }
    }

    fn link(&self, cid: Cid) -> Link {
        Link::new(self.inner.store.clone(), cid)
    }

    /// Find or create the in-flight task for `call`. The bool is true when
    /// this caller created it and is responsible for running it.
    fn attach(&self, call: &Call, initial: TaskState) -> (Arc<Task>, bool) {
        let mut inflight = self.inner.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = inflight.get(call) {
            return (task.clone(), false);
        }
        let task = Task::new(call.clone(), initial);
        inflight.insert(call.clone(), task.clone());
        (task, true)
    }

    /// Run a claimed task to completion and publish the result. No
    /// evaluator locks are held while the store or the function runs.
    fn run(&self, task: &Arc<Task>) {
        let result = self.invoke(&task.call);
        let mut inflight = self.inner.inflight.lock().unwrap_or_else(|p| p.into_inner());
        inflight.remove(&task.call);
        drop(inflight);
        task.finish(result);
    }

    fn invoke(&self, call: &Call) -> Result<Cid, EvalError> {
        let func = self
            .inner
            .funcs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&call.name)
            .cloned()
            .ok_or_else(|| EvalError::NoSuchFunc(call.name.clone()))?;
        let args: Vec<Link> = call.args.iter().map(|arg| self.link(*arg)).collect();
        // Touch each argument so a missing block fails before the function
        // starts.
        for arg in &args {
            arg.node()?;
        }
        let cid = match func(self, &args)? {
            NodeOrCid::Cid(cid) => cid,
            NodeOrCid::Node(node) => self.inner.store.put(&node)?,
        };
        self.inner
            .store
            .set(&Name::Call(call.clone()), &cid)?;
        Ok(cid)
    }
}

/// The result handle returned by [`Evaluator::evaluate_async`].
pub struct Future {
    evaluator: Evaluator,
    kind: FutureKind,
}

enum FutureKind {
    Ready(Result<Cid, EvalError>),
    Pending(Arc<Task>),
}

impl Future {
    /// Whether the result is available without blocking.
    pub fn check_for_result(&self) -> bool {
        match &self.kind {
            FutureKind::Ready(_) => true,
            FutureKind::Pending(task) => task.is_done(),
        }
    }

    /// Wait for the result. If the evaluation is still queued and no pool
    /// thread has picked it up, it runs on this thread, so inspecting a
    /// future can never deadlock against a saturated pool.
    pub fn get(&self) -> Result<Link, EvalError> {
        match &self.kind {
            FutureKind::Ready(result) => result
                .clone()
                .map(|cid| Link::new(self.evaluator.inner.store.clone(), cid)),
            FutureKind::Pending(task) => {
                if task.claim() {
                    self.evaluator.run(task);
                }
                task.wait()
                    .map(|cid| Link::new(self.evaluator.inner.store.clone(), cid))
            }
        }
    }
}

/// Pool threads hold only a weak reference so dropping the last Evaluator
/// handle shuts the pool down; the timed wait bounds how long that takes.
fn pool_loop(weak: Weak<Inner>) {
    loop {
        let task = {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let mut queue = inner.queue.lock().unwrap_or_else(|p| p.into_inner());
            match queue.pop_front() {
                Some(task) => Some(task),
                None => {
                    let (mut queue, _) = inner
                        .queue_cond
                        .wait_timeout(queue, Duration::from_millis(100))
                        .unwrap_or_else(|p| p.into_inner());
                    queue.pop_front()
                }
            }
        };
        if let (Some(task), Some(inner)) = (task, weak.upgrade()) {
            if task.claim() {
                Evaluator { inner }.run(&task);
            }
        }
    }
}
