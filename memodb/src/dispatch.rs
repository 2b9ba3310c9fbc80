// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory dispatch state for remote workers.
//!
//! Pending calls move through a small state machine:
//!
//! ```text
//! UNSTARTED ── worker picks ──▶ ASSIGNED ── result PUT ──▶ FINISHED (erased)
//!                                  │
//!                                  └── deadline exceeded ──▶ RETRY ──▶ ASSIGNED …
//! ```
//!
//! Locks are ordered: the dispatcher mutex (worker-group and call-group
//! maps) before any call-group mutex; the two are never held together the
//! other way around.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use memodb_store::Call;

/// Requeue a job assigned to a worker for this long with no response. The
/// deadline doubles each time the job is requeued.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(4 * 60);

pub struct PendingCall {
    pub assigned: bool,
    pub finished: bool,
    pub start_time: Instant,
    pub timeout: Duration,
}

impl PendingCall {
    fn new() -> PendingCall {
        PendingCall {
            assigned: false,
            finished: false,
            start_time: Instant::now(),
            timeout: INITIAL_TIMEOUT,
        }
    }
}

#[derive(Default)]
pub struct CallGroup {
    pub calls: HashMap<Call, PendingCall>,
    pub unstarted: VecDeque<Call>,
    pub retry: VecDeque<Call>,
}

impl CallGroup {
    /// Drop finished calls from the queue fronts. Finished calls deeper in
    /// a queue are cleaned up once they reach the front.
    pub fn delete_some_finished_calls(&mut self) {
        while let Some(front) = self.unstarted.front() {
            if !self.calls.get(front).map(|p| p.finished).unwrap_or(true) {
                break;
            }
            let call = self.unstarted.pop_front().unwrap_or_else(|| unreachable!());
            self.calls.remove(&call);
        }
        while let Some(front) = self.retry.front() {
            if !self.calls.get(front).map(|p| p.finished).unwrap_or(true) {
                break;
            }
            let call = self.retry.pop_front().unwrap_or_else(|| unreachable!());
            self.calls.remove(&call);
        }
    }

    /// Upsert a pending call for an evaluate request, requeueing it if a
    /// worker has been sitting on it past its deadline.
    pub fn upsert_pending(&mut self, call: &Call) -> EvaluateOutcome {
        if let Some(pending) = self.calls.get_mut(call) {
            if pending.assigned && pending.start_time.elapsed() >= pending.timeout {
                log::warn!(
                    "job in progress for {} minutes: {}; queued for retry",
                    pending.start_time.elapsed().as_secs() / 60,
                    call,
                );
                // Double the deadline to bound overhead when the old
                // worker is still running and the job is just slow.
                pending.timeout *= 2;
                pending.assigned = false;
                self.retry.push_back(call.clone());
            }
            EvaluateOutcome::AlreadyPending
        } else {
            self.calls.insert(call.clone(), PendingCall::new());
            self.unstarted.push_back(call.clone());
            EvaluateOutcome::Queued
        }
    }
}

struct WorkerGroup {
    /// Call groups this worker can serve, in capability order.
    call_groups: Vec<Arc<Mutex<CallGroup>>>,
}

/// What happened to an evaluate request that missed the store.
pub enum EvaluateOutcome {
    /// A new pending call was queued.
    Queued,
    /// The call was already pending (possibly requeued for retry).
    AlreadyPending,
}

#[derive(Default)]
pub struct Dispatcher {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    call_groups: HashMap<String, Arc<Mutex<CallGroup>>>,
    worker_groups: HashMap<Vec<u8>, WorkerGroup>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn group(&self, func: &str) -> Arc<Mutex<CallGroup>> {
        self.lock()
            .call_groups
            .entry(func.to_owned())
            .or_default()
            .clone()
    }

    /// Whether a worker group already exists for this capability key.
    pub fn has_worker_group(&self, key: &[u8]) -> bool {
        self.lock().worker_groups.contains_key(key)
    }

    /// Create (or replace) the worker group for a capability key.
    pub fn register_worker_group(&self, key: Vec<u8>, funcs: &[String]) {
        let mut state = self.lock();
        let call_groups = funcs
            .iter()
            .map(|func| state.call_groups.entry(func.clone()).or_default().clone())
            .collect();
        state.worker_groups.insert(key, WorkerGroup { call_groups });
    }

    /// Find work for a worker: first any unstarted call, then any retry,
    /// searching the worker's call groups in order.
    pub fn take_call_for_worker(&self, key: &[u8]) -> Option<Call> {
        let call_groups: Vec<Arc<Mutex<CallGroup>>> = {
            let state = self.lock();
            state.worker_groups.get(key)?.call_groups.clone()
        };
        for group in &call_groups {
            let mut group = group.lock().unwrap_or_else(|p| p.into_inner());
            group.delete_some_finished_calls();
            if let Some(front) = group.unstarted.front().cloned() {
                group.unstarted.pop_front();
                if let Some(pending) = group.calls.get_mut(&front) {
                    pending.assigned = true;
                    pending.start_time = Instant::now();
                }
                return Some(front);
            }
        }
        for group in &call_groups {
            let mut group = group.lock().unwrap_or_else(|p| p.into_inner());
            group.delete_some_finished_calls();
            if let Some(front) = group.retry.front().cloned() {
                group.retry.pop_front();
                if let Some(pending) = group.calls.get_mut(&front) {
                    pending.assigned = true;
                    pending.start_time = Instant::now();
                }
                return Some(front);
            }
        }
        None
    }

    /// Upsert a pending call for an evaluate request; see
    /// [`CallGroup::upsert_pending`].
    pub fn upsert_pending(&self, call: &Call) -> EvaluateOutcome {
        self.with_group(&call.name, |group| group.upsert_pending(call))
    }

    /// Run `f` while holding the call's group lock; used by the server to
    /// re-check the store without racing a result PUT.
    pub fn with_group<R>(&self, func: &str, f: impl FnOnce(&mut CallGroup) -> R) -> R {
        let group = self.group(func);
        let mut group = group.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut group)
    }

    /// A result arrived for this call; mark it finished and clean up.
    pub fn on_result(&self, call: &Call) {
        let group = {
            let state = self.lock();
            match state.call_groups.get(&call.name) {
                Some(group) => group.clone(),
                None => return,
            }
        };
        let mut group = group.lock().unwrap_or_else(|p| p.into_inner());
        let assigned = match group.calls.get_mut(call) {
            Some(pending) => {
                pending.finished = true;
                pending.assigned
            }
            None => return,
        };
        if assigned {
            // Assigned calls are in no queue; erase directly.
            group.calls.remove(call);
        } else {
            group.delete_some_finished_calls();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memodb_ipld::cid;

    fn call(tag: &[u8]) -> Call {
        Call::new(
            "f",
            vec![cid::calculate(cid::RAW, tag, None).unwrap()],
        )
    }

    #[test]
    fn queue_then_assign_then_finish() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_worker_group(b"w".to_vec(), &["f".to_owned()]);

        let c = call(b"1");
        assert!(matches!(
            dispatcher.upsert_pending(&c),
            EvaluateOutcome::Queued
        ));
        assert!(matches!(
            dispatcher.upsert_pending(&c),
            EvaluateOutcome::AlreadyPending
        ));

        assert_eq!(dispatcher.take_call_for_worker(b"w"), Some(c.clone()));
        assert_eq!(dispatcher.take_call_for_worker(b"w"), None);

        dispatcher.on_result(&c);
        dispatcher.with_group("f", |group| {
            assert!(group.calls.is_empty());
        });
    }

    #[test]
    fn deadline_requeues_to_retry() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_worker_group(b"w".to_vec(), &["f".to_owned()]);

        let c = call(b"2");
        dispatcher.upsert_pending(&c);
        assert_eq!(dispatcher.take_call_for_worker(b"w"), Some(c.clone()));

        // Force the deadline into the past.
        dispatcher.with_group("f", |group| {
            let pending = group.calls.get_mut(&c).unwrap();
            pending.timeout = Duration::ZERO;
        });
        dispatcher.upsert_pending(&c);
        dispatcher.with_group("f", |group| {
            assert_eq!(group.retry.len(), 1);
            let pending = group.calls.get(&c).unwrap();
            assert!(!pending.assigned);
        });

        // The retry queue feeds the next worker poll.
        assert_eq!(dispatcher.take_call_for_worker(b"w"), Some(c.clone()));
    }

    #[test]
    fn workers_only_see_their_functions() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_worker_group(b"w".to_vec(), &["g".to_owned()]);
        dispatcher.upsert_pending(&call(b"3"));
        assert_eq!(dispatcher.take_call_for_worker(b"w"), None);
    }

    #[test]
    fn finished_calls_are_swept_from_queues() {
        let dispatcher = Dispatcher::new();
        let c = call(b"4");
        dispatcher.upsert_pending(&c);
        dispatcher.on_result(&c);
        dispatcher.register_worker_group(b"w".to_vec(), &["f".to_owned()]);
        assert_eq!(dispatcher.take_call_for_worker(b"w"), None);
        dispatcher.with_group("f", |group| {
            assert!(group.calls.is_empty());
            assert!(group.unstarted.is_empty());
        });
    }
}
