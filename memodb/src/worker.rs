// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The worker loop: serve a remote broker's pending calls with locally
//! registered functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use memodb_ipld::{cid, Cid, Node};
use memodb_store::{Call, Error, Result, Store};

use crate::client::HttpStore;
use crate::evaluator::Evaluator;

/// How long to sleep after the broker reports no pending work.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Register this worker's capabilities with the broker and serve jobs
/// until `stop` becomes true. The evaluator must be backed by an
/// [`HttpStore`] for the same server: evaluating a job writes
/// `set(call, cid)` through that store, and that PUT is what delivers the
/// result to the broker.
pub fn run_worker(evaluator: &Evaluator, client: &HttpStore, stop: &AtomicBool) -> Result<()> {
    let info = publish_worker_info(evaluator, client)?;
    log::info!("worker registered for funcs {:?}", evaluator.func_names());
    while !stop.load(Ordering::Relaxed) {
        if !poll_once(evaluator, client, &info)? {
            std::thread::sleep(IDLE_POLL);
        }
    }
    Ok(())
}

/// Store the `{funcs: [...]}` capability node the broker uses to route
/// work to us.
pub fn publish_worker_info(evaluator: &Evaluator, client: &HttpStore) -> Result<Cid> {
    let mut funcs = evaluator.func_names();
    funcs.sort();
    let info = Node::map([(
        "funcs",
        Node::list(funcs.into_iter().map(Node::from).collect::<Vec<_>>()),
    )]);
    client.put(&info)
}

/// Ask the broker for one job; run it and post the result. Returns false
/// when the broker had nothing for us.
pub fn poll_once(evaluator: &Evaluator, client: &HttpStore, info: &Cid) -> Result<bool> {
    let job = match client.poll_worker(info)? {
        Some(job) => job,
        None => return Ok(false),
    };
    let func = job
        .entry("func")
        .ok_or_else(|| Error::invalid("job is missing func"))?
        .as_str()?
        .to_owned();
    let mut call = Call::new(func, Vec::new());
    for arg in job
        .entry("args")
        .ok_or_else(|| Error::invalid("job is missing args"))?
        .as_list()?
    {
        call.args.push(*arg.as_link()?);
    }
    log::debug!("working on {call}");
    match evaluator.evaluate(&call) {
        // The evaluator's store is the broker, so its own set(call, cid)
        // has already posted the result.
        Ok(result) => log::debug!("finished {call} -> {}", cid::to_text(result.cid())),
        // Not memoized; the broker will eventually requeue the job.
        Err(e) => log::error!("evaluation of {call} failed: {e}"),
    }
    Ok(true)
}
