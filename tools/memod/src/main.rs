// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use memodb::{Evaluator, HttpStore, NodeOrCid, Server};
use memodb_store::Name;

#[derive(Parser)]
#[command(name = "memod", about = "MemoDB server and worker front-end")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a store over HTTP.
    Serve {
        /// Store URI, e.g. sqlite:db.sqlite or rocksdb:db
        #[arg(long)]
        store: String,
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:29179")]
        listen: String,
        /// Create the store if it does not exist.
        #[arg(long)]
        create: bool,
    },
    /// Serve a remote broker's pending calls with built-in functions.
    Worker {
        /// Server URL, e.g. http://127.0.0.1:29179
        #[arg(long)]
        server: String,
    },
    /// Copy names (and the blocks they reach) from one store to another.
    Transfer {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Names to copy: head:<name> or call:<func>/<cid>,<cid>,…
        names: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Serve {
            store,
            listen,
            create,
        } => serve(&store, &listen, create),
        Command::Worker { server } => worker(&server),
        Command::Transfer { from, to, names } => transfer(&from, &to, &names),
    }
}

fn serve(store_uri: &str, listen: &str, create: bool) -> anyhow::Result<()> {
    let store = memodb::open_store(store_uri, create)
        .with_context(|| format!("opening store {store_uri}"))?;
    let server = Arc::new(Server::new(store));
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding {listen}"))?;
        tokio::select! {
            result = memodb::serve(server, listener) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                Ok(())
            }
        }
    })
}

fn worker(server_url: &str) -> anyhow::Result<()> {
    let store = Arc::new(HttpStore::open(server_url)?);
    let evaluator = Evaluator::local(store as Arc<dyn memodb::Store>, 0);
    // Example function; real deployments register their own funcs here.
    evaluator.register_func("identity", |_, args| Ok(NodeOrCid::Cid(*args[0].cid())));
    let client = HttpStore::open(server_url)?;
    let stop = AtomicBool::new(false);
    memodb::run_worker(&evaluator, &client, &stop)?;
    Ok(())
}

fn parse_name(text: &str) -> anyhow::Result<Name> {
    if let Some(head) = text.strip_prefix("head:") {
        return Ok(Name::Head(memodb_store::Head::new(head)));
    }
    if let Some(call) = text.strip_prefix("call:") {
        let (func, args) = call
            .split_once('/')
            .context("call names look like call:<func>/<cid>,<cid>")?;
        let mut parsed = memodb_store::Call::new(func, Vec::new());
        for arg in args.split(',') {
            parsed.args.push(memodb::cid::parse(arg)?);
        }
        return Ok(Name::Call(parsed));
    }
    if let Ok(parsed) = memodb::cid::parse(text) {
        return Ok(Name::Cid(parsed));
    }
    bail!("unrecognized name {text:?}");
}

fn transfer(from: &str, to: &str, names: &[String]) -> anyhow::Result<()> {
    if names.is_empty() {
        bail!("nothing to transfer");
    }
    let src = memodb::open_store(from, false)?;
    let dst = memodb::open_store(to, true)?;
    let names: Vec<Name> = names
        .iter()
        .map(|name| parse_name(name))
        .collect::<anyhow::Result<_>>()?;
    memodb_store::transfer(src.as_ref(), dst.as_ref(), &names)?;
    log::info!("transferred {} names", names.len());
    Ok(())
}
