//! Worker Runtime
//!
//! Each worker is an OS thread running a single-threaded tokio runtime with
//! a `LocalSet`. It owns a shard of kites and every table that indexes them.
//!
//! ## Dispatch
//!
//! ```text
//!   coordinator ─┐
//!   worker 0 ────┼─► pump ─► inbox ─► dispatch ─┬─ inline: connect, resp, regist,
//!   worker 1 ────┘   (one per channel)          │          listen, remove, emit, stats
//!   loopback ───────────────────────►           └─ sync prefix inline, rest as a
//!                                                  local task: create*, action, destroy
//! ```
//!
//! The synchronous prefix of every handler (lookups, index mutations,
//! provider resolution) runs in arrival order. Only the parts that await
//! behavior code are spawned, and no table borrow is held across an await.

mod controller;
mod invoke;
mod lifecycle;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use futures::future::OptionFuture;
use kite_types::{Address, AddressAllocator, KiteId, Target};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::error::{KiteError, RemoteError, Result};
use crate::kite::{Kite, Subscriber};
use crate::message::{Endpoint, Inbound, Message, Peer, Session};
use crate::registry::Registry;
use crate::remote::Outbox;
use crate::transport::Transports;

pub(crate) use invoke::CallContext;

/// Everything a worker thread needs to boot
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub index: usize,
    pub worker_count: usize,
    pub registry: Arc<Registry>,
    pub transports: Arc<Transports>,
}

/// Reported by a worker thread when it ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    /// Panicked or failed to boot, as opposed to a requested shutdown
    pub abnormal: bool,
}

/// Snapshot of a worker's tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub index: usize,
    pub kites: usize,
    pub local: usize,
    pub globals: usize,
    pub timers: usize,
    pub listeners: usize,
    pub sessions: usize,
    pub allocated: u64,
}

struct ExitGuard {
    index: usize,
    exits: mpsc::UnboundedSender<WorkerExit>,
    clean: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let abnormal = !self.clean || thread::panicking();
        if abnormal {
            error!(worker = self.index, "Worker exited abnormally");
        } else {
            info!(worker = self.index, "Worker exited");
        }
        let _ = self.exits.send(WorkerExit {
            index: self.index,
            abnormal,
        });
    }
}

pub struct Worker {
    index: usize,
    registry: Arc<Registry>,
    transports: Arc<Transports>,
    outbox: Rc<Outbox>,
    inbox: mpsc::UnboundedSender<Inbound>,
    allocator: RefCell<AddressAllocator>,
    kites: RefCell<HashMap<Address, Kite>>,
    local_kites: RefCell<HashMap<String, HashMap<KiteId, Address>>>,
    running: Cell<bool>,
    closing: Cell<bool>,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Result<(Rc<Self>, mpsc::UnboundedReceiver<Inbound>)> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let outbox = Rc::new(Outbox::new(
            ctx.index,
            ctx.worker_count,
            ctx.registry.clone(),
            inbox.clone(),
        ));

        let worker = Rc::new(Self {
            index: ctx.index,
            registry: ctx.registry,
            transports: ctx.transports,
            outbox,
            inbox,
            allocator: RefCell::new(AddressAllocator::new(ctx.index)?),
            kites: RefCell::new(HashMap::new()),
            local_kites: RefCell::new(HashMap::new()),
            running: Cell::new(false),
            closing: Cell::new(false),
        });
        Ok((worker, inbox_rx))
    }

    /// Start a worker thread. The exit is always reported on `exits`.
    pub fn spawn(
        ctx: WorkerContext,
        coordinator: Endpoint,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        let index = ctx.index;
        thread::Builder::new()
            .name(format!("kite-worker-{index}"))
            .spawn(move || {
                let mut guard = ExitGuard {
                    index,
                    exits,
                    clean: false,
                };

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = index, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };

                let local = LocalSet::new();
                guard.clean = local.block_on(&runtime, async move {
                    match Worker::new(ctx) {
                        Ok((worker, inbox)) => {
                            worker.run(coordinator, inbox).await;
                            true
                        }
                        Err(e) => {
                            error!(worker = index, error = %e, "Failed to boot worker");
                            false
                        }
                    }
                });
            })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn outbox(&self) -> &Rc<Outbox> {
        &self.outbox
    }

    /// Serve until a shutdown has drained every kite.
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(self: Rc<Self>, coordinator: Endpoint, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        let Endpoint { tx, rx } = coordinator;
        self.outbox.set_coordinator(tx);
        self.attach(Peer::Coordinator, rx);
        debug!(worker = self.index, "Worker loop entered");

        let mut draining = None;
        loop {
            tokio::select! {
                inbound = inbox.recv() => match inbound {
                    Some(Inbound { message: Message::Shutdown, .. }) => {
                        if draining.is_none() {
                            info!(worker = self.index, "Worker shutting down");
                            draining = Some(tokio::task::spawn_local(self.clone().shutdown()));
                        }
                    }
                    Some(Inbound { from, message }) => self.dispatch(from, message),
                    None => break,
                },
                Some(_) = OptionFuture::from(draining.as_mut()), if draining.is_some() => break,
            }
        }
        self.running.set(false);
    }

    /// Forward a channel into the inbox, tagged with its peer
    fn attach(&self, peer: Peer, mut rx: mpsc::UnboundedReceiver<Message>) {
        let inbox = self.inbox.clone();
        let index = self.index;
        tokio::task::spawn_local(async move {
            while let Some(message) = rx.recv().await {
                if inbox.send(Inbound { from: peer, message }).is_err() {
                    return;
                }
            }
            if peer == Peer::Coordinator {
                warn!(worker = index, "Coordinator channel closed, shutting down");
                let _ = inbox.send(Inbound {
                    from: peer,
                    message: Message::Shutdown,
                });
            } else {
                debug!(worker = index, peer = %peer, "Peer channel closed");
            }
        });
    }

    pub fn dispatch(self: &Rc<Self>, from: Peer, message: Message) {
        debug!(worker = self.index, from = %from, kind = message.kind(), session = ?message.session(), "Dispatching message");

        match message {
            Message::Connect { index, endpoint } => self.on_connect(from, index, endpoint),
            Message::Start => {
                self.running.set(true);
                info!(worker = self.index, peers = self.outbox.connected(), "Worker started");
            }
            Message::Create {
                session,
                target,
                options,
            } => self.on_create(from, session, target, options, false),
            Message::CreateSync {
                session,
                target,
                options,
            } => self.on_create(from, session, target, options, true),
            Message::CreateController {
                session,
                target,
                options,
                driver,
            } => self.on_create_controller(from, session, target, options, driver),
            Message::Destroy { session, target } => self.on_destroy(from, session, target),
            Message::Action(action) => self.on_action(from, action),
            Message::Resp { session, result } => {
                if !self.outbox.complete(session, result) {
                    debug!(worker = self.index, session, "Dropped response for unknown session");
                }
            }
            Message::Regist { name, address } => {
                if let Some(previous) = self.outbox.register_global(name.clone(), address) {
                    if previous != address {
                        warn!(worker = self.index, name = %name, previous, address, "Global re-registered");
                    }
                }
                debug!(worker = self.index, name = %name, address, "Global registered");
            }
            Message::Listen {
                target,
                event,
                subscriber,
                method,
            } => {
                if let Err(e) = self.on_listen(&target, event, subscriber, method) {
                    warn!(worker = self.index, target = %target, error = %e, "Discarded listen");
                }
            }
            Message::Remove {
                target,
                event,
                subscriber,
                method,
            } => {
                if let Err(e) = self.on_remove(&target, &event, subscriber, method) {
                    warn!(worker = self.index, target = %target, error = %e, "Discarded remove");
                }
            }
            Message::Emit {
                target,
                event,
                args,
            } => match self.find(&target) {
                Ok(address) => {
                    self.fire_event(address, &event, args);
                }
                Err(e) => warn!(worker = self.index, target = %target, event = %event, error = %e, "Discarded emit"),
            },
            Message::Check => {
                info!(worker = self.index, kites = self.kites.borrow().len(), "Health check");
            }
            Message::Stats { session } => {
                let stats = serde_json::to_value(self.stats())
                    .map_err(|e| KiteError::protocol(format!("stats encoding failed: {e}")));
                self.reply(from, Some(session), stats);
            }
            // Intercepted by the run loop
            Message::Shutdown => {}
        }
    }

    fn on_connect(self: &Rc<Self>, from: Peer, index: usize, endpoint: Endpoint) {
        if from != Peer::Coordinator {
            warn!(worker = self.index, from = %from, "Protocol error: connect from a non-coordinator");
            return;
        }
        if index == self.index {
            warn!(worker = self.index, "Protocol error: connect to self");
            return;
        }
        let Endpoint { tx, rx } = endpoint;
        self.outbox.connect(index, tx);
        self.attach(Peer::Worker(index), rx);
        debug!(worker = self.index, peer = index, "Mesh port connected");
    }

    fn on_listen(&self, target: &Target, event: String, subscriber: Address, method: String) -> Result<()> {
        let address = self.find(target)?;
        let mut kites = self.kites.borrow_mut();
        let kite = kites
            .get_mut(&address)
            .ok_or_else(|| KiteError::lookup(format!("no such {target}")))?;
        kite.listeners.add(event, Subscriber { address: subscriber, method });
        Ok(())
    }

    fn on_remove(&self, target: &Target, event: &str, subscriber: Address, method: String) -> Result<()> {
        let address = self.find(target)?;
        let mut kites = self.kites.borrow_mut();
        let kite = kites
            .get_mut(&address)
            .ok_or_else(|| KiteError::lookup(format!("no such {target}")))?;
        kite.listeners.remove(event, &Subscriber { address: subscriber, method });
        Ok(())
    }

    /// Send the outcome of a request back to its sender
    pub(crate) fn reply(&self, to: Peer, session: Option<Session>, result: Result<Value>) {
        match session {
            Some(session) => {
                let result = result.map_err(|e| {
                    debug!(worker = self.index, session, error = %e, "Request failed");
                    RemoteError::from(&e)
                });
                if let Err(e) = self.outbox.post(to, Message::Resp { session, result }) {
                    warn!(worker = self.index, peer = %to, session, error = %e, "Failed to deliver response");
                }
            }
            None => {
                if let Err(e) = result {
                    warn!(worker = self.index, from = %to, error = %e, "Discarded error of fire-and-forget message");
                }
            }
        }
    }

    /// Address of a live local kite
    pub(crate) fn find(&self, target: &Target) -> Result<Address> {
        let found = match target {
            Target::Address(address) => self
                .kites
                .borrow()
                .contains_key(address)
                .then_some(*address),
            Target::Instance { name, id } => self
                .local_kites
                .borrow()
                .get(name)
                .and_then(|ids| ids.get(id))
                .copied(),
            Target::Global { name } => self
                .outbox
                .global(name)
                .filter(|address| self.kites.borrow().contains_key(address)),
        };
        found.ok_or_else(|| KiteError::lookup(format!("no such {target}")))
    }

    pub fn stats(&self) -> WorkerStats {
        let kites = self.kites.borrow();
        WorkerStats {
            index: self.index,
            kites: kites.len(),
            local: self.local_kites.borrow().values().map(HashMap::len).sum(),
            globals: self.outbox.globals_len(),
            timers: kites.values().map(|k| k.timers.len()).sum(),
            listeners: kites.values().map(|k| k.listeners.len()).sum(),
            sessions: self.outbox.pending_sessions(),
            allocated: self.allocator.borrow().allocated(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("running", &self.running.get())
            .field("kites", &self.kites.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
