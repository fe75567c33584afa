//! Remote proxy
//!
//! Kites never touch each other directly. They reach other kites through a
//! [`Remote`], a per-kite builder that turns route parameters into cached
//! [`RemoteTarget`] handles. Every operation on a handle resolves the route
//! again, picks the hosting worker and posts a message through the worker's
//! [`Outbox`].
//!
//! ```text
//!   kite ─ Remote ─ route(["npc", 10]) ─ RemoteTarget ─┐
//!                                                      │ choose(target)
//!                          Outbox ports ◄──────────────┘
//!                  ┌───────────┼───────────┐
//!              loopback     worker 1    worker 2 ...
//! ```
//!
//! `call` and `create` open a session in the worker's table and send at
//! once. The returned [`Reply`] only waits for the answer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use kite_types::{Address, KiteId, Target};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{KiteError, RemoteError, Result};
use crate::message::{Action, Inbound, Message, Peer, Session};
use crate::registry::Registry;
use crate::routing;
use crate::session::{Reply, Sessions};

enum Port {
    Loopback(mpsc::UnboundedSender<Inbound>),
    Peer(mpsc::UnboundedSender<Message>),
}

/// Outgoing side of a worker: mesh ports, session table, global registry
pub struct Outbox {
    index: usize,
    worker_count: usize,
    registry: Arc<Registry>,
    ports: RefCell<HashMap<usize, Port>>,
    coordinator: RefCell<Option<mpsc::UnboundedSender<Message>>>,
    sessions: RefCell<Sessions>,
    globals: RefCell<HashMap<String, Address>>,
}

impl Outbox {
    /// `inbox` receives messages the worker posts to itself
    pub fn new(
        index: usize,
        worker_count: usize,
        registry: Arc<Registry>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let mut ports = HashMap::new();
        ports.insert(index, Port::Loopback(inbox));
        Self {
            index,
            worker_count,
            registry,
            ports: RefCell::new(ports),
            coordinator: RefCell::new(None),
            sessions: RefCell::new(Sessions::new()),
            globals: RefCell::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register the sending half of the channel to worker `index`
    pub fn connect(&self, index: usize, tx: mpsc::UnboundedSender<Message>) {
        self.ports.borrow_mut().insert(index, Port::Peer(tx));
    }

    pub fn set_coordinator(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.coordinator.borrow_mut() = Some(tx);
    }

    /// Workers reachable from here, self included
    pub fn connected(&self) -> usize {
        self.ports.borrow().len()
    }

    pub fn post(&self, peer: Peer, message: Message) -> Result<()> {
        match peer {
            Peer::Coordinator => match self.coordinator.borrow().as_ref() {
                Some(tx) => tx.send(message).map_err(|_| KiteError::channel_closed(peer)),
                None => Err(KiteError::channel_closed(peer)),
            },
            Peer::Worker(index) => match self.ports.borrow().get(&index) {
                Some(Port::Loopback(inbox)) => inbox
                    .send(Inbound {
                        from: Peer::Worker(self.index),
                        message,
                    })
                    .map_err(|_| KiteError::channel_closed(peer)),
                Some(Port::Peer(tx)) => tx.send(message).map_err(|_| KiteError::channel_closed(peer)),
                None => Err(KiteError::routing(format!("worker {index} is not connected"))),
            },
        }
    }

    /// Worker hosting an existing target
    pub fn choose(&self, target: &Target) -> Result<usize> {
        routing::shard_index(target, self.worker_count, &self.globals.borrow())
    }

    pub fn post_target(&self, target: &Target, message: Message) -> Result<()> {
        let index = self.choose(target)?;
        self.post(Peer::Worker(index), message)
    }

    /// Send a session-carrying request to worker `index`
    pub fn request<T>(&self, index: usize, build: impl FnOnce(Session) -> Message) -> Reply<T> {
        Sessions::request(&self.sessions, |session| {
            self.post(Peer::Worker(index), build(session))
        })
    }

    /// Complete a pending session; false when unknown
    pub fn complete(&self, session: Session, result: std::result::Result<Value, RemoteError>) -> bool {
        self.sessions.borrow_mut().complete(session, result)
    }

    pub fn pending_sessions(&self) -> usize {
        self.sessions.borrow().pending()
    }

    pub fn route(&self, params: &[Value]) -> Result<Target> {
        routing::route(&self.registry, params)
    }

    pub fn global(&self, name: &str) -> Option<Address> {
        self.globals.borrow().get(name).copied()
    }

    /// Record a global; returns the address it replaced
    pub fn register_global(&self, name: impl Into<String>, address: Address) -> Option<Address> {
        self.globals.borrow_mut().insert(name.into(), address)
    }

    /// Forget a global if it still points at `address`
    pub fn unregister_global(&self, name: &str, address: Address) -> bool {
        let mut globals = self.globals.borrow_mut();
        if globals.get(name) == Some(&address) {
            globals.remove(name);
            true
        } else {
            false
        }
    }

    pub fn globals_len(&self) -> usize {
        self.globals.borrow().len()
    }

    /// Announce a global to every other worker
    pub fn broadcast_regist(&self, name: &str, address: Address) {
        let peers: Vec<usize> = self
            .ports
            .borrow()
            .keys()
            .copied()
            .filter(|index| *index != self.index)
            .collect();
        for index in peers {
            let message = Message::Regist {
                name: name.to_string(),
                address,
            };
            if let Err(e) = self.post(Peer::Worker(index), message) {
                debug!(worker = self.index, peer = index, error = %e, "Failed to announce global");
            }
        }
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("index", &self.index)
            .field("worker_count", &self.worker_count)
            .field("connected", &self.connected())
            .field("sessions", &self.pending_sessions())
            .finish()
    }
}

/// Per-kite builder of remote handles
#[derive(Clone)]
pub struct Remote {
    source: Address,
    outbox: Rc<Outbox>,
    cache: Rc<RefCell<HashMap<String, RemoteTarget>>>,
}

impl Remote {
    pub fn new(source: Address, outbox: Rc<Outbox>) -> Self {
        Self {
            source,
            outbox,
            cache: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Address of the kite this remote sends as
    pub fn source(&self) -> Address {
        self.source
    }

    /// Handle for a route; equal routes share one handle
    pub fn route(&self, params: Vec<Value>) -> RemoteTarget {
        let key = Value::Array(params.clone()).to_string();
        self.cache
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| RemoteTarget {
                inner: Rc::new(TargetInner {
                    route: params,
                    source: self.source,
                    outbox: self.outbox.clone(),
                }),
            })
            .clone()
    }

    pub fn to(&self, name: &str, id: impl Into<KiteId>) -> RemoteTarget {
        self.route(vec![Value::from(name), id.into().to_value()])
    }

    pub fn global(&self, name: &str) -> RemoteTarget {
        self.route(vec![Value::from(name)])
    }

    pub fn address(&self, address: Address) -> RemoteTarget {
        self.route(vec![Value::from(address)])
    }

    /// Handle to the source kite itself
    pub fn this(&self) -> RemoteTarget {
        self.address(self.source)
    }

    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

struct TargetInner {
    route: Vec<Value>,
    source: Address,
    outbox: Rc<Outbox>,
}

/// Handle to one route
#[derive(Clone)]
pub struct RemoteTarget {
    inner: Rc<TargetInner>,
}

impl RemoteTarget {
    pub fn route(&self) -> &[Value] {
        &self.inner.route
    }

    pub fn target(&self) -> Result<Target> {
        self.inner.outbox.route(&self.inner.route)
    }

    pub fn same_handle(&self, other: &RemoteTarget) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn action(&self, session: Option<Session>, target: Target, method: &str, args: Vec<Value>) -> Message {
        Message::Action(Action {
            session,
            source: Some(self.inner.source),
            target,
            route: Some(self.inner.route.clone()),
            method: method.to_string(),
            args,
        })
    }

    /// Fire-and-forget method invocation
    pub fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let target = self.target()?;
        let message = self.action(None, target.clone(), method, args);
        self.inner.outbox.post_target(&target, message)
    }

    /// Invoke a method and wait for its result
    pub fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Reply<T> {
        let outbox = &self.inner.outbox;
        let prepared = self
            .target()
            .and_then(|target| outbox.choose(&target).map(|index| (target, index)));
        match prepared {
            Ok((target, index)) => {
                outbox.request(index, |session| self.action(Some(session), target, method, args))
            }
            Err(e) => Reply::failed(e),
        }
    }

    /// Create a kite at this route's placement; resolves to its address
    pub fn create(&self, options: Value) -> Reply<Address> {
        let outbox = &self.inner.outbox;
        let target = match self.target() {
            Ok(Target::Address(address)) => {
                return Reply::failed(KiteError::protocol(format!("cannot create at address {address}")))
            }
            Ok(target) => target,
            Err(e) => return Reply::failed(e),
        };
        match routing::placement(&target, outbox.worker_count()) {
            Ok(index) => outbox.request(index, |session| Message::Create {
                session: Some(session),
                target,
                options,
            }),
            Err(e) => Reply::failed(e),
        }
    }

    /// Fire-and-forget destroy
    pub fn destroy(&self) -> Result<()> {
        let target = self.target()?;
        let message = Message::Destroy {
            session: None,
            target: target.clone(),
        };
        self.inner.outbox.post_target(&target, message)
    }

    /// Subscribe the source kite's `method` to `event` on the target
    pub fn on(&self, event: &str, method: &str) -> Result<()> {
        let target = self.target()?;
        let message = Message::Listen {
            target: target.clone(),
            event: event.to_string(),
            subscriber: self.inner.source,
            method: method.to_string(),
        };
        self.inner.outbox.post_target(&target, message)
    }

    pub fn off(&self, event: &str, method: &str) -> Result<()> {
        let target = self.target()?;
        let message = Message::Remove {
            target: target.clone(),
            event: event.to_string(),
            subscriber: self.inner.source,
            method: method.to_string(),
        };
        self.inner.outbox.post_target(&target, message)
    }

    /// Raise an event on the target, fanned out to its subscribers
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        let target = self.target()?;
        let message = Message::Emit {
            target: target.clone(),
            event: event.to_string(),
            args,
        };
        self.inner.outbox.post_target(&target, message)
    }
}

impl std::fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("route", &self.inner.route)
            .field("source", &self.inner.source)
            .finish()
    }
}
