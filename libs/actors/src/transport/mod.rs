//! Transport contract for controller kites
//!
//! A controller kite owns a listening [`Server`]. Clients connect and send
//! named events with JSON arguments. Each event may carry an
//! acknowledgement callback. The worker turns the resulting
//! [`TransportEvent`] stream into hook invocations on the controller.
//!
//! Implementations are registered by kind in [`Transports`] and shared by
//! all workers. `listen` runs on the worker that hosts the controller, so
//! servers and connections are thread-local (`Rc`).

pub mod memory;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

pub use memory::{MemoryClient, MemoryTransport};

/// Listening side of a controller
pub trait Server {
    fn port(&self) -> u16;
    /// Emit an event to every open connection
    fn broadcast(&self, event: &str, args: &[Value]);
    /// Stop accepting and drop every open connection
    fn close(&self);
}

/// One client connection
pub trait Connection {
    fn id(&self) -> String;
    fn emit(&self, event: &str, args: Vec<Value>);
    fn disconnect(&self);
}

/// Acknowledgement callback attached to a client message
#[derive(Debug)]
pub struct Ack(oneshot::Sender<Value>);

impl Ack {
    pub fn new(tx: oneshot::Sender<Value>) -> Self {
        Self(tx)
    }

    /// Deliver the result; a client that stopped waiting is ignored
    pub fn send(self, value: Value) {
        let _ = self.0.send(value);
    }
}

pub enum TransportEvent {
    Connected(Rc<dyn Connection>),
    Message {
        connection: Rc<dyn Connection>,
        event: String,
        args: Vec<Value>,
        ack: Option<Ack>,
    },
    Disconnected {
        connection: Rc<dyn Connection>,
        reason: Option<String>,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> &Rc<dyn Connection> {
        match self {
            TransportEvent::Connected(connection)
            | TransportEvent::Message { connection, .. }
            | TransportEvent::Disconnected { connection, .. } => connection,
        }
    }
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connected(c) => write!(f, "Connected({})", c.id()),
            TransportEvent::Message { connection, event, .. } => {
                write!(f, "Message({}, {event})", connection.id())
            }
            TransportEvent::Disconnected { connection, .. } => {
                write!(f, "Disconnected({})", connection.id())
            }
        }
    }
}

/// A bound server and its event stream
pub struct Listener {
    pub server: Rc<dyn Server>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport driver, shared across worker threads
#[async_trait(?Send)]
pub trait Transport: Send + Sync {
    /// Bind a listener for the controller `name` on `port`
    async fn listen(&self, name: &str, port: u16, options: &Value) -> Result<Listener>;
}

/// Transport drivers by kind
#[derive(Clone, Default)]
pub struct Transports {
    kinds: HashMap<String, Arc<dyn Transport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.kinds.insert(kind.into(), transport);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn Transport>> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}
