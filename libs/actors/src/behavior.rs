//! Behavior contract
//!
//! A behavior is the user-defined value inside a kite. The runtime never sees
//! its concrete type. It constructs it through the descriptor's factory,
//! calls lifecycle hooks and dispatches methods by name.
//!
//! Behaviors live on exactly one worker thread, so they are `!Send` and use
//! `&self` with interior mutability. Several invocations on the same kite may
//! be in flight at once whenever one of them awaits.

use std::any::Any;
use std::rc::Rc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::remote::Remote;
use crate::transport::{Connection, Server};

/// Downcast support for behavior trait objects
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// User-defined kite value
#[async_trait(?Send)]
pub trait Behavior: AsAny {
    /// Runs once after construction, before children start
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs first during teardown, before children stop
    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether an undeclared method can still be invoked with plain args
    fn responds_to(&self, _method: &str) -> bool {
        false
    }

    /// Invoke a method by name
    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value>;

    /// Receive a resolved property value
    fn inject(&self, _property: &str, _param: Param) {}
}

impl dyn Behavior {
    pub fn downcast_ref<T: Behavior + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A resolved provider value
#[derive(Clone)]
pub enum Param {
    Value(Value),
    Remote(Remote),
    Reference(Rc<dyn Behavior>),
    Server(Rc<dyn Server>),
    Connection(Rc<dyn Connection>),
    Absent,
}

impl Param {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Param::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Remote> {
        match self {
            Param::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Rc<dyn Behavior>> {
        match self {
            Param::Reference(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_server(&self) -> Option<&Rc<dyn Server>> {
        match self {
            Param::Server(server) => Some(server),
            _ => None,
        }
    }

    pub fn as_connection(&self) -> Option<&Rc<dyn Connection>> {
        match self {
            Param::Connection(connection) => Some(connection),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::Value(value) => write!(f, "Value({value})"),
            Param::Remote(remote) => write!(f, "Remote(@{})", remote.source()),
            Param::Reference(_) => write!(f, "Reference"),
            Param::Server(server) => write!(f, "Server(:{})", server.port()),
            Param::Connection(connection) => write!(f, "Connection({})", connection.id()),
            Param::Absent => write!(f, "Absent"),
        }
    }
}

/// Arguments of one call: provider values first, then caller args
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub params: Vec<Param>,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(params: Vec<Param>, args: Vec<Value>) -> Self {
        Self { params, args }
    }

    /// Plain call with caller args only
    pub fn args(args: Vec<Value>) -> Self {
        Self {
            params: Vec::new(),
            args,
        }
    }

    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    /// Provider value at `index`, decoded
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .params
            .get(index)
            .and_then(Param::as_value)
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| anyhow::anyhow!("parameter {index}: {e}"))
    }

    /// Caller arg at `index`, decoded; a missing arg decodes from null
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| anyhow::anyhow!("argument {index}: {e}"))
    }

    /// First remote handle among the providers
    pub fn remote(&self) -> Option<&Remote> {
        self.params.iter().find_map(Param::as_remote)
    }

    /// First connection among the providers
    pub fn connection(&self) -> Option<&Rc<dyn Connection>> {
        self.params.iter().find_map(Param::as_connection)
    }

    /// First server among the providers
    pub fn server(&self) -> Option<&Rc<dyn Server>> {
        self.params.iter().find_map(Param::as_server)
    }
}
