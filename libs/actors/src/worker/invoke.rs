//! Provider resolution and method dispatch

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::FutureExt;
use kite_types::{Address, KiteId};
use serde_json::Value;
use tracing::debug;

use super::Worker;
use crate::behavior::{Behavior, Invocation, Param};
use crate::descriptor::{Provider, ResultTag};
use crate::error::{KiteError, Result};
use crate::kite::Kite;
use crate::message::{Action, Peer};
use crate::routing;
use crate::transport::Connection;

/// Transport context of a call, empty for plain actions and timers
#[derive(Clone, Default)]
pub(crate) struct CallContext {
    pub connection: Option<Rc<dyn Connection>>,
    pub args: Vec<Value>,
}

/// A located method with everything needed to run it
pub(crate) struct Prepared {
    pub owner: Address,
    pub value: Rc<dyn Behavior>,
    pub method: String,
    pub invocation: Invocation,
    pub results: Vec<ResultTag>,
}

/// Resolve one provider for `kite`
pub(crate) fn resolve(
    kites: &HashMap<Address, Kite>,
    kite: &Kite,
    provider: &Provider,
    ctx: &CallContext,
) -> Result<Param> {
    let param = match provider {
        Provider::Address => Param::Value(Value::from(kite.address)),
        Provider::Id => Param::Value(kite.id.as_ref().map(KiteId::to_value).unwrap_or(Value::Null)),
        Provider::Options(None) => Param::Value(kite.options.clone()),
        Provider::Options(Some(key)) => {
            Param::Value(kite.options.get(key).cloned().unwrap_or(Value::Null))
        }
        Provider::Remote => Param::Remote(kite.remote.clone()),
        Provider::Reference(name) => {
            let refs = if kite.root == kite.address {
                &kite.refs
            } else {
                &kites
                    .get(&kite.root)
                    .ok_or_else(|| KiteError::lookup(format!("root of {kite} is gone")))?
                    .refs
            };
            let child = refs
                .get(name)
                .ok_or_else(|| KiteError::lookup(format!("no reference {name} for {kite}")))?;
            let value = kites
                .get(child)
                .and_then(|child| child.value.clone())
                .ok_or_else(|| KiteError::lookup(format!("reference {name} of {kite} has no value")))?;
            Param::Reference(value)
        }
        Provider::Server => kite.server.clone().map(Param::Server).unwrap_or(Param::Absent),
        Provider::Connection => ctx
            .connection
            .clone()
            .map(Param::Connection)
            .unwrap_or(Param::Absent),
        Provider::MessageBody { index, key } => match (ctx.args.get(*index), key) {
            (Some(body), Some(key)) => body.get(key).cloned().map(Param::Value).unwrap_or(Param::Absent),
            (Some(body), None) => Param::Value(body.clone()),
            (None, _) => Param::Absent,
        },
        Provider::Input(key) => Param::Value(kite.inputs.get(key).cloned().unwrap_or(Value::Null)),
    };
    Ok(param)
}

/// Await behavior code, turning both its error and a panic into a behavior error
pub(crate) async fn guarded<T>(method: &str, call: impl Future<Output = anyhow::Result<T>>) -> Result<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result.map_err(|e| KiteError::behavior(method, e)),
        Err(panic) => Err(KiteError::behavior(
            method,
            anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// First kite in the subtree, self first then depth-first, that can run `method`.
/// The flag tells whether the method is declared on its descriptor.
fn locate(kites: &HashMap<Address, Kite>, address: Address, method: &str) -> Option<(Address, bool)> {
    let kite = kites.get(&address)?;
    if kite.descriptor.method(method).is_some() {
        return Some((address, true));
    }
    if kite.value.as_ref().is_some_and(|value| value.responds_to(method)) {
        return Some((address, false));
    }
    kite.children
        .iter()
        .find_map(|child| locate(kites, *child, method))
}

impl Worker {
    /// Locate `method` under the kite at `address` and resolve its providers
    pub(crate) fn prepare(
        &self,
        address: Address,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext,
    ) -> Result<Prepared> {
        let kites = self.kites.borrow();
        let kite = kites
            .get(&address)
            .ok_or_else(|| KiteError::lookup(format!("no such @{address}")))?;
        let (owner, declared) = locate(&kites, address, method)
            .ok_or_else(|| KiteError::lookup(format!("no method {method} on {kite}")))?;

        let owner_kite = kites
            .get(&owner)
            .ok_or_else(|| KiteError::lookup(format!("no such @{owner}")))?;
        let value = owner_kite
            .value
            .clone()
            .ok_or_else(|| KiteError::lookup(format!("{owner_kite} has no value")))?;

        let (params, results) = match owner_kite.descriptor.method(method).filter(|_| declared) {
            Some(spec) => (
                spec.parameters
                    .iter()
                    .map(|provider| resolve(&kites, owner_kite, provider, ctx))
                    .collect::<Result<Vec<_>>>()?,
                spec.results.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Prepared {
            owner,
            value,
            method: method.to_string(),
            invocation: Invocation::new(params, args),
            results,
        })
    }

    /// Run a prepared call; no table borrow is held while it awaits
    pub(crate) async fn invoke(&self, prepared: Prepared) -> Result<Value> {
        let Prepared {
            owner,
            value,
            method,
            invocation,
            ..
        } = prepared;
        debug!(worker = self.index, address = owner, method = %method, "Invoking method");
        guarded(&method, value.invoke(&method, invocation)).await
    }

    pub(super) fn on_action(self: &Rc<Self>, from: Peer, action: Action) {
        let Action {
            session,
            source,
            target,
            route,
            method,
            args,
        } = action;
        let (method, args) = routing::route_action(&self.registry, route.as_deref(), method, args);
        debug!(worker = self.index, source = ?source, target = %target, method = %method, "Action");

        let prepared = self
            .find(&target)
            .and_then(|address| self.prepare(address, &method, args, &CallContext::default()));
        match prepared {
            Ok(prepared) => {
                let this = self.clone();
                tokio::task::spawn_local(async move {
                    let result = this.invoke(prepared).await;
                    this.reply(from, session, result);
                });
            }
            Err(e) => self.reply(from, session, Err(e)),
        }
    }
}
