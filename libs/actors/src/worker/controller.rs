//! Controller kites: transport binding and hook dispatch
//!
//! A controller is a root kite whose descriptor carries a controller spec.
//! Its listener is bound before the value is constructed, so the `Server`
//! provider is available to the constructor. Each transport event runs as
//! its own local task and invokes every method hooked to it.

use std::rc::Rc;

use kite_config::defaults::DEFAULT_CONTROLLER_PORT;
use kite_config::DriverOptions;
use kite_types::{Address, Target};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::invoke::CallContext;
use super::Worker;
use crate::descriptor::{Hook, ResultTag};
use crate::error::{KiteError, Result};
use crate::message::{Peer, Session};
use crate::transport::{Ack, Listener, TransportEvent};

impl Worker {
    pub(super) fn on_create_controller(
        self: &Rc<Self>,
        from: Peer,
        session: Option<Session>,
        target: Target,
        options: Value,
        driver: DriverOptions,
    ) {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            let result = this
                .create_controller(target, options, driver)
                .await
                .map(Value::from);
            this.reply(from, session, result);
        });
    }

    async fn create_controller(
        self: &Rc<Self>,
        target: Target,
        options: Value,
        driver: DriverOptions,
    ) -> Result<Address> {
        let name = target
            .name()
            .ok_or_else(|| KiteError::protocol(format!("controller target {target} has no name")))?;
        let descriptor = self.registry.descriptor(name)?.clone();
        let spec = descriptor
            .controller
            .as_ref()
            .ok_or_else(|| KiteError::transport(format!("no transport in {name}")))?;

        let port = driver
            .port
            .or(spec.default_port)
            .unwrap_or(DEFAULT_CONTROLLER_PORT);
        let transport = self
            .transports
            .get(&driver.kind)
            .cloned()
            .ok_or_else(|| KiteError::transport(format!("unknown transport kind {}", driver.kind)))?;

        let Listener { server, events } = transport.listen(name, port, &driver.options).await?;

        let address = match self.create_root(&target, options, Some(server.clone())) {
            Ok(address) => address,
            Err(e) => {
                server.close();
                return Err(e);
            }
        };
        info!(
            worker = self.index,
            address,
            name = %name,
            kind = %driver.kind,
            port = server.port(),
            "Controller listening"
        );

        tokio::task::spawn_local(self.clone().serve(address, events));
        self.spawn_start(address);
        Ok(address)
    }

    /// Pump transport events while the controller lives
    async fn serve(self: Rc<Self>, address: Address, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if !self.kites.borrow().contains_key(&address) {
                break;
            }
            let this = self.clone();
            tokio::task::spawn_local(async move { this.on_transport_event(address, event).await });
        }
        debug!(worker = self.index, address, "Controller event stream closed");
    }

    async fn on_transport_event(self: Rc<Self>, address: Address, event: TransportEvent) {
        let (hook, ctx, mut ack) = match event {
            TransportEvent::Connected(connection) => (
                Hook::Connection,
                CallContext {
                    connection: Some(connection),
                    args: Vec::new(),
                },
                None,
            ),
            TransportEvent::Message {
                connection,
                event,
                args,
                ack,
            } => (
                Hook::Message(event),
                CallContext {
                    connection: Some(connection),
                    args,
                },
                ack,
            ),
            TransportEvent::Disconnected { connection, reason } => (
                Hook::Disconnect,
                CallContext {
                    connection: Some(connection),
                    args: reason.into_iter().map(Value::from).collect(),
                },
                None,
            ),
        };

        let methods: Vec<String> = match self.kites.borrow().get(&address) {
            Some(kite) => kite
                .descriptor
                .hooked(&hook)
                .map(|spec| spec.name.clone())
                .collect(),
            None => return,
        };
        if methods.is_empty() {
            debug!(worker = self.index, address, hook = ?hook, "No method hooked to transport event");
            return;
        }

        for method in methods {
            let prepared = match self.prepare(address, &method, ctx.args.clone(), &ctx) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(worker = self.index, address, method = %method, error = %e, "Hook lookup failed");
                    continue;
                }
            };
            let results = prepared.results.clone();
            match self.invoke(prepared).await {
                Ok(value) => route_result(&results, value, &ctx, &mut ack),
                Err(e) => {
                    warn!(worker = self.index, address, method = %method, error = %e, "Hook failed")
                }
            }
        }
    }
}

/// Deliver a hook's return value according to its result tags
fn route_result(results: &[ResultTag], value: Value, ctx: &CallContext, ack: &mut Option<Ack>) {
    for tag in results {
        match tag {
            ResultTag::Ack => {
                if let Some(ack) = ack.take() {
                    ack.send(value.clone());
                }
            }
            ResultTag::Emit => {
                let event = value.get("event").and_then(Value::as_str);
                if let (Some(connection), Some(event)) = (&ctx.connection, event) {
                    let data = value.get("data").cloned().unwrap_or(Value::Null);
                    connection.emit(event, vec![data]);
                }
            }
        }
    }
}
