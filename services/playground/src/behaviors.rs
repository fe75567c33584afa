//! Demo behaviors
//!
//! Every player owns a chat child it reaches by reference, calls another
//! player on a timer and pushes the result to its client through the
//! `client` router. The gate controller tracks logged-in clients by player
//! id and is the router's destination.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use kite_actors::{
    Behavior, ChildSpec, Connection, Descriptor, IntervalSpec, Invocation, MethodSpec, Param, Provider, Registry,
    Remote, ResultTag, RouterSpec, Server,
};
use kite_types::{Address, Target};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const PLAYER: &str = "player";
pub const CHAT: &str = "chat";
pub const GATE: &str = "gate";
pub const CLIENT_ROUTER: &str = "client";

pub struct Chat;

#[async_trait(?Send)]
impl Behavior for Chat {
    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
        match method {
            "ping" => {
                info!(args = ?call.args, "Chat ping");
                Ok(Value::Null)
            }
            "add" => {
                let a: i64 = call.arg(0)?;
                let b: i64 = call.arg(1)?;
                Ok(json!(a + b))
            }
            other => anyhow::bail!("chat has no method {other}"),
        }
    }
}

pub struct Player {
    address: Address,
    id: u64,
    remote: Remote,
    chat: RefCell<Option<Rc<dyn Behavior>>>,
    ticks: Cell<u64>,
}

#[async_trait(?Send)]
impl Behavior for Player {
    async fn on_start(&self) -> anyhow::Result<()> {
        info!(
            address = self.address,
            player = self.id,
            chat = self.chat.borrow().is_some(),
            "Player started"
        );
        Ok(())
    }

    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
        match method {
            "print" => {
                let tick = self.ticks.get() + 1;
                self.ticks.set(tick);
                let peer = 1 + tick % 2;

                let sum: i64 = self
                    .remote
                    .to(PLAYER, peer)
                    .call("add", vec![json!(1), json!(2)])
                    .await?;
                info!(player = self.id, peer, sum, "Remote add done");

                self.remote
                    .route(vec![json!(CLIENT_ROUTER), json!(self.id)])
                    .send("tick", vec![json!(tick), json!(sum)])?;
                Ok(json!(sum))
            }
            "chat" => {
                let chat = self.chat.borrow().clone().context("chat reference missing")?;
                chat.invoke("add", Invocation::args(call.args)).await
            }
            other => anyhow::bail!("player has no method {other}"),
        }
    }

    fn inject(&self, property: &str, param: Param) {
        if let ("chat", Param::Reference(chat)) = (property, param) {
            *self.chat.borrow_mut() = Some(chat);
        }
    }
}

pub struct Gateway {
    server: Rc<dyn Server>,
    clients: RefCell<HashMap<u64, Rc<dyn Connection>>>,
    players: RefCell<HashMap<String, u64>>,
}

impl Gateway {
    fn connection(call: &Invocation) -> anyhow::Result<Rc<dyn Connection>> {
        call.connection().cloned().context("no connection in context")
    }
}

#[async_trait(?Send)]
impl Behavior for Gateway {
    async fn on_start(&self) -> anyhow::Result<()> {
        info!(port = self.server.port(), "Gate open");
        Ok(())
    }

    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
        match method {
            "on_connected" => {
                let connection = Self::connection(&call)?;
                info!(connection = %connection.id(), "Client connected");
                Ok(Value::Null)
            }
            "on_disconnect" => {
                let connection = Self::connection(&call)?;
                if let Some(pid) = self.players.borrow_mut().remove(&connection.id()) {
                    self.clients.borrow_mut().remove(&pid);
                }
                info!(connection = %connection.id(), reason = ?call.args.first(), "Client disconnected");
                Ok(Value::Null)
            }
            "login" => {
                let connection = Self::connection(&call)?;
                let body: Value = call.value(1)?;
                let Some(pid) = body.get("pid").and_then(Value::as_u64) else {
                    connection.disconnect();
                    return Ok(json!({ "event": "login", "data": { "ok": false } }));
                };

                self.players.borrow_mut().insert(connection.id(), pid);
                self.clients.borrow_mut().insert(pid, connection);
                info!(player = pid, "Client logged in");
                Ok(json!({ "event": "login", "data": { "ok": true } }))
            }
            "ping" => {
                debug!(args = ?call.args, "Client ping");
                Ok(json!("hello"))
            }
            "send_client" => {
                let pid: u64 = call.arg(0)?;
                let event: String = call.arg(1)?;
                let args = call.args.get(2..).map(<[Value]>::to_vec).unwrap_or_default();
                let client = self.clients.borrow().get(&pid).cloned();
                match client {
                    Some(client) => client.emit(&event, args),
                    None => debug!(player = pid, event = %event, "No client for player"),
                }
                Ok(Value::Null)
            }
            "broadcast" => {
                let event: String = call.arg(0)?;
                self.server.broadcast(&event, call.args.get(1..).unwrap_or_default());
                Ok(Value::Null)
            }
            other => anyhow::bail!("gate has no method {other}"),
        }
    }
}

/// Route `["client", pid]` to the gate and turn the call into `send_client(pid, method, ..args)`
fn client_router() -> RouterSpec {
    RouterSpec::new(CLIENT_ROUTER, |_| Ok(Target::global(GATE))).action(|route, method, args| {
        let mut rewritten = vec![route.first().cloned().unwrap_or(Value::Null), Value::from(method)];
        rewritten.extend(args);
        ("send_client".to_string(), rewritten)
    })
}

pub fn registry() -> kite_actors::Result<Registry> {
    Registry::builder()
        .register(
            Descriptor::builder(CHAT)
                .factory(|_| Ok(Chat))
                .method(MethodSpec::new("ping"))
                .method(MethodSpec::new("add"))
                .build(),
        )
        .register(
            Descriptor::builder(PLAYER)
                .construct([Provider::Address, Provider::Id, Provider::Remote])
                .factory(|call| {
                    Ok(Player {
                        address: call.value(0)?,
                        id: call.value(1)?,
                        remote: call.remote().cloned().context("player needs a remote")?,
                        chat: RefCell::new(None),
                        ticks: Cell::new(0),
                    })
                })
                .property("chat", [Provider::Reference("chat".into())])
                .children(|_| vec![ChildSpec::new(CHAT).reference("chat")])
                .method(MethodSpec::new("print").interval(IntervalSpec::every("show_debug", Duration::from_secs(2))))
                .method(MethodSpec::new("chat"))
                .build(),
        )
        .register(
            Descriptor::builder(GATE)
                .construct([Provider::Server])
                .factory(|call| {
                    Ok(Gateway {
                        server: call.server().cloned().context("gate needs a server")?,
                        clients: RefCell::new(HashMap::new()),
                        players: RefCell::new(HashMap::new()),
                    })
                })
                .method(MethodSpec::new("on_connected").params([Provider::Connection]).on_connection())
                .method(MethodSpec::new("on_disconnect").params([Provider::Connection]).on_disconnect())
                .method(
                    MethodSpec::new("login")
                        .params([Provider::Connection, Provider::MessageBody { index: 0, key: None }])
                        .on_message("login")
                        .result(ResultTag::Emit),
                )
                .method(MethodSpec::new("ping").on_message("ping").result(ResultTag::Ack))
                .method(MethodSpec::new("send_client"))
                .method(MethodSpec::new("broadcast"))
                .router(client_router())
                .controller(None)
                .build(),
        )
        .build()
}
