//! Kite lifecycle: creation, start, timers, teardown
//!
//! ```text
//!   create  ─ value ─ properties ─ children (recursive) ─ deferred references
//!   start   ─ on_start ─ children start ─ timers armed ─ "started"
//!   destroy ─ detach from indices ─ on_stop ─ children stop ─ timers cleared
//!             ─ server closed ─ "stopped"
//! ```

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use kite_types::{Address, KiteId, Target};
use serde_json::{json, Map, Value};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::invoke::{guarded, resolve, CallContext};
use super::Worker;
use crate::behavior::Invocation;
use crate::descriptor::{IntervalSpec, Provider, TemplateScope};
use crate::error::{KiteError, Result};
use crate::kite::{Kite, KiteState, Subscriber};
use crate::message::{Action, Message, Peer, Session};
use crate::remote::Remote;
use crate::transport::Server;

/// Parameters of one kite in a tree being built
struct Spawn<'a> {
    name: &'a str,
    id: Option<KiteId>,
    options: Value,
    inputs: Map<String, Value>,
    root: Option<Address>,
    parent: Option<Address>,
    server: Option<Rc<dyn Server>>,
}

/// Bookkeeping for a tree under construction
#[derive(Default)]
struct Build {
    created: Vec<Address>,
    deferred: Vec<(Address, String, Provider)>,
}

/// A kite taken out of the arena, with its subtree
pub(crate) struct Detached {
    kite: Kite,
    children: Vec<Detached>,
}

impl Worker {
    pub(super) fn on_create(
        self: &Rc<Self>,
        from: Peer,
        session: Option<Session>,
        target: Target,
        options: Value,
        sync: bool,
    ) {
        let address = match self.create_root(&target, options, None) {
            Ok(address) => address,
            Err(e) => return self.reply(from, session, Err(e)),
        };

        if sync {
            let this = self.clone();
            tokio::task::spawn_local(async move {
                let result = this.start_kite(address).await.map(|()| Value::from(address));
                this.reply(from, session, result);
            });
        } else {
            self.reply(from, session, Ok(Value::from(address)));
            self.spawn_start(address);
        }
    }

    pub(super) fn spawn_start(self: &Rc<Self>, address: Address) {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = this.start_kite(address).await {
                warn!(worker = this.index, address, error = %e, "Kite failed to start");
            }
        });
    }

    /// Build and index a root kite with its whole child tree
    pub(super) fn create_root(
        &self,
        target: &Target,
        options: Value,
        server: Option<Rc<dyn Server>>,
    ) -> Result<Address> {
        if self.closing.get() {
            return Err(KiteError::Shutdown);
        }

        let (name, id) = match target {
            Target::Address(address) => {
                return Err(KiteError::protocol(format!("cannot create at address {address}")))
            }
            Target::Instance { name, id } => (name.as_str(), Some(id.clone())),
            Target::Global { name } => (name.as_str(), None),
        };

        let taken = match target {
            Target::Global { name } => self.outbox.global(name).is_some(),
            other => self.find(other).is_ok(),
        };
        if taken {
            return Err(KiteError::duplicate(target));
        }

        let mut build = Build::default();
        let spawn = Spawn {
            name,
            id,
            options,
            inputs: Map::new(),
            root: None,
            parent: None,
            server,
        };
        let result = self
            .create_tree(spawn, &mut build)
            .and_then(|address| self.inject_deferred(&build).map(|()| address));

        let address = match result {
            Ok(address) => address,
            Err(e) => {
                let mut kites = self.kites.borrow_mut();
                for address in &build.created {
                    kites.remove(address);
                }
                return Err(e);
            }
        };

        match target {
            Target::Instance { name, id } => {
                self.local_kites
                    .borrow_mut()
                    .entry(name.clone())
                    .or_default()
                    .insert(id.clone(), address);
            }
            Target::Global { name } => {
                self.outbox.register_global(name.clone(), address);
                self.outbox.broadcast_regist(name, address);
            }
            Target::Address(_) => {}
        }

        info!(
            worker = self.index,
            address,
            target = %target,
            kites = build.created.len(),
            "Kite created"
        );
        Ok(address)
    }

    fn create_tree(&self, spawn: Spawn<'_>, build: &mut Build) -> Result<Address> {
        let descriptor = self.registry.descriptor(spawn.name)?.clone();
        let address = self.allocator.borrow_mut().allocate()?;

        let mut kite = Kite {
            address,
            name: spawn.name.to_string(),
            id: spawn.id,
            options: spawn.options,
            descriptor: descriptor.clone(),
            value: None,
            root: spawn.root.unwrap_or(address),
            parent: spawn.parent,
            children: Vec::new(),
            refs: HashMap::new(),
            inputs: spawn.inputs,
            timers: Default::default(),
            listeners: Default::default(),
            state: KiteState::Created,
            server: spawn.server,
            remote: Remote::new(address, self.outbox.clone()),
        };

        let ctx = CallContext::default();
        let value = {
            let kites = self.kites.borrow();
            let params = descriptor
                .construction
                .iter()
                .map(|provider| resolve(&kites, &kite, provider, &ctx))
                .collect::<Result<Vec<_>>>()?;
            let value = descriptor
                .instantiate(Invocation::new(params, Vec::new()))
                .map_err(|e| KiteError::behavior(format!("{}::new", descriptor.name), e))?;

            for (property, providers) in &descriptor.properties {
                for provider in providers {
                    if let Provider::Reference(_) = provider {
                        build.deferred.push((address, property.clone(), provider.clone()));
                    } else {
                        value.inject(property, resolve(&kites, &kite, provider, &ctx)?);
                    }
                }
            }
            value
        };
        kite.value = Some(value);

        let children = match &descriptor.children {
            Some(template) => template(&TemplateScope {
                address,
                id: kite.id.as_ref(),
                options: &kite.options,
                inputs: &kite.inputs,
            }),
            None => Vec::new(),
        };
        let root = kite.root;
        self.kites.borrow_mut().insert(address, kite);
        build.created.push(address);

        for child in children {
            let spawn = Spawn {
                name: &child.name,
                id: None,
                options: child.options,
                inputs: child.inputs,
                root: Some(root),
                parent: Some(address),
                server: None,
            };
            let child_address = self.create_tree(spawn, build)?;

            let mut kites = self.kites.borrow_mut();
            if let Some(parent) = kites.get_mut(&address) {
                parent.children.push(child_address);
            }
            if let Some(reference) = child.reference {
                if let Some(root) = kites.get_mut(&root) {
                    root.refs.insert(reference, child_address);
                }
            }
        }

        debug!(worker = self.index, address, name = %descriptor.name, "Kite value constructed");
        Ok(address)
    }

    /// Reference properties, once every kite of the tree exists
    fn inject_deferred(&self, build: &Build) -> Result<()> {
        let kites = self.kites.borrow();
        let ctx = CallContext::default();
        for (address, property, provider) in &build.deferred {
            let kite = kites
                .get(address)
                .ok_or_else(|| KiteError::lookup(format!("kite {address} vanished while building")))?;
            let param = resolve(&kites, kite, provider, &ctx)?;
            if let Some(value) = &kite.value {
                value.inject(property, param);
            }
        }
        Ok(())
    }

    /// Start hook, then children, then timers, then the "started" event
    pub(super) fn start_kite(self: &Rc<Self>, address: Address) -> LocalBoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let (value, children) = {
                let mut kites = this.kites.borrow_mut();
                let kite = kites
                    .get_mut(&address)
                    .ok_or_else(|| KiteError::lookup(format!("kite {address} is gone")))?;
                kite.state = KiteState::Starting;
                (kite.value.clone(), kite.children.clone())
            };

            if let Some(value) = value {
                if let Err(err) = guarded("on_start", value.on_start()).await {
                    this.raise_error(address, &err);
                    return Err(err);
                }
            }

            for child in children {
                this.start_kite(child).await?;
            }

            let armed = this.arm_timers(address);
            {
                let mut kites = this.kites.borrow_mut();
                let kite = kites
                    .get_mut(&address)
                    .ok_or_else(|| KiteError::lookup(format!("kite {address} destroyed while starting")))?;
                kite.state = KiteState::Started;
                debug!(worker = this.index, kite = %kite, timers = armed, "Kite started");
            }

            this.fire_event(address, "started", vec![Value::from(address)]);
            Ok(())
        })
    }

    fn arm_timers(self: &Rc<Self>, address: Address) -> usize {
        let mut kites = self.kites.borrow_mut();
        let Some(kite) = kites.get_mut(&address) else {
            return 0;
        };
        let descriptor = kite.descriptor.clone();
        for (method, interval) in descriptor.intervals() {
            let handle = tokio::task::spawn_local(run_timer(
                Rc::downgrade(self),
                address,
                method.to_string(),
                interval.clone(),
            ));
            kite.timers.arm(interval.name.clone(), handle);
        }
        kite.timers.len()
    }

    /// Run one timer callback; false stops the timer
    async fn fire_timer(self: &Rc<Self>, address: Address, method: &str) -> bool {
        let prepared = match self.prepare(address, method, Vec::new(), &CallContext::default()) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(worker = self.index, address, method, error = %e, "Timer target gone");
                return false;
            }
        };
        match self.invoke(prepared).await {
            Ok(_) => true,
            Err(e) => {
                self.raise_error(address, &e);
                false
            }
        }
    }

    fn finish_timer(&self, address: Address, name: &str) {
        if let Some(kite) = self.kites.borrow_mut().get_mut(&address) {
            kite.timers.remove(name);
        }
    }

    /// Error event: every timer of the kite is cleared
    pub(super) fn raise_error(&self, address: Address, err: &KiteError) {
        let cleared = self
            .kites
            .borrow_mut()
            .get_mut(&address)
            .map(|kite| kite.timers.clear())
            .unwrap_or(0);
        warn!(worker = self.index, address, cleared, error = %err, "Kite error, timers cleared");
        self.fire_event(
            address,
            "error",
            vec![json!({"category": err.category(), "message": err.to_string()})],
        );
    }

    /// Fan an event out to the kite's subscribers; returns how many
    pub(super) fn fire_event(&self, address: Address, event: &str, args: Vec<Value>) -> usize {
        let subscribers = match self.kites.borrow().get(&address) {
            Some(kite) => kite.listeners.subscribers(event).to_vec(),
            None => return 0,
        };
        self.notify(address, &subscribers, args)
    }

    fn notify(&self, source: Address, subscribers: &[Subscriber], args: Vec<Value>) -> usize {
        for subscriber in subscribers {
            let target = Target::Address(subscriber.address);
            let message = Message::Action(Action {
                session: None,
                source: Some(source),
                target: target.clone(),
                route: None,
                method: subscriber.method.clone(),
                args: args.clone(),
            });
            if let Err(e) = self.outbox.post_target(&target, message) {
                warn!(worker = self.index, source, subscriber = subscriber.address, error = %e, "Failed to notify subscriber");
            }
        }
        subscribers.len()
    }

    pub(super) fn on_destroy(self: &Rc<Self>, from: Peer, session: Option<Session>, target: Target) {
        match self.find(&target).and_then(|address| self.detach(address)) {
            Ok(tree) => {
                let this = self.clone();
                tokio::task::spawn_local(async move {
                    let address = tree.kite.address;
                    this.stop_tree(tree).await;
                    this.reply(from, session, Ok(Value::from(address)));
                });
            }
            Err(e) => self.reply(from, session, Err(e)),
        }
    }

    /// Remove a kite and its subtree from every index
    pub(crate) fn detach(&self, address: Address) -> Result<Detached> {
        let mut kites = self.kites.borrow_mut();
        let kite = kites
            .remove(&address)
            .ok_or_else(|| KiteError::lookup(format!("no such @{address}")))?;

        if kite.is_root() {
            match &kite.id {
                Some(id) => {
                    let mut local = self.local_kites.borrow_mut();
                    if let Some(ids) = local.get_mut(&kite.name) {
                        if ids.get(id) == Some(&address) {
                            ids.remove(id);
                        }
                        if ids.is_empty() {
                            local.remove(&kite.name);
                        }
                    }
                }
                None => {
                    self.outbox.unregister_global(&kite.name, address);
                }
            }
        } else {
            if let Some(parent) = kite.parent.and_then(|parent| kites.get_mut(&parent)) {
                parent.children.retain(|child| *child != address);
            }
            if let Some(root) = kites.get_mut(&kite.root) {
                root.refs.retain(|_, child| *child != address);
            }
        }

        Ok(take_subtree(&mut kites, kite))
    }

    /// Stop hook, then children, then timers, server and "stopped"
    pub(crate) fn stop_tree(self: &Rc<Self>, mut node: Detached) -> LocalBoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            node.kite.state = KiteState::Stopping;
            if let Some(value) = node.kite.value.clone() {
                if let Err(e) = guarded("on_stop", value.on_stop()).await {
                    warn!(worker = this.index, kite = %node.kite, error = %e, "Stop hook failed");
                }
            }

            for child in std::mem::take(&mut node.children) {
                this.stop_tree(child).await;
            }

            let cleared = node.kite.timers.clear();
            if let Some(server) = node.kite.server.take() {
                server.close();
            }
            node.kite.state = KiteState::Stopped;

            let address = node.kite.address;
            let subscribers = node.kite.listeners.subscribers("stopped").to_vec();
            this.notify(address, &subscribers, vec![Value::from(address)]);
            info!(worker = this.index, kite = %node.kite, timers = cleared, "Kite stopped");
        })
    }

    /// Destroy every root kite; new creations are refused meanwhile
    pub(super) async fn shutdown(self: Rc<Self>) {
        self.closing.set(true);
        let mut roots: Vec<Address> = self
            .kites
            .borrow()
            .values()
            .filter(|kite| kite.is_root())
            .map(|kite| kite.address)
            .collect();
        roots.sort_unstable();

        for address in roots {
            if let Ok(tree) = self.detach(address) {
                self.stop_tree(tree).await;
            }
        }
        info!(worker = self.index, "Worker drained");
    }
}

fn take_subtree(kites: &mut HashMap<Address, Kite>, kite: Kite) -> Detached {
    let mut children = Vec::with_capacity(kite.children.len());
    for child in &kite.children {
        if let Some(child) = kites.remove(child) {
            children.push(take_subtree(kites, child));
        }
    }
    Detached { kite, children }
}

async fn run_timer(worker: Weak<Worker>, address: Address, method: String, interval: IntervalSpec) {
    let start = Instant::now() + interval.first_delay();

    match interval.repeat {
        None => {
            tokio::time::sleep_until(start).await;
            if let Some(worker) = worker.upgrade() {
                worker.fire_timer(address, &method).await;
                worker.finish_timer(address, &interval.name);
            }
        }
        Some(period) => {
            let mut ticker = interval_at(start, period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(worker) = worker.upgrade() else { return };
                if !worker.fire_timer(address, &method).await {
                    return;
                }
            }
        }
    }
}
