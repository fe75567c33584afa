//! Coordinator
//!
//! Owns the worker pool: spawns the worker threads, wires them into a full
//! mesh, drives the boot plan and watches for worker exits. It runs on the
//! caller's thread inside a `LocalSet` and talks to workers only through
//! their coordinator channels.
//!
//! ## Boot sequence
//!
//! ```text
//!   start_workers ── spawn N threads ── connect every pair ── start
//!   boot_services ── dependency forest, parents started before children
//!   boot_controllers ── bind one transport listener per controller
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::future::LocalBoxFuture;
use kite_config::{BootPlan, DriverOptions, ServiceEntry};
use kite_types::{Address, Target};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{KiteError, Result};
use crate::message::{duplex, Action, Message, Session};
use crate::registry::Registry;
use crate::routing;
use crate::session::{Reply, Sessions};
use crate::transport::Transports;
use crate::worker::{Worker, WorkerContext, WorkerExit, WorkerStats};

struct WorkerLink {
    tx: mpsc::UnboundedSender<Message>,
    thread: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    cluster_id: String,
    plan: BootPlan,
    worker_count: usize,
    registry: Arc<Registry>,
    transports: Arc<Transports>,
    links: RefCell<Vec<Option<WorkerLink>>>,
    sessions: RefCell<Sessions>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: RefCell<Option<mpsc::UnboundedReceiver<WorkerExit>>>,
}

impl Coordinator {
    pub fn new(plan: BootPlan, registry: Registry, transports: Transports) -> Rc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let worker_count = plan.threads().max(1);
        let cluster_id = format!("kite-{}", Uuid::new_v4());
        info!(cluster = %cluster_id, workers = worker_count, "Creating coordinator");

        Rc::new(Self {
            cluster_id,
            plan,
            worker_count,
            registry: Arc::new(registry),
            transports: Arc::new(transports),
            links: RefCell::new(Vec::new()),
            sessions: RefCell::new(Sessions::new()),
            exit_tx,
            exit_rx: RefCell::new(Some(exit_rx)),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn live_workers(&self) -> usize {
        self.links.borrow().iter().flatten().count()
    }

    /// Spawn and wire the workers, then run the boot plan.
    ///
    /// Must run inside a `LocalSet`. Any error aborts the boot.
    pub async fn start(self: &Rc<Self>) -> Result<()> {
        self.plan.validate()?;
        for service in &self.plan.services {
            if !self.registry.contains(&service.name) {
                return Err(KiteError::boot(format!("no such service:{}", service.name)));
            }
        }

        self.start_workers()?;
        self.boot_services().await?;
        self.boot_controllers().await?;
        info!(cluster = %self.cluster_id, "Boot complete");
        Ok(())
    }

    /// Spawn N worker threads and connect every pair of them
    pub fn start_workers(self: &Rc<Self>) -> Result<()> {
        if !self.links.borrow().is_empty() {
            return Err(KiteError::boot("workers already started"));
        }

        for index in 0..self.worker_count {
            let (ours, theirs) = duplex();
            let ctx = WorkerContext {
                index,
                worker_count: self.worker_count,
                registry: self.registry.clone(),
                transports: self.transports.clone(),
            };
            let thread = Worker::spawn(ctx, theirs, self.exit_tx.clone())
                .map_err(|e| KiteError::boot(format!("failed to spawn worker {index}: {e}")))?;

            self.attach(index, ours.rx);
            self.links.borrow_mut().push(Some(WorkerLink {
                tx: ours.tx,
                thread: Some(thread),
            }));
        }

        for i in 0..self.worker_count {
            for j in (i + 1)..self.worker_count {
                let (a, b) = duplex();
                self.post(i, Message::Connect { index: j, endpoint: a })?;
                self.post(j, Message::Connect { index: i, endpoint: b })?;
            }
        }
        for index in 0..self.worker_count {
            self.post(index, Message::Start)?;
        }

        info!(cluster = %self.cluster_id, workers = self.worker_count, "Worker mesh wired");
        Ok(())
    }

    fn attach(self: &Rc<Self>, index: usize, mut rx: mpsc::UnboundedReceiver<Message>) {
        let coordinator: Weak<Self> = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            while let Some(message) = rx.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.on_message(index, message);
            }
        });
    }

    fn on_message(&self, index: usize, message: Message) {
        match message {
            Message::Resp { session, result } => {
                if !self.sessions.borrow_mut().complete(session, result) {
                    debug!(worker = index, session, "Dropped response for unknown session");
                }
            }
            other => {
                warn!(worker = index, kind = other.kind(), "Protocol error: unexpected message at coordinator")
            }
        }
    }

    fn post(&self, index: usize, message: Message) -> Result<()> {
        match self.links.borrow().get(index) {
            Some(Some(link)) => link
                .tx
                .send(message)
                .map_err(|_| KiteError::channel_closed(format!("worker-{index}"))),
            _ => Err(KiteError::channel_closed(format!("worker-{index}"))),
        }
    }

    /// Send a session-carrying request to worker `index`
    pub fn call<T>(&self, index: usize, build: impl FnOnce(Session) -> Message) -> Reply<T> {
        Sessions::request(&self.sessions, |session| self.post(index, build(session)))
    }

    /// Placement of a target on the pool
    pub fn choose(&self, target: &Target) -> Result<usize> {
        routing::placement(target, self.worker_count)
    }

    fn call_target<T>(&self, target: &Target, build: impl FnOnce(Session) -> Message) -> Reply<T> {
        match self.choose(target) {
            Ok(index) => self.call(index, build),
            Err(e) => Reply::failed(e),
        }
    }

    /// Create a kite; resolves once it exists, before it has started
    pub fn create(&self, target: Target, options: Value) -> Reply<Address> {
        self.call_target(&target.clone(), |session| Message::Create {
            session: Some(session),
            target,
            options,
        })
    }

    /// Create a kite; resolves once its whole tree has started
    pub fn create_sync(&self, target: Target, options: Value) -> Reply<Address> {
        self.call_target(&target.clone(), |session| Message::CreateSync {
            session: Some(session),
            target,
            options,
        })
    }

    pub fn create_controller(&self, target: Target, options: Value, driver: DriverOptions) -> Reply<Address> {
        self.call_target(&target.clone(), |session| Message::CreateController {
            session: Some(session),
            target,
            options,
            driver,
        })
    }

    /// Destroy a kite and its subtree; resolves once all of it has stopped
    pub fn destroy(&self, target: Target) -> Reply<Address> {
        self.call_target(&target.clone(), |session| Message::Destroy {
            session: Some(session),
            target,
        })
    }

    /// Invoke a method on any kite and wait for the result
    pub fn action<T: DeserializeOwned>(&self, target: Target, method: &str, args: Vec<Value>) -> Reply<T> {
        let method = method.to_string();
        self.call_target(&target.clone(), |session| {
            Message::Action(Action {
                session: Some(session),
                source: None,
                target,
                route: None,
                method,
                args,
            })
        })
    }

    /// Fire-and-forget method invocation
    pub fn send(&self, target: Target, method: &str, args: Vec<Value>) -> Result<()> {
        let index = self.choose(&target)?;
        self.post(
            index,
            Message::Action(Action {
                session: None,
                source: None,
                target,
                route: None,
                method: method.to_string(),
                args,
            }),
        )
    }

    /// Table snapshot of one worker
    pub fn stats(&self, index: usize) -> Reply<WorkerStats> {
        self.call(index, |session| Message::Stats { session })
    }

    /// Table snapshots of every live worker, in index order
    pub async fn stats_all(&self) -> Result<Vec<WorkerStats>> {
        let live: Vec<usize> = self
            .links
            .borrow()
            .iter()
            .enumerate()
            .filter_map(|(index, link)| link.as_ref().map(|_| index))
            .collect();
        futures::future::try_join_all(live.into_iter().map(|index| self.stats(index))).await
    }

    /// Create the service forest; each parent has started before its children are created
    pub async fn boot_services(&self) -> Result<()> {
        let forest = BootForest::build(&self.plan.services)?;
        for &root in &forest.roots {
            self.boot_node(&forest, root, true).await?;
        }
        Ok(())
    }

    fn boot_node<'a>(&'a self, forest: &'a BootForest<'a>, node: usize, root: bool) -> LocalBoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let entry = forest.entries[node];
            let target = Target::named(entry.name.clone(), entry.id.clone());
            let options = entry.options.clone().unwrap_or(Value::Null);
            let children = &forest.children[node];

            if root && children.is_empty() {
                let address = self
                    .create(target.clone(), options)
                    .await
                    .map_err(|e| KiteError::boot(format!("failed to create {target}: {e}")))?;
                info!(cluster = %self.cluster_id, target = %target, address, "Service created");
                return Ok(());
            }

            let address = self
                .create_sync(target.clone(), options)
                .await
                .map_err(|e| KiteError::boot(format!("failed to start {target}: {e}")))?;
            info!(cluster = %self.cluster_id, target = %target, address, dependents = children.len(), "Service started");

            for &child in children {
                self.boot_node(forest, child, false).await?;
            }
            Ok(())
        })
    }

    /// Bind every controller of the plan
    pub async fn boot_controllers(&self) -> Result<()> {
        for entry in &self.plan.controllers {
            let target = Target::named(entry.name.clone(), entry.id.clone());
            let options = entry.options.clone().unwrap_or(Value::Null);
            let driver = entry.driver.clone().unwrap_or_default();
            let address = self
                .create_controller(target.clone(), options, driver)
                .await
                .map_err(|e| KiteError::boot(format!("failed to bind controller {target}: {e}")))?;
            info!(cluster = %self.cluster_id, target = %target, address, "Controller created");
        }
        Ok(())
    }

    /// Ask every live worker to stop its kites and exit
    pub fn shutdown(&self) {
        info!(cluster = %self.cluster_id, workers = self.live_workers(), "Shutting down workers");
        for index in 0..self.links.borrow().len() {
            if let Err(e) = self.post(index, Message::Shutdown) {
                debug!(worker = index, error = %e, "Worker already gone");
            }
        }
    }

    fn probe(&self) {
        for index in 0..self.links.borrow().len() {
            if self.post(index, Message::Check).is_ok() {
                debug!(worker = index, "Health probe sent");
            }
        }
    }

    /// Wait until every worker has exited; returns how many exited abnormally.
    ///
    /// Dead workers are not restarted. Not cancel safe: the exit receiver is
    /// taken for the duration of the call, so don't race it in a `select!`.
    pub async fn run_until_exit(&self) -> usize {
        let Some(mut exits) = self.exit_rx.borrow_mut().take() else {
            return 0;
        };

        let mut abnormal = 0;
        while self.live_workers() > 0 {
            let Some(exit) = exits.recv().await else {
                break;
            };
            let link = self
                .links
                .borrow_mut()
                .get_mut(exit.index)
                .and_then(Option::take);
            if let Some(thread) = link.and_then(|link| link.thread) {
                // The exit is reported as the thread's last act
                if thread.join().is_err() {
                    debug!(worker = exit.index, "Worker thread panicked");
                }
            }

            if exit.abnormal {
                abnormal += 1;
                error!(cluster = %self.cluster_id, worker = exit.index, live = self.live_workers(), "Worker died");
                self.probe();
            }
        }

        *self.exit_rx.borrow_mut() = Some(exits);
        info!(cluster = %self.cluster_id, abnormal, "All workers exited");
        abnormal
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("cluster_id", &self.cluster_id)
            .field("worker_count", &self.worker_count)
            .field("live", &self.live_workers())
            .finish()
    }
}

/// Services arranged by `depend_on`
struct BootForest<'a> {
    entries: Vec<&'a ServiceEntry>,
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
}

impl<'a> BootForest<'a> {
    fn build(services: &'a [ServiceEntry]) -> Result<Self> {
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (index, entry) in services.iter().enumerate() {
            by_name.entry(entry.name.as_str()).or_insert(index);
        }

        let mut roots = Vec::new();
        let mut children = vec![Vec::new(); services.len()];
        for (index, entry) in services.iter().enumerate() {
            match &entry.depend_on {
                None => roots.push(index),
                Some(dependency) => {
                    let parent = by_name.get(dependency.as_str()).ok_or_else(|| {
                        KiteError::boot(format!("{} depends on unknown service {dependency}", entry.name))
                    })?;
                    children[*parent].push(index);
                }
            }
        }

        // Anything not reachable from a root sits on a cycle
        let mut reached = vec![false; services.len()];
        let mut stack = roots.clone();
        while let Some(node) = stack.pop() {
            if !std::mem::replace(&mut reached[node], true) {
                stack.extend(children[node].iter().copied());
            }
        }
        let cyclic: Vec<&str> = services
            .iter()
            .zip(&reached)
            .filter(|(_, reached)| !**reached)
            .map(|(entry, _)| entry.name.as_str())
            .collect();
        if !cyclic.is_empty() {
            return Err(KiteError::boot(format!(
                "dependency cycle among services: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self {
            entries: services.iter().collect(),
            roots,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, depend_on: Option<&str>) -> ServiceEntry {
        ServiceEntry {
            name: name.to_string(),
            id: None,
            depend_on: depend_on.map(str::to_string),
            options: None,
        }
    }

    #[test]
    fn test_forest_of_any_depth() {
        let services = vec![
            service("zone", None),
            service("spawner", Some("zone")),
            service("ticker", None),
            service("npc_pool", Some("spawner")),
        ];
        let forest = BootForest::build(&services).unwrap();

        assert_eq!(forest.roots, vec![0, 2]);
        assert_eq!(forest.children[0], vec![1]);
        assert_eq!(forest.children[1], vec![3]);
        assert!(forest.children[2].is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let services = vec![
            service("zone", None),
            service("a", Some("b")),
            service("b", Some("a")),
        ];
        let err = BootForest::build(&services).err().unwrap();
        assert_eq!(err.category(), "boot");
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let services = vec![service("spawner", Some("zone"))];
        assert!(BootForest::build(&services).is_err());
    }
}
