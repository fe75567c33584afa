use super::*;

use std::cell::Cell;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::behavior::{Behavior, Invocation};
use crate::descriptor::{ChildSpec, Descriptor, DescriptorBuilder, IntervalSpec, MethodSpec, Provider};
use crate::message::duplex;

type Log = Arc<Mutex<Vec<String>>>;

struct Node {
    name: String,
    log: Log,
    fail_start: bool,
}

#[async_trait(?Send)]
impl Behavior for Node {
    async fn on_start(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("start {}", self.name));
        if self.fail_start {
            anyhow::bail!("{} refuses to start", self.name);
        }
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("stop {}", self.name));
        Ok(())
    }

    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
        match method {
            "spawn" => {
                let count: u64 = call.arg(0)?;
                Ok(json!(count * 2))
            }
            "tick" => Ok(Value::Null),
            "whoami" => call.value(0),
            "record" => {
                let args = Value::Array(call.args);
                self.log.lock().push(format!("{} {}", self.name, args));
                Ok(Value::Null)
            }
            "ask" => {
                let remote = call.remote().context("no remote")?.clone();
                Ok(remote.global("zone").call::<Value>("spawn", vec![json!(5)]).await?)
            }
            other => anyhow::bail!("no method {other}"),
        }
    }
}

#[derive(Default)]
struct Fuse {
    burns: Cell<u32>,
}

#[async_trait(?Send)]
impl Behavior for Fuse {
    async fn invoke(&self, method: &str, _call: Invocation) -> anyhow::Result<Value> {
        match method {
            "burn" => {
                self.burns.set(self.burns.get() + 1);
                if self.burns.get() >= 2 {
                    anyhow::bail!("fuse blown");
                }
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        }
    }
}

struct Bomb {
    armed_at_start: bool,
}

#[async_trait(?Send)]
impl Behavior for Bomb {
    async fn on_start(&self) -> anyhow::Result<()> {
        if self.armed_at_start {
            panic!("went off at start");
        }
        Ok(())
    }

    async fn invoke(&self, method: &str, _call: Invocation) -> anyhow::Result<Value> {
        match method {
            "boom" => panic!("boom"),
            _ => Ok(json!("alive")),
        }
    }
}

/// Answers `echo` without declaring it
struct Parrot;

#[async_trait(?Send)]
impl Behavior for Parrot {
    fn responds_to(&self, method: &str) -> bool {
        method == "echo"
    }

    async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
        match method {
            "echo" => Ok(json!({ "by": "parrot", "params": call.params.len(), "args": call.args })),
            "whoami" => call.value(0),
            other => anyhow::bail!("no method {other}"),
        }
    }
}

fn node(name: &'static str, log: &Log, fail_start: bool) -> DescriptorBuilder {
    let log = log.clone();
    Descriptor::builder(name).factory(move |_| {
        Ok(Node {
            name: name.to_string(),
            log: log.clone(),
            fail_start,
        })
    })
}

fn registry(log: &Log) -> Registry {
    Registry::builder()
        .register(
            node("zone", log, false)
                .children(|_| vec![ChildSpec::new("spawner").reference("spawner"), ChildSpec::new("npc_pool")])
                .build(),
        )
        .register(
            node("spawner", log, false)
                .method(MethodSpec::new("spawn"))
                .method(MethodSpec::new("tick").interval(IntervalSpec::every("tick", Duration::from_millis(20))))
                .build(),
        )
        .register(node("npc_pool", log, false).build())
        .register(
            node("npc", log, false)
                .method(MethodSpec::new("whoami").params([Provider::Address]))
                .method(MethodSpec::new("ask").params([Provider::Remote]))
                .build(),
        )
        .register(node("watcher", log, false).method(MethodSpec::new("record")).build())
        .register(node("sulky", log, true).build())
        .register(
            node("camp", log, false)
                .children(|_| vec![ChildSpec::new("npc_pool"), ChildSpec::new("broken")])
                .build(),
        )
        .register(
            Descriptor::builder("broken")
                .factory(|_: Invocation| -> anyhow::Result<Fuse> { anyhow::bail!("cannot build") })
                .build(),
        )
        .register(
            Descriptor::builder("fuse")
                .factory(|_| Ok(Fuse::default()))
                .method(MethodSpec::new("burn").interval(IntervalSpec::every("burn", Duration::from_millis(10))))
                .method(MethodSpec::new("idle").interval(IntervalSpec::every("idle", Duration::from_secs(3600))))
                .build(),
        )
        .register(
            Descriptor::builder("bomb")
                .factory(|_| Ok(Bomb { armed_at_start: false }))
                .method(MethodSpec::new("boom"))
                .method(MethodSpec::new("alive"))
                .build(),
        )
        .register(
            Descriptor::builder("dud")
                .factory(|_| Ok(Bomb { armed_at_start: true }))
                .build(),
        )
        .register(node("perch", log, false).children(|_| vec![ChildSpec::new("parrot")]).build())
        .register(
            Descriptor::builder("parrot")
                .factory(|_| Ok(Parrot))
                .method(MethodSpec::new("whoami").params([Provider::Address]))
                .build(),
        )
        .build()
        .unwrap()
}

/// A single worker driven through its coordinator channel
struct Harness {
    worker: Rc<Worker>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    run: JoinHandle<()>,
    next: Session,
}

impl Harness {
    fn start(registry: Registry) -> Self {
        let ctx = WorkerContext {
            index: 0,
            worker_count: 1,
            registry: Arc::new(registry),
            transports: Arc::new(Transports::new()),
        };
        let (worker, inbox) = Worker::new(ctx).unwrap();
        let (ours, theirs) = duplex();
        let run = tokio::task::spawn_local(worker.clone().run(theirs, inbox));
        ours.tx.send(Message::Start).unwrap();

        Self {
            worker,
            tx: ours.tx,
            rx: ours.rx,
            run,
            next: 0,
        }
    }

    async fn request(&mut self, build: impl FnOnce(Session) -> Message) -> std::result::Result<Value, RemoteError> {
        self.next += 1;
        let session = self.next;
        self.tx.send(build(session)).unwrap();
        loop {
            match self.rx.recv().await {
                Some(Message::Resp { session: s, result }) if s == session => return result,
                Some(_) => continue,
                None => panic!("worker channel closed"),
            }
        }
    }

    async fn create(&mut self, target: Target) -> std::result::Result<Address, RemoteError> {
        self.request(|session| Message::Create {
            session: Some(session),
            target,
            options: Value::Null,
        })
        .await
        .map(|value| value.as_u64().unwrap())
    }

    async fn create_sync(&mut self, target: Target) -> std::result::Result<Address, RemoteError> {
        self.request(|session| Message::CreateSync {
            session: Some(session),
            target,
            options: Value::Null,
        })
        .await
        .map(|value| value.as_u64().unwrap())
    }

    async fn destroy(&mut self, target: Target) -> std::result::Result<Value, RemoteError> {
        self.request(|session| Message::Destroy {
            session: Some(session),
            target,
        })
        .await
    }

    async fn action(&mut self, target: Target, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteError> {
        let method = method.to_string();
        self.request(|session| {
            Message::Action(crate::message::Action {
                session: Some(session),
                source: None,
                target,
                route: None,
                method,
                args,
            })
        })
        .await
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

fn local<F: std::future::Future<Output = ()>>(test: F) -> impl std::future::Future<Output = ()> {
    async move { LocalSet::new().run_until(test).await }
}

#[tokio::test]
async fn test_start_runs_parents_first() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        harness.create_sync(Target::global("zone")).await.unwrap();

        assert_eq!(*log.lock(), vec!["start zone", "start spawner", "start npc_pool"]);
        let stats = harness.worker.stats();
        assert_eq!(stats.kites, 3);
        assert_eq!(stats.globals, 1);
        assert_eq!(stats.timers, 1);
    })
    .await;
}

#[tokio::test]
async fn test_cascading_destroy_clears_indices() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        let zone = harness.create_sync(Target::global("zone")).await.unwrap();
        harness.create_sync(Target::instance("npc", 10u64)).await.unwrap();
        log.lock().clear();

        let destroyed = harness.destroy(Target::global("zone")).await.unwrap();
        assert_eq!(destroyed, json!(zone));
        assert_eq!(*log.lock(), vec!["stop zone", "stop spawner", "stop npc_pool"]);

        let stats = harness.worker.stats();
        assert_eq!(stats.kites, 1);
        assert_eq!(stats.globals, 0);
        assert_eq!(stats.timers, 0);

        harness.destroy(Target::instance("npc", 10u64)).await.unwrap();
        let stats = harness.worker.stats();
        assert_eq!(stats.kites, 0);
        assert_eq!(stats.local, 0);

        let err = harness.destroy(Target::global("zone")).await.unwrap_err();
        assert_eq!(err.category, "lookup");
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_create_rejected() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        harness.create(Target::instance("npc", 10u64)).await.unwrap();
        let err = harness.create(Target::instance("npc", 10u64)).await.unwrap_err();
        assert_eq!(err.category, "duplicate");

        harness.create(Target::global("watcher")).await.unwrap();
        let err = harness.create(Target::global("watcher")).await.unwrap_err();
        assert_eq!(err.category, "duplicate");

        // Same name, other id
        harness.create(Target::instance("npc", 11u64)).await.unwrap();
        assert_eq!(harness.worker.stats().local, 2);
    })
    .await;
}

#[tokio::test]
async fn test_failed_creation_leaves_no_kites() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        let err = harness.create(Target::global("camp")).await.unwrap_err();
        assert_eq!(err.category, "behavior");

        let stats = harness.worker.stats();
        assert_eq!(stats.kites, 0);
        assert_eq!(stats.globals, 0);
        assert!(harness.worker.outbox().global("camp").is_none());

        let err = harness.create(Target::global("nobody")).await.unwrap_err();
        assert_eq!(err.category, "lookup");
    })
    .await;
}

#[tokio::test]
async fn test_create_sync_reports_start_failure() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        let err = harness.create_sync(Target::global("sulky")).await.unwrap_err();
        assert_eq!(err.category, "behavior");
        assert!(err.message.contains("refuses to start"));
    })
    .await;
}

#[tokio::test]
async fn test_global_lookup_requires_registration() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        let err = harness.worker.outbox().choose(&Target::global("zone")).unwrap_err();
        assert!(err.is_lookup());
        assert!(err.to_string().contains("can't find global target:zone"));

        let zone = harness.create(Target::global("zone")).await.unwrap();
        assert_eq!(harness.worker.outbox().choose(&Target::global("zone")).unwrap(), 0);
        assert_eq!(harness.worker.find(&Target::global("zone")).unwrap(), zone);
    })
    .await;
}

#[tokio::test]
async fn test_action_reaches_descendant() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        harness.create_sync(Target::global("zone")).await.unwrap();

        // Declared on the spawner child, not on the zone
        let doubled = harness
            .action(Target::global("zone"), "spawn", vec![json!(21)])
            .await
            .unwrap();
        assert_eq!(doubled, json!(42));

        let err = harness
            .action(Target::global("zone"), "fly", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.category, "lookup");
    })
    .await;
}

#[tokio::test]
async fn test_address_provider_and_remote_call() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        harness.create_sync(Target::global("zone")).await.unwrap();
        let npc = harness.create_sync(Target::instance("npc", 7u64)).await.unwrap();

        let me = harness
            .action(Target::instance("npc", 7u64), "whoami", Vec::new())
            .await
            .unwrap();
        assert_eq!(me, json!(npc));

        let answer = harness
            .action(Target::address(npc), "ask", Vec::new())
            .await
            .unwrap();
        assert_eq!(answer, json!(10));
        assert_eq!(harness.worker.outbox().pending_sessions(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_timer_error_clears_timers() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        let watcher = harness.create_sync(Target::global("watcher")).await.unwrap();
        harness.create_sync(Target::global("fuse")).await.unwrap();
        assert_eq!(harness.worker.stats().timers, 2);

        harness
            .tx
            .send(Message::Listen {
                target: Target::global("fuse"),
                event: "error".into(),
                subscriber: watcher,
                method: "record".into(),
            })
            .unwrap();

        eventually(|| log.lock().iter().any(|line| line.starts_with("watcher "))).await;
        let recorded = log.lock().iter().find(|line| line.starts_with("watcher ")).cloned().unwrap();
        assert!(recorded.contains("\"category\":\"behavior\""));
        assert!(recorded.contains("fuse blown"));
        assert_eq!(harness.worker.stats().timers, 0);
    })
    .await;
}

#[tokio::test]
async fn test_emit_reaches_subscribers() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        let watcher = harness.create_sync(Target::global("watcher")).await.unwrap();
        harness.create_sync(Target::instance("npc", 3u64)).await.unwrap();
        log.lock().clear();

        let npc = Target::instance("npc", 3u64);
        for message in [
            Message::Listen {
                target: npc.clone(),
                event: "hit".into(),
                subscriber: watcher,
                method: "record".into(),
            },
            Message::Emit {
                target: npc.clone(),
                event: "hit".into(),
                args: vec![json!(12)],
            },
        ] {
            harness.tx.send(message).unwrap();
        }
        eventually(|| log.lock().len() == 1).await;
        assert_eq!(log.lock()[0], "watcher [12]");
        assert_eq!(harness.worker.stats().listeners, 1);

        harness
            .tx
            .send(Message::Remove {
                target: npc.clone(),
                event: "hit".into(),
                subscriber: watcher,
                method: "record".into(),
            })
            .unwrap();
        eventually(|| harness.worker.stats().listeners == 0).await;
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_drains_every_kite() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        harness.create_sync(Target::global("zone")).await.unwrap();
        harness.create_sync(Target::instance("npc", 1u64)).await.unwrap();
        log.lock().clear();

        harness.tx.send(Message::Shutdown).unwrap();
        (&mut harness.run).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["stop zone", "stop spawner", "stop npc_pool", "stop npc"]
        );
        assert_eq!(harness.worker.stats().kites, 0);
        assert!(!harness.worker.is_running());
    })
    .await;
}

#[tokio::test]
async fn test_panicking_method_is_reported_to_caller() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        harness.create_sync(Target::global("bomb")).await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            harness.action(Target::global("bomb"), "boom", Vec::new()),
        )
        .await
        .expect("panicking call must still be answered")
        .unwrap_err();
        assert_eq!(err.category, "behavior");
        assert!(err.message.contains("panicked: boom"));

        let alive = harness
            .action(Target::global("bomb"), "alive", Vec::new())
            .await
            .unwrap();
        assert_eq!(alive, json!("alive"));
        assert_eq!(harness.worker.outbox().pending_sessions(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_panicking_start_hook_fails_creation() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));

        let err = tokio::time::timeout(Duration::from_secs(2), harness.create_sync(Target::global("dud")))
            .await
            .expect("panicking start must still be answered")
            .unwrap_err();
        assert_eq!(err.category, "behavior");
        assert!(err.message.contains("went off at start"));
        assert!(harness.worker.is_running());
    })
    .await;
}

#[tokio::test]
async fn test_undeclared_method_runs_on_child_with_args_only() {
    local(async {
        let log = Log::default();
        let mut harness = Harness::start(registry(&log));
        let perch = harness.create_sync(Target::global("perch")).await.unwrap();

        let echoed = harness
            .action(Target::global("perch"), "echo", vec![json!(1), json!("two")])
            .await
            .unwrap();
        assert_eq!(echoed, json!({ "by": "parrot", "params": 0, "args": [1, "two"] }));

        // Declared methods on the same child still get their providers
        let parrot = harness
            .action(Target::address(perch), "whoami", Vec::new())
            .await
            .unwrap()
            .as_u64()
            .unwrap();
        assert_ne!(parrot, perch);
        assert_eq!(harness.worker.find(&Target::address(parrot)).unwrap(), parrot);
        assert_eq!(harness.worker.stats().kites, 2);
    })
    .await;
}
