//! Kite Actor Runtime
//!
//! In-process actor runtime built from a coordinator and a pool of workers.
//! Every worker is an OS thread with its own single-threaded tokio runtime,
//! connected to every other worker and to the coordinator by channels.
//! Kites (actors) are sharded across workers by name and id, addressed by a
//! process-unique address, and talk to each other through [`Remote`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Coordinator                        │
//! │    boot plan ─► create / create_sync / controllers       │
//! └──────┬──────────────────┬──────────────────┬─────────────┘
//!        │                  │                  │
//! ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼──────┐
//! │  Worker 0   │◄──►│  Worker 1   │◄──►│  Worker 2   │
//! │ kites, subs │    │ kites, subs │    │ kites, subs │
//! │ timers, ... │◄───┼─────────────┼───►│ timers, ... │
//! └─────────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use kite_actors::{Behavior, Descriptor, Invocation, Registry};
//! use serde_json::{json, Value};
//!
//! struct Echo;
//!
//! #[async_trait(?Send)]
//! impl Behavior for Echo {
//!     async fn invoke(&self, method: &str, call: Invocation) -> anyhow::Result<Value> {
//!         match method {
//!             "echo" => Ok(call.args.first().cloned().unwrap_or(json!(null))),
//!             other => anyhow::bail!("no method {other}"),
//!         }
//!     }
//! }
//!
//! let registry = Registry::builder()
//!     .register(Descriptor::builder("echo").factory(|_| Ok(Echo)).build())
//!     .build()?;
//! # Ok::<(), kite_actors::KiteError>(())
//! ```

pub mod behavior;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod kite;
pub mod message;
pub mod registry;
pub mod remote;
pub mod routing;
pub mod session;
pub mod transport;
pub mod worker;

pub use behavior::{Behavior, Invocation, Param};
pub use coordinator::Coordinator;
pub use descriptor::{
    ChildSpec, ControllerSpec, Descriptor, DescriptorBuilder, Hook, IntervalSpec, MethodSpec,
    Provider, ResultTag, RouterSpec, TemplateScope,
};
pub use error::{KiteError, RemoteError, Result};
pub use kite::KiteState;
pub use message::{Endpoint, Message, Peer, Session};
pub use registry::{Registry, RegistryBuilder};
pub use remote::{Remote, RemoteTarget};
pub use session::{Reply, Sessions};
pub use transport::{
    Ack, Connection, Listener, MemoryClient, MemoryTransport, Server, Transport, TransportEvent,
    Transports,
};
pub use worker::{Worker, WorkerContext, WorkerExit, WorkerStats};

pub use kite_types::{worker_of, Address, KiteId, Target};
