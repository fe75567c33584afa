//! Kite entity
//!
//! A kite is the addressable unit of state hosted by a worker: identity,
//! the behavior value, its place in the parent/child tree, armed timers and
//! event subscribers. Kites live in the worker's arena keyed by address, so
//! `root`, `parent` and `children` are plain addresses.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use kite_types::{Address, KiteId, Target};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::behavior::Behavior;
use crate::descriptor::Descriptor;
use crate::remote::Remote;
use crate::transport::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KiteState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Armed timers of one kite. Dropping the table aborts them.
#[derive(Debug, Default)]
pub struct TimerTable {
    handles: HashMap<String, JoinHandle<()>>,
}

impl TimerTable {
    /// Arm a timer, replacing one with the same name
    pub fn arm(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        if let Some(previous) = self.handles.insert(name.into(), handle) {
            previous.abort();
        }
    }

    /// Forget a timer that finished on its own
    pub fn remove(&mut self, name: &str) -> bool {
        self.handles.remove(name).is_some()
    }

    /// Cancel every timer and reset the table; returns how many were armed
    pub fn clear(&mut self) -> usize {
        let count = self.handles.len();
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Kite subscribed to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub address: Address,
    pub method: String,
}

/// Event name to ordered subscribers
#[derive(Debug, Default)]
pub struct Listeners {
    events: HashMap<String, Vec<Subscriber>>,
}

impl Listeners {
    /// Subscribe; a repeated subscription is ignored
    pub fn add(&mut self, event: impl Into<String>, subscriber: Subscriber) {
        let entry = self.events.entry(event.into()).or_default();
        if !entry.contains(&subscriber) {
            entry.push(subscriber);
        }
    }

    /// Unsubscribe; returns whether the pair was present
    pub fn remove(&mut self, event: &str, subscriber: &Subscriber) -> bool {
        let Some(entry) = self.events.get_mut(event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|s| s != subscriber);
        let removed = entry.len() != before;
        if entry.is_empty() {
            self.events.remove(event);
        }
        removed
    }

    pub fn subscribers(&self, event: &str) -> &[Subscriber] {
        self.events.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Total subscriptions across events
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct Kite {
    pub address: Address,
    pub name: String,
    pub id: Option<KiteId>,
    pub options: Value,
    pub descriptor: Arc<Descriptor>,
    pub value: Option<Rc<dyn Behavior>>,
    pub root: Address,
    pub parent: Option<Address>,
    pub children: Vec<Address>,
    /// Reference name to child address; filled on the root only
    pub refs: HashMap<String, Address>,
    pub inputs: Map<String, Value>,
    pub timers: TimerTable,
    pub listeners: Listeners,
    pub state: KiteState,
    pub server: Option<Rc<dyn Server>>,
    pub remote: Remote,
}

impl Kite {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Name under which a root kite is indexed
    pub fn target(&self) -> Target {
        if self.is_root() {
            Target::named(self.name.clone(), self.id.clone())
        } else {
            Target::Address(self.address)
        }
    }
}

impl std::fmt::Display for Kite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}({})@{}", self.name, id, self.address),
            None => write!(f, "{}@{}", self.name, self.address),
        }
    }
}

impl std::fmt::Debug for Kite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kite")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("id", &self.id)
            .field("root", &self.root)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("state", &self.state)
            .field("timers", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_timer_table_clear() {
        LocalSet::new()
            .run_until(async {
                let mut timers = TimerTable::default();
                let handle = tokio::task::spawn_local(tokio::time::sleep(Duration::from_secs(60)));
                timers.arm("tick", handle);
                timers.arm("tock", tokio::task::spawn_local(async {}));
                assert_eq!(timers.len(), 2);

                assert_eq!(timers.clear(), 2);
                assert!(timers.is_empty());
                assert_eq!(timers.clear(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_rearm_aborts_previous() {
        LocalSet::new()
            .run_until(async {
                let mut timers = TimerTable::default();
                let first = tokio::task::spawn_local(tokio::time::sleep(Duration::from_secs(60)));
                let probe = first.abort_handle();
                timers.arm("tick", first);
                timers.arm("tick", tokio::task::spawn_local(async {}));

                for _ in 0..10 {
                    if probe.is_finished() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                assert!(probe.is_finished());
                assert_eq!(timers.len(), 1);
            })
            .await;
    }

    #[test]
    fn test_listeners() {
        let mut listeners = Listeners::default();
        let spawner = Subscriber {
            address: 5,
            method: "on_zone".into(),
        };
        listeners.add("started", spawner.clone());
        listeners.add("started", spawner.clone());
        listeners.add(
            "started",
            Subscriber {
                address: 6,
                method: "on_zone".into(),
            },
        );

        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners.subscribers("started")[0], spawner);
        assert!(listeners.subscribers("stopped").is_empty());

        assert!(listeners.remove("started", &spawner));
        assert!(!listeners.remove("started", &spawner));
        assert_eq!(listeners.len(), 1);
    }
}
