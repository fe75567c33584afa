//! Routing and shard placement
//!
//! ```text
//!   route params            target                     worker
//!   ───────────────         ────────────────────       ───────────────────────
//!   [16777217]          →   Address(16777217)      →   high bits (worker 1)
//!   ["npc", 10]         →   Instance{npc, 10}      →   10 mod n
//!   ["npc", "bob"]      →   Instance{npc, "bob"}   →   hash("bob") mod n
//!   ["zone"]            →   Global{zone}           →   registry (lookup)
//!                                                      hash("zone") mod n (placement)
//!   ["client", ..rest]  →   router "client"(rest)
//! ```
//!
//! Lookup and placement differ only for globals. A global is *placed* by
//! hashing its name, and afterwards *found* through the registry each worker
//! keeps from `regist` broadcasts.

use std::collections::HashMap;

use kite_types::{hash, worker_of, Address, KiteId, Target};
use serde_json::Value;

use crate::error::{KiteError, Result};
use crate::registry::Registry;

/// Turn route parameters into a target
pub fn route(registry: &Registry, params: &[Value]) -> Result<Target> {
    match params.first() {
        Some(Value::Number(number)) => number
            .as_u64()
            .map(Target::Address)
            .ok_or_else(|| KiteError::routing(format!("invalid address {number}"))),
        Some(Value::String(name)) => {
            if let Some(router) = registry.router(name) {
                return (router.route)(&params[1..]);
            }
            match params.get(1) {
                Some(id) => Ok(Target::named(name.clone(), KiteId::from_value(id)?)),
                None => Ok(Target::global(name.clone())),
            }
        }
        Some(other) => Err(KiteError::routing(format!("invalid route head {other}"))),
        None => Err(KiteError::routing("empty route")),
    }
}

/// Shard for an id
pub fn id_shard(id: &KiteId, worker_count: usize) -> usize {
    let count = worker_count.max(1) as u64;
    match id {
        KiteId::Num(n) => (n % count) as usize,
        KiteId::Str(s) => (u64::from(hash(s)) % count) as usize,
    }
}

fn address_shard(address: Address, worker_count: usize) -> Result<usize> {
    let index = worker_of(address);
    if index < worker_count {
        Ok(index)
    } else {
        Err(KiteError::routing(format!(
            "address {address} belongs to worker {index}, only {worker_count} running"
        )))
    }
}

/// Worker on which a target is created
pub fn placement(target: &Target, worker_count: usize) -> Result<usize> {
    match target {
        Target::Address(address) => address_shard(*address, worker_count),
        Target::Instance { id, .. } => Ok(id_shard(id, worker_count)),
        Target::Global { name } => Ok((u64::from(hash(name)) % worker_count.max(1) as u64) as usize),
    }
}

/// Worker hosting an existing target, as seen from a worker's tables
pub fn shard_index(
    target: &Target,
    worker_count: usize,
    globals: &HashMap<String, Address>,
) -> Result<usize> {
    match target {
        Target::Global { name } => match globals.get(name) {
            Some(address) => address_shard(*address, worker_count),
            None => Err(KiteError::lookup(format!("can't find global target:{name}"))),
        },
        other => placement(other, worker_count),
    }
}

/// Apply a router's action rewrite for the route an action arrived with
pub fn route_action(
    registry: &Registry,
    route: Option<&[Value]>,
    method: String,
    args: Vec<Value>,
) -> (String, Vec<Value>) {
    let Some(route) = route else {
        return (method, args);
    };
    let Some(Value::String(name)) = route.first() else {
        return (method, args);
    };
    match registry.router(name).and_then(|r| r.action.as_ref()) {
        Some(action) => action(&route[1..], &method, args),
        None => (method, args),
    }
}
