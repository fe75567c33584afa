//! # Kite identifiers
//!
//! Addresses are allocated per worker as `(worker_index << ADDRESS_SHIFT) + sequence`,
//! so the owning worker is encoded in the high-order bits and no two workers can
//! ever hand out the same address.
//!
//! ```rust
//! use kite_types::{worker_of, AddressAllocator, KiteId, Target};
//!
//! let mut alloc = AddressAllocator::new(3).unwrap();
//! let address = alloc.allocate().unwrap();
//! assert_eq!(worker_of(address), 3);
//!
//! let npc = Target::instance("npc", 10u64);
//! assert_eq!(npc.id(), Some(&KiteId::Num(10)));
//! ```

use super::errors::AddressError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Process-unique kite address
pub type Address = u64;

/// Number of low-order bits holding the per-worker sequence
pub const ADDRESS_SHIFT: u32 = 24;

/// Largest sequence number a single worker may allocate
pub const MAX_LOCAL_SEQUENCE: u64 = (1 << ADDRESS_SHIFT) - 1;

/// Extract the owning worker index from an address
pub const fn worker_of(address: Address) -> usize {
    (address >> ADDRESS_SHIFT) as usize
}

/// Monotonic per-worker address source
#[derive(Debug)]
pub struct AddressAllocator {
    worker: usize,
    base: u64,
    sequence: u64,
}

impl AddressAllocator {
    /// Create the allocator for `worker`
    pub fn new(worker: usize) -> Result<Self, AddressError> {
        let base = (worker as u64)
            .checked_shl(ADDRESS_SHIFT)
            .filter(|base| base >> ADDRESS_SHIFT == worker as u64)
            .ok_or(AddressError::WorkerOutOfRange { worker })?;

        Ok(Self {
            worker,
            base,
            sequence: 0,
        })
    }

    /// Allocate the next address; strictly greater than every previous one
    pub fn allocate(&mut self) -> Result<Address, AddressError> {
        if self.sequence >= MAX_LOCAL_SEQUENCE {
            return Err(AddressError::Exhausted {
                worker: self.worker,
                allocated: self.sequence,
            });
        }

        self.sequence += 1;
        Ok(self.base + self.sequence)
    }

    /// Number of addresses handed out so far
    pub fn allocated(&self) -> u64 {
        self.sequence
    }

    /// Owning worker index
    pub fn worker(&self) -> usize {
        self.worker
    }
}

/// Instance id of a named kite
///
/// Numeric ids shard by `id mod worker_count`, string ids by
/// `hash(id) mod worker_count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KiteId {
    Num(u64),
    Str(String),
}

impl KiteId {
    /// Interpret a JSON value as an id; `null` means "no id"
    pub fn from_value(value: &Value) -> Result<Option<Self>, AddressError> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_u64()
                .map(|n| Some(KiteId::Num(n)))
                .ok_or_else(|| AddressError::InvalidId {
                    value: value.to_string(),
                }),
            Value::String(s) => Ok(Some(KiteId::Str(s.clone()))),
            other => Err(AddressError::InvalidId {
                value: other.to_string(),
            }),
        }
    }

    /// JSON form handed to behaviors through the `Id` provider
    pub fn to_value(&self) -> Value {
        match self {
            KiteId::Num(n) => Value::from(*n),
            KiteId::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for KiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KiteId::Num(n) => write!(f, "{}", n),
            KiteId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for KiteId {
    fn from(value: u64) -> Self {
        KiteId::Num(value)
    }
}

impl From<&str> for KiteId {
    fn from(value: &str) -> Self {
        KiteId::Str(value.to_string())
    }
}

impl From<String> for KiteId {
    fn from(value: String) -> Self {
        KiteId::Str(value)
    }
}

/// Identity reference used for every lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Direct address; authoritative when present
    Address(Address),
    /// Sharded instance of a named kind
    Instance { name: String, id: KiteId },
    /// Cluster-wide singleton
    Global { name: String },
}

impl Target {
    pub fn address(address: Address) -> Self {
        Target::Address(address)
    }

    pub fn instance(name: impl Into<String>, id: impl Into<KiteId>) -> Self {
        Target::Instance {
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Target::Global { name: name.into() }
    }

    /// Build from a declared name and optional id
    pub fn named(name: impl Into<String>, id: Option<KiteId>) -> Self {
        match id {
            Some(id) => Target::instance(name, id),
            None => Target::global(name),
        }
    }

    /// Behavior name, absent for pure address targets
    pub fn name(&self) -> Option<&str> {
        match self {
            Target::Address(_) => None,
            Target::Instance { name, .. } | Target::Global { name } => Some(name),
        }
    }

    pub fn id(&self) -> Option<&KiteId> {
        match self {
            Target::Instance { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(address) => write!(f, "@{}", address),
            Target::Instance { name, id } => write!(f, "{}({})", name, id),
            Target::Global { name } => f.write_str(name),
        }
    }
}

impl From<Address> for Target {
    fn from(address: Address) -> Self {
        Target::Address(address)
    }
}
