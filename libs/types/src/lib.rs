//! # Kite Types
//!
//! Identity and addressing vocabulary shared by every Kite crate.
//!
//! ## Contents
//!
//! - [`Address`]: process-unique kite address encoding its owning worker
//! - [`KiteId`]: numeric or string instance id of a named kite
//! - [`Target`]: the three ways of naming a kite (address, name+id, global name)
//! - [`hash`]: the rolling checksum used for shard placement of string ids
//!
//! ## Address layout
//!
//! ```text
//!  63                     24 23                      0
//! ┌─────────────────────────┬─────────────────────────┐
//! │      worker index       │     local sequence      │
//! └─────────────────────────┴─────────────────────────┘
//! ```
//!
//! The owning worker is recoverable from the address alone, so routing by
//! address never needs a table lookup.

pub mod common;

pub use common::errors::AddressError;
pub use common::hash::hash;
pub use common::identifiers::{
    worker_of, Address, AddressAllocator, KiteId, Target, ADDRESS_SHIFT, MAX_LOCAL_SEQUENCE,
};
