//! Error types for address allocation and identifier parsing

use thiserror::Error;

/// Errors raised while allocating or decoding kite addresses
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The per-worker sequence would spill into the worker index bits
    #[error("address space exhausted on worker {worker} after {allocated} allocations")]
    Exhausted { worker: usize, allocated: u64 },

    /// Worker index does not fit in the high-order bits
    #[error("worker index {worker} cannot be encoded in an address")]
    WorkerOutOfRange { worker: usize },

    /// A JSON value could not be interpreted as a kite id
    #[error("invalid kite id: {value}")]
    InvalidId { value: String },
}
