//! Common identifier, hashing and error types

pub mod errors;
pub mod hash;
pub mod identifiers;
