//! The `terrane` state is the durable record of every resource instance the
//! engine manages.
//!
//! - [`snapshot`]: the in-memory model and its versioned document format
//! - [`diff`]: comparing two snapshots
//! - [`store`]: the authoritative copy, replaced atomically by a single writer
//! - [`file`]: persistence as an append-only log of JSON patches

pub mod diff;
pub mod file;
pub mod snapshot;
pub mod store;
