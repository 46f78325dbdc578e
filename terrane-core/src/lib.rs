//! Types shared by every part of `terrane`: the engine, the state store and
//! the resource providers.
//!
//! Nothing in here performs I/O.

pub mod addr;
pub mod diagnostics;
pub mod value;
