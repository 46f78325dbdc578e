//! Utilities for managing program execution flow.
//!
//! It includes abstractions handling delayed computations, and composing
//! complex behaviors from simpler components.

pub mod thunk;
