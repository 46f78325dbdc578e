//! The terrane engine: plan and apply a declarative configuration of
//! resources against recorded state.

pub mod application;
pub mod apply;
pub mod cancel;
pub mod config;
pub mod control;
pub mod eval;
pub mod expand;
pub mod expr;
pub mod graph;
pub mod logging;
pub mod options;
pub mod plan;
pub mod report;

#[cfg(test)]
mod testing;
