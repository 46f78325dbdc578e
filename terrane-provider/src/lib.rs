//! The contract between the `terrane` engine and resource providers.
//!
//! A provider owns one family of resource types and performs the actual
//! create, read, update and delete calls against an external system. The
//! engine treats it as an opaque service; see [`framework::ResourceProvider`].

pub mod framework;
pub mod registry;
pub mod schema;
