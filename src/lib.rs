//! Configuration-driven container orchestration.
//!
//! Units are described by two-document YAML files: a set of named container
//! configurations and an order list that runs against them.  A unit only
//! has to describe how it starts; stop, cleanup, purge, backup and the
//! other teardown commands are derived from the start order list by the
//! transformer in [`orders`].

pub mod backends;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod orders;
pub mod services;
pub mod spawn;
pub mod substitution;

pub use errors::{Error, Result};
