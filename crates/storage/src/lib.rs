//! Storage layer for Carmarket
//!
//! This crate provides checksummed, versioned JSON snapshots used to persist
//! small pieces of client state (the signed-in session) across restarts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod persistence;

pub use persistence::{PersistedState, PersistenceConfig, PersistenceError};
