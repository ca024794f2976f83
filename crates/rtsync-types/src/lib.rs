//! Shared types, store traits, and core algorithms for the rtsync engine.
//!
//! This crate holds everything the engine and the store adapters have in
//! common: the error type, snapshots and offline records, the query
//! translator, the OT type table, the client-side OT document state, and the
//! `OfflineStore` / `RemoteStore` adapter traits. Keeping them here lets the
//! adapter crates build without depending on the engine.

pub mod client_doc;
pub mod error;
pub mod filter;
pub mod list_diff;
pub mod offline_store;
pub mod ot;
pub mod prelude;
pub mod query;
pub mod remote_store;
pub mod types;
pub mod utils;

// vim: ts=4
