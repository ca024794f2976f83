//! Realtime offline-sync engine.
//!
//! Live documents and live queries over two stores: a persistent local store
//! holding the offline copy of every document in use (pending operations
//! included), and a remote store speaking to an OT collaboration backend.
//! Reads are served locally first and reconciled with the backend whenever
//! it is reachable; writes are applied and persisted locally before they are
//! sent.
//!
//! The store implementations live in the adapter crates
//! (`rtsync-offline-store-*`, `rtsync-remote-store-*`); shared types and the
//! adapter traits are in `rtsync-types`.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod doc;
pub mod file;
pub mod prelude;
pub mod query;
pub mod service;
pub mod type_registry;
pub mod work_queue;

pub use config::RealtimeConfig;
pub use doc::{DocChange, RealtimeDoc};
pub use file::{FileRecord, FileService, FileTask, FileTransport};
pub use query::{QueryChange, RealtimeQuery};
pub use service::{CollectionStats, OfflineDataHook, RealtimeService, ServiceStats};
pub use type_registry::{DocType, FileType, TypeRegistry};
pub use work_queue::WorkQueue;

// vim: ts=4
