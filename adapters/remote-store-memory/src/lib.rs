//! In-memory Remote Store
//!
//! An in-process OT server ([`MemoryServer`]) and a remote store client
//! ([`MemoryRemoteStore`]) connected to it. Several clients may share one
//! server, which makes it possible to test concurrent editing and
//! offline/online transitions deterministically:
//!
//! ```ignore
//! let server = MemoryServer::new();
//! let alice = MemoryRemoteStore::connect(&server);
//! let bob = MemoryRemoteStore::connect(&server);
//! bob.set_online(false);
//! ```
//!
//! Operations are applied with the OT types directly and query membership is
//! re-evaluated synchronously on every mutation.

#![forbid(unsafe_code)]

mod doc;
mod query;
mod server;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::info;

pub use doc::MemoryDocAdapter;
pub use query::MemoryQueryAdapter;
pub use server::MemoryServer;

use rtsync::prelude::*;
use rtsync::query::QueryParameters;
use rtsync::remote_store::{DocAdapter, QueryAdapter, RemoteStore};
use rtsync::types::{ConnectionState, Snapshot};
use rtsync::utils;

/// Client configuration options
#[derive(Debug, Clone)]
pub struct MemoryRemoteConfig {
	/// Capacity of each document's event channel
	pub broadcast_capacity: usize,
}

impl Default for MemoryRemoteConfig {
	fn default() -> Self {
		Self { broadcast_capacity: 256 }
	}
}

/// Connection shared by all adapters of one remote store
#[derive(Debug)]
pub(crate) struct Client {
	/// Source tag of this client's ops
	src: String,
	server: Arc<MemoryServer>,
	config: MemoryRemoteConfig,
	state: watch::Sender<ConnectionState>,
	docs: Mutex<Vec<Weak<MemoryDocAdapter>>>,
	queries: Mutex<Vec<Weak<MemoryQueryAdapter>>>,
}

impl Client {
	pub(crate) fn is_online(&self) -> bool {
		*self.state.borrow() == ConnectionState::Connected
	}

	pub(crate) fn forget_doc(&self, adapter: &MemoryDocAdapter) {
		self.docs.lock().retain(|d| d.strong_count() > 0 && !std::ptr::eq(d.as_ptr(), adapter));
	}

	pub(crate) fn track_query(&self, query: &Arc<MemoryQueryAdapter>) {
		let mut queries = self.queries.lock();
		queries.retain(|q| q.strong_count() > 0 && !std::ptr::eq(q.as_ptr(), Arc::as_ptr(query)));
		queries.push(Arc::downgrade(query));
	}

	pub(crate) fn forget_query(&self, query: &MemoryQueryAdapter) {
		self.queries.lock().retain(|q| q.strong_count() > 0 && !std::ptr::eq(q.as_ptr(), query));
	}
}

#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
	client: Arc<Client>,
}

impl MemoryRemoteStore {
	/// New client on a fresh server
	pub fn new() -> Self {
		Self::connect(&MemoryServer::new())
	}

	/// New client on an existing server
	pub fn connect(server: &Arc<MemoryServer>) -> Self {
		Self::with_config(server, MemoryRemoteConfig::default())
	}

	pub fn with_config(server: &Arc<MemoryServer>, config: MemoryRemoteConfig) -> Self {
		let (state, _) = watch::channel(ConnectionState::Connected);
		let client = Client {
			src: utils::random_id(),
			server: Arc::clone(server),
			config,
			state,
			docs: Mutex::new(Vec::new()),
			queries: Mutex::new(Vec::new()),
		};
		Self { client: Arc::new(client) }
	}

	pub fn server(&self) -> &Arc<MemoryServer> {
		&self.client.server
	}

	/// Seed server documents; see [`MemoryServer::add_snapshots`]
	pub fn add_snapshots(&self, collection: &str, snapshots: impl IntoIterator<Item = Snapshot>) {
		self.client.server.add_snapshots(collection, snapshots);
	}

	/// Simulate connectivity changes.
	///
	/// Going online catches up every subscribed document, sends queued ops in
	/// submission order and re-evaluates subscribed queries.
	pub fn set_online(&self, online: bool) {
		let next = if online { ConnectionState::Connected } else { ConnectionState::Disconnected };
		let changed = self.client.state.send_if_modified(|state| {
			let changed = *state != next;
			*state = next;
			changed
		});
		if !changed {
			return;
		}
		info!("memory remote: client {} {}", self.client.src, if online { "online" } else { "offline" });
		if !online {
			return;
		}

		let docs: Vec<Arc<MemoryDocAdapter>> = self.client.docs.lock().iter().filter_map(Weak::upgrade).collect();
		for doc in docs {
			if doc.subscribed_intent() {
				self.client.server.catch_up(&doc);
			}
			if doc.has_pending() {
				doc.flush();
			}
		}
		let queries: Vec<Arc<MemoryQueryAdapter>> =
			self.client.queries.lock().iter().filter_map(Weak::upgrade).collect();
		for query in queries {
			if query.is_subscribed() {
				self.client.server.evaluate_for(&query);
			}
		}
	}

	pub fn is_online(&self) -> bool {
		self.client.is_online()
	}
}

impl Default for MemoryRemoteStore {
	fn default() -> Self {
		Self::new()
	}
}

impl RemoteStore for MemoryRemoteStore {
	fn create_doc_adapter(&self, collection: &str, id: &str) -> RtResult<Arc<dyn DocAdapter>> {
		if !utils::is_valid_doc_id(id) {
			return Err(Error::InvalidDocId { collection: collection.to_string() });
		}
		let adapter = MemoryDocAdapter::new(Arc::clone(&self.client), collection, id);
		let mut docs = self.client.docs.lock();
		docs.retain(|d| d.strong_count() > 0);
		docs.push(Arc::downgrade(&adapter));
		Ok(adapter)
	}

	fn create_query_adapter(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<dyn QueryAdapter>> {
		params.compile()?;
		Ok(MemoryQueryAdapter::new(Arc::clone(&self.client), collection, params))
	}

	fn connection_state(&self) -> watch::Receiver<ConnectionState> {
		self.client.state.subscribe()
	}
}

// vim: ts=4
