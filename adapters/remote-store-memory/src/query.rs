//! Query adapter of the in-memory remote store

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use rtsync::list_diff::diff_ids;
use rtsync::prelude::*;
use rtsync::query::{QueryParameters, QueryResults};
use rtsync::remote_store::{QueryAdapter, QueryEvent};
use rtsync::types::Snapshot;

use crate::Client;

#[derive(Debug)]
struct QueryState {
	/// Id list as reported to the consumer
	ids: Vec<String>,
	count: usize,
	unpaged_count: usize,
	ready: bool,
	subscribed: bool,
	events_rx: Option<mpsc::UnboundedReceiver<QueryEvent>>,
}

#[derive(Debug)]
pub struct MemoryQueryAdapter {
	collection: String,
	params: QueryParameters,
	client: Arc<Client>,
	this: Weak<MemoryQueryAdapter>,
	state: Mutex<QueryState>,
	events_tx: mpsc::UnboundedSender<QueryEvent>,
}

impl MemoryQueryAdapter {
	pub(crate) fn new(client: Arc<Client>, collection: &str, params: &QueryParameters) -> Arc<Self> {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Arc::new_cyclic(|this| Self {
			collection: collection.to_string(),
			params: params.clone(),
			client,
			this: this.clone(),
			state: Mutex::new(QueryState {
				ids: Vec::new(),
				count: 0,
				unpaged_count: 0,
				ready: false,
				subscribed: false,
				events_rx: Some(events_rx),
			}),
			events_tx,
		})
	}

	pub(crate) fn collection_name(&self) -> &str {
		&self.collection
	}

	pub(crate) fn params(&self) -> &QueryParameters {
		&self.params
	}

	pub(crate) fn is_online(&self) -> bool {
		self.client.is_online()
	}

	pub(crate) fn is_subscribed(&self) -> bool {
		self.state.lock().subscribed
	}

	fn emit(&self, event: QueryEvent) {
		if self.events_tx.send(event).is_err() {
			trace!("memory remote: query event dropped, receiver gone");
		}
	}

	/// Called by the server with fresh results; emits the diff against the
	/// ids last reported
	pub(crate) fn deliver_results(&self, results: RtResult<QueryResults<Snapshot>>) {
		let results = match results {
			Ok(results) => results,
			Err(err) => {
				warn!("memory remote: query on {} failed: {}", self.collection, err);
				return;
			}
		};
		let mut state = self.state.lock();
		if !state.subscribed {
			return;
		}
		let count = results.count();
		let unpaged_count = results.unpaged_count;
		let ids: Vec<String> = results.into_docs().into_iter().map(|s| s.id).collect();

		let changes = diff_ids(&state.ids, &ids);
		let counts_changed = state.count != count || state.unpaged_count != unpaged_count;
		let membership_changed = !changes.is_empty();
		state.ids = ids;
		state.count = count;
		state.unpaged_count = unpaged_count;
		for change in changes {
			self.emit(change.into());
		}
		if !state.ready {
			state.ready = true;
			self.emit(QueryEvent::Ready);
		} else if counts_changed && !membership_changed {
			self.emit(QueryEvent::Changed);
		}
	}
}

#[async_trait]
impl QueryAdapter for MemoryQueryAdapter {
	fn collection(&self) -> &str {
		&self.collection
	}

	fn parameters(&self) -> &QueryParameters {
		&self.params
	}

	fn ready(&self) -> bool {
		self.state.lock().ready
	}

	fn subscribed(&self) -> bool {
		let state = self.state.lock();
		state.subscribed && state.ready
	}

	fn doc_ids(&self) -> Vec<String> {
		self.state.lock().ids.clone()
	}

	fn count(&self) -> usize {
		self.state.lock().count
	}

	fn unpaged_count(&self) -> usize {
		self.state.lock().unpaged_count
	}

	fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QueryEvent>> {
		self.state.lock().events_rx.take()
	}

	async fn fetch(&self) -> RtResult<()> {
		if !self.client.is_online() {
			return Err(Error::Offline);
		}
		let results = self.client.server.evaluate_once(&self.collection, &self.params)?;
		let mut state = self.state.lock();
		state.count = results.count();
		state.unpaged_count = results.unpaged_count;
		state.ids = results.into_docs().into_iter().map(|s| s.id).collect();
		state.ready = true;
		Ok(())
	}

	async fn subscribe(&self, initial_ids: Vec<String>) -> RtResult<()> {
		let this = self.this.upgrade().ok_or(Error::Disposed)?;
		{
			let mut state = self.state.lock();
			state.ids = initial_ids;
			state.subscribed = true;
		}
		self.client.server.register_query(&this);
		self.client.track_query(&this);
		if !self.client.is_online() {
			return Err(Error::Offline);
		}
		self.client.server.evaluate_for(self);
		Ok(())
	}

	async fn destroy(&self) {
		self.state.lock().subscribed = false;
		self.client.server.unregister_query(self);
		self.client.forget_query(self);
	}
}

// vim: ts=4
