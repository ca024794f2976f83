//! Query adapter of the WebSocket remote store
//!
//! A windowed query that is not itself a count runs a second server-side
//! query for the unpaged count. Diffs arriving before a subscribe reply are
//! buffered and applied after it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use rtsync::list_diff::diff_ids;
use rtsync::prelude::*;
use rtsync::query::QueryParameters;
use rtsync::remote_store::{QueryAdapter, QueryEvent};

use crate::connection::{apply_diffs, QueryRole, Shared};
use crate::protocol::{ClientMessage, QueryDiff};

#[derive(Debug)]
struct QueryState {
	/// Id list as reported to the consumer
	ids: Vec<String>,
	count: usize,
	unpaged_count: usize,
	ready: bool,
	subscribed: bool,
	live: bool,
	destroyed: bool,
	buffered: Vec<(QueryRole, Vec<QueryDiff>, Option<u64>)>,
	events_rx: Option<mpsc::UnboundedReceiver<QueryEvent>>,
}

#[derive(Debug)]
pub struct WsQueryAdapter {
	collection: String,
	params: QueryParameters,
	query: Value,
	id: u64,
	/// Server-side unpaged count query of a windowed query
	count_query: Option<(u64, Value)>,
	shared: Arc<Shared>,
	this: Weak<WsQueryAdapter>,
	state: Mutex<QueryState>,
	events_tx: mpsc::UnboundedSender<QueryEvent>,
}

impl WsQueryAdapter {
	pub(crate) fn new(shared: Arc<Shared>, collection: &str, params: &QueryParameters) -> Arc<Self> {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let id = shared.next_query_id();
		let count_query = (params.is_windowed() && !params.is_count())
			.then(|| (shared.next_query_id(), params.unpaged_count_parameters().to_value()));
		Arc::new_cyclic(|this| Self {
			collection: collection.to_string(),
			params: params.clone(),
			query: params.to_value(),
			id,
			count_query,
			shared,
			this: this.clone(),
			state: Mutex::new(QueryState {
				ids: Vec::new(),
				count: 0,
				unpaged_count: 0,
				ready: false,
				subscribed: false,
				live: false,
				destroyed: false,
				buffered: Vec::new(),
				events_rx: Some(events_rx),
			}),
			events_tx,
		})
	}

	fn emit(&self, event: QueryEvent) {
		if self.events_tx.send(event).is_err() {
			trace!("ws: query event dropped, receiver gone");
		}
	}

	/// Count carried by a result reply or diff
	fn result_count(&self, ids: usize, extra: Option<u64>) -> usize {
		match (self.params.is_count(), extra) {
			(true, Some(count)) => usize::try_from(count).unwrap_or(usize::MAX),
			_ => ids,
		}
	}

	/// Unpaged count of a windowed query; `live` keeps it subscribed
	async fn fetch_count(&self, live: bool) -> RtResult<Option<u64>> {
		let Some((count_id, q)) = &self.count_query else {
			return Ok(None);
		};
		let c = self.collection.clone();
		let q = q.clone();
		let reply = if live {
			let id = *count_id;
			self.shared.request(|r| ClientMessage::QuerySubscribe { r, id, c, q }).await?
		} else {
			let id = self.shared.next_query_id();
			self.shared.request(|r| ClientMessage::QueryFetch { r, id, c, q }).await?
		};
		Ok(reply.extra)
	}

	async fn subscribe_remote(&self) -> RtResult<()> {
		{
			let mut state = self.state.lock();
			state.live = false;
			state.buffered.clear();
		}
		let q = self.query.clone();
		let reply = self
			.shared
			.request(|r| ClientMessage::QuerySubscribe { r, id: self.id, c: self.collection.clone(), q })
			.await?;
		let unpaged = self.fetch_count(true).await?;

		let resubscribe = {
			let mut state = self.state.lock();
			if state.destroyed || !state.subscribed {
				return Ok(());
			}
			let ids = reply.ids.unwrap_or_default();
			let count = self.result_count(ids.len(), reply.extra);
			let unpaged_count = unpaged.map_or(count, |n| usize::try_from(n).unwrap_or(usize::MAX));
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
			state.live = true;
			let buffered = std::mem::take(&mut state.buffered);
			let mut resubscribe = false;
			for (role, diff, extra) in buffered {
				resubscribe |= !self.apply_diff(&mut state, role, diff, extra);
			}
			resubscribe
		};
		if resubscribe {
			self.schedule_resubscribe();
		}
		Ok(())
	}

	/// Called on the connection task for every diff of this query
	pub(crate) fn on_diff(&self, role: QueryRole, diff: Vec<QueryDiff>, extra: Option<u64>) {
		let resubscribe = {
			let mut state = self.state.lock();
			if state.destroyed || !state.subscribed {
				return;
			}
			if !state.live {
				state.buffered.push((role, diff, extra));
				return;
			}
			!self.apply_diff(&mut state, role, diff, extra)
		};
		if resubscribe {
			self.schedule_resubscribe();
		}
	}

	/// Returns false when the diff did not fit the id list
	fn apply_diff(&self, state: &mut QueryState, role: QueryRole, diff: Vec<QueryDiff>, extra: Option<u64>) -> bool {
		match role {
			QueryRole::Results => {
				let count_before = state.count;
				let changes = match apply_diffs(&mut state.ids, diff) {
					Ok(changes) => changes,
					Err(err) => {
						warn!("ws: query on {} out of step, resubscribing: {}", self.collection, err);
						state.live = false;
						return false;
					}
				};
				state.count = self.result_count(state.ids.len(), extra);
				if self.count_query.is_none() {
					state.unpaged_count = state.count;
				}
				let membership_changed = !changes.is_empty();
				for change in changes {
					self.emit(change.into());
				}
				if !membership_changed && state.count != count_before {
					self.emit(QueryEvent::Changed);
				}
			}
			QueryRole::UnpagedCount => {
				if let Some(count) = extra {
					let count = usize::try_from(count).unwrap_or(usize::MAX);
					if count != state.unpaged_count {
						state.unpaged_count = count;
						self.emit(QueryEvent::Changed);
					}
				}
			}
		}
		true
	}

	fn schedule_resubscribe(&self) {
		let Some(this) = self.this.upgrade() else {
			return;
		};
		tokio::spawn(async move {
			if let Err(err) = this.subscribe_remote().await {
				debug!("ws: query resubscribe on {} failed: {}", this.collection, err);
			}
		});
	}

	pub(crate) async fn reconnect(&self) {
		let subscribed = {
			let state = self.state.lock();
			state.subscribed && !state.destroyed
		};
		if subscribed && let Err(err) = self.subscribe_remote().await {
			warn!("ws: query resubscribe on {} failed: {}", self.collection, err);
		}
	}

	pub(crate) fn on_disconnect(&self) {
		let mut state = self.state.lock();
		state.live = false;
		state.buffered.clear();
	}

	async fn unsubscribe_remote(&self, id: u64) {
		if let Err(err) = self.shared.request(|r| ClientMessage::QueryUnsubscribe { r, id }).await {
			debug!("ws: query unsubscribe {} failed: {}", id, err);
		}
	}
}

#[async_trait]
impl QueryAdapter for WsQueryAdapter {
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
		state.live && state.ready && self.shared.is_online()
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
		if !self.shared.is_online() {
			return Err(Error::Offline);
		}
		let id = self.shared.next_query_id();
		let q = self.query.clone();
		let reply =
			self.shared.request(|r| ClientMessage::QueryFetch { r, id, c: self.collection.clone(), q }).await?;
		let unpaged = self.fetch_count(false).await?;

		let ids = reply.ids.unwrap_or_default();
		let count = self.result_count(ids.len(), reply.extra);
		let mut state = self.state.lock();
		state.count = count;
		state.unpaged_count = unpaged.map_or(count, |n| usize::try_from(n).unwrap_or(usize::MAX));
		state.ids = ids;
		state.ready = true;
		Ok(())
	}

	async fn subscribe(&self, initial_ids: Vec<String>) -> RtResult<()> {
		let this = self.this.upgrade().ok_or(Error::Disposed)?;
		{
			let mut state = self.state.lock();
			if state.destroyed {
				return Err(Error::Disposed);
			}
			state.ids = initial_ids;
			state.subscribed = true;
		}
		self.shared.register_query(self.id, &this, QueryRole::Results);
		if let Some((count_id, _)) = self.count_query {
			self.shared.register_query(count_id, &this, QueryRole::UnpagedCount);
		}
		if !self.shared.is_online() {
			return Err(Error::Offline);
		}
		self.subscribe_remote().await
	}

	async fn destroy(&self) {
		let was_live = {
			let mut state = self.state.lock();
			state.destroyed = true;
			state.subscribed = false;
			state.buffered.clear();
			std::mem::replace(&mut state.live, false)
		};
		self.shared.forget_query(self.id);
		if let Some((count_id, _)) = self.count_query {
			self.shared.forget_query(count_id);
		}
		if was_live && self.shared.is_online() {
			self.unsubscribe_remote(self.id).await;
			if let Some((count_id, _)) = self.count_query {
				self.unsubscribe_remote(count_id).await;
			}
		}
	}
}

// vim: ts=4
