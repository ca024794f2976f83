//! Realtime Query
//!
//! A live, ordered view over the documents of one collection matching a
//! query filter description. Subscribing evaluates the filter against the
//! local store first, so results are available offline, then hands the same
//! ids to the remote query adapter.
//!
//! Adapter events are applied by one reconciliation task, in delivery order,
//! to a mirror of the adapter's id list; `docs` is then spliced to match the
//! mirror position by position. Local writes re-run the local evaluation on
//! the same lock, so both paths edit `docs` one at a time.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use rtsync_types::list_diff::{apply_change, diff_ids, ListChange};
use rtsync_types::query::{QueryParameters, QueryResultSet};
use rtsync_types::remote_store::{QueryAdapter, QueryEvent};

use crate::config::RealtimeConfig;
use crate::doc::{DocChange, RealtimeDoc};
use crate::prelude::*;
use crate::service::RealtimeService;

/// Change notifications of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryChange {
	/// Membership recomputed from the local store
	Local,
	/// Membership or counts changed remotely
	Remote,
	/// The remote store delivered the first authoritative results
	Ready,
	/// A document in the results changed remotely
	RemoteDocChange(String),
}

#[derive(Debug, Default)]
struct QueryState {
	docs: Vec<Arc<RealtimeDoc>>,
	count: usize,
	unpaged_count: usize,
	ready: bool,
	subscribed: bool,
	disposed: bool,
	reconcile: Option<JoinHandle<()>>,
	/// Forwarders of remote document changes, by document id
	doc_watchers: HashMap<String, JoinHandle<()>>,
}

#[derive(Debug)]
pub struct RealtimeQuery {
	name: String,
	adapter: Arc<dyn QueryAdapter>,
	service: Weak<RealtimeService>,
	this: Weak<RealtimeQuery>,
	config: RealtimeConfig,
	state: Mutex<QueryState>,
	/// Held while `docs` is being edited
	apply_lock: tokio::sync::Mutex<()>,
	changes: broadcast::Sender<QueryChange>,
}

impl RealtimeQuery {
	pub(crate) fn new(service: Weak<RealtimeService>, adapter: Arc<dyn QueryAdapter>, config: RealtimeConfig) -> Arc<Self> {
		let (changes, _) = broadcast::channel(config.broadcast_capacity);
		let name = format!("{}{}", adapter.collection(), adapter.parameters().to_value());
		Arc::new_cyclic(|this| Self {
			name,
			adapter,
			service,
			this: this.clone(),
			config,
			state: Mutex::new(QueryState::default()),
			apply_lock: tokio::sync::Mutex::new(()),
			changes,
		})
	}

	/// Collection and filter, for logs
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn collection(&self) -> &str {
		self.adapter.collection()
	}

	pub fn parameters(&self) -> &QueryParameters {
		self.adapter.parameters()
	}

	pub fn docs(&self) -> Vec<Arc<RealtimeDoc>> {
		self.state.lock().docs.clone()
	}

	pub fn doc_ids(&self) -> Vec<String> {
		self.state.lock().docs.iter().map(|d| d.id().to_string()).collect()
	}

	/// Local estimate until ready, then the remote value
	pub fn count(&self) -> usize {
		self.state.lock().count
	}

	pub fn unpaged_count(&self) -> usize {
		self.state.lock().unpaged_count
	}

	pub fn ready(&self) -> bool {
		self.state.lock().ready
	}

	pub fn subscribed(&self) -> bool {
		self.adapter.subscribed()
	}

	pub fn is_disposed(&self) -> bool {
		self.state.lock().disposed
	}

	pub fn changes(&self) -> broadcast::Receiver<QueryChange> {
		self.changes.subscribe()
	}

	fn emit(&self, change: QueryChange) {
		let _ = self.changes.send(change);
	}

	fn service(&self) -> RtResult<Arc<RealtimeService>> {
		self.service.upgrade().ok_or(Error::Disposed)
	}

	/// Evaluate once against the remote store, without live updates
	pub async fn fetch(&self) -> RtResult<()> {
		if self.is_disposed() {
			return Err(Error::Disposed);
		}
		let service = self.service()?;
		self.adapter.fetch().await?;
		let docs = self
			.adapter
			.doc_ids()
			.iter()
			.map(|id| service.get(self.collection(), id))
			.collect::<RtResult<Vec<_>>>()?;
		let fetched = join_all(docs.iter().filter(|doc| !doc.is_loaded()).map(|doc| doc.online_fetch())).await;
		for err in fetched.into_iter().filter_map(Result::err) {
			warn!("query {}: fetching a result document failed: {}", self.name, err);
		}
		let mut state = self.state.lock();
		state.docs = docs;
		state.count = self.adapter.count();
		state.unpaged_count = self.adapter.unpaged_count();
		state.ready = true;
		Ok(())
	}

	/// Local results first, then live remote membership.
	///
	/// Being offline does not fail the call; the local results stay in place
	/// and the remote store catches up once connected.
	pub async fn subscribe(&self) -> RtResult<()> {
		let this = self.this.upgrade().ok_or(Error::Disposed)?;
		let service = self.service()?;
		{
			let mut state = self.state.lock();
			if state.disposed {
				return Err(Error::Disposed);
			}
			if state.subscribed {
				return Ok(());
			}
			state.subscribed = true;
		}
		let events = self.adapter.take_events().ok_or(Error::Disposed)?;
		let ids = {
			let _guard = self.apply_lock.lock().await;
			self.local_query().await?
		};
		service.on_query_subscribe(&this);
		self.emit(QueryChange::Local);

		let initial = ids.unwrap_or_default();
		let task = tokio::spawn(reconcile(self.this.clone(), events, initial.clone()));
		self.state.lock().reconcile = Some(task);
		match self.adapter.subscribe(initial).await {
			Ok(()) => {}
			Err(err) if err.is_offline() => debug!("query {}: offline, serving local results", self.name),
			Err(err) => warn!("query {}: subscribe failed, serving local results: {}", self.name, err),
		}
		Ok(())
	}

	/// Recompute membership from the local store
	pub async fn local_update(&self) -> RtResult<()> {
		let _guard = self.apply_lock.lock().await;
		{
			let state = self.state.lock();
			if !state.subscribed || state.disposed {
				return Ok(());
			}
		}
		self.local_query().await?;
		self.emit(QueryChange::Local);
		Ok(())
	}

	/// Evaluate against the local store and splice `docs` to the result.
	/// Returns the ids, or `None` for count queries. Caller holds `apply_lock`.
	async fn local_query(&self) -> RtResult<Option<Vec<String>>> {
		let service = self.service()?;
		let params = self.parameters();
		if self.ready() && (params.is_windowed() || params.is_count()) {
			return self.local_page_update(&service).await;
		}
		let results = service.offline_store().query(self.collection(), params).await?;
		let count = results.count();
		let unpaged_count = results.unpaged_count;
		let ids = match results.results {
			QueryResultSet::Docs(records) => Some(records.into_iter().map(|r| r.snapshot.id).collect::<Vec<_>>()),
			QueryResultSet::Count(_) => None,
		};
		if let Some(ids) = &ids {
			self.sync_docs(&service, ids).await;
		}
		let mut state = self.state.lock();
		if !state.ready {
			state.count = count;
			state.unpaged_count = unpaged_count;
		}
		Ok(ids)
	}

	/// Local pass over a ready windowed query.
	///
	/// The local store holds little more than the current page, so the
	/// window is never re-applied there. Page members that stopped matching
	/// drop out and the rest follow the local sort; documents entering the
	/// page come from the remote store.
	async fn local_page_update(&self, service: &RealtimeService) -> RtResult<Option<Vec<String>>> {
		if self.parameters().is_count() {
			return Ok(None);
		}
		let page = self.adapter.doc_ids();
		let matching = service.offline_store().query(self.collection(), &self.parameters().unwindowed()).await?;
		let mut ids: Vec<String> =
			matching.into_docs().into_iter().map(|r| r.snapshot.id).filter(|id| page.contains(id)).collect();
		for (index, id) in page.iter().enumerate() {
			if ids.contains(id) {
				continue;
			}
			// no local record to judge it by
			if service.offline_store().get(self.collection(), id).await?.is_none() {
				ids.insert(index.min(ids.len()), id.clone());
			}
		}
		self.sync_docs(service, &ids).await;
		Ok(Some(ids))
	}

	/// Splice `docs` until its ids equal `target`
	async fn sync_docs(&self, service: &RealtimeService, target: &[String]) {
		let current = self.doc_ids();
		for change in diff_ids(&current, target) {
			self.apply_doc_change(service, change).await;
		}
	}

	async fn apply_doc_change(&self, service: &RealtimeService, change: ListChange) {
		match change {
			ListChange::Insert { index, ids } => {
				let mut inserted = Vec::with_capacity(ids.len());
				for id in &ids {
					let doc = match service.get(self.collection(), id) {
						Ok(doc) => doc,
						Err(err) => {
							warn!("query {}: skipping {}: {}", self.name, id, err);
							continue;
						}
					};
					if let Err(err) = doc.on_added_to_subscribe_query().await {
						warn!("query {}: loading {} failed: {}", self.name, id, err);
					}
					inserted.push(doc);
				}
				let watchers: Vec<(String, JoinHandle<()>)> =
					inserted.iter().map(|doc| (doc.id().to_string(), self.watch_doc(doc))).collect();
				let mut state = self.state.lock();
				let index = index.min(state.docs.len());
				state.docs.splice(index..index, inserted);
				for (id, watcher) in watchers {
					if let Some(old) = state.doc_watchers.insert(id, watcher) {
						old.abort();
					}
				}
			}
			ListChange::Remove { index, ids } => {
				let removed: Vec<Arc<RealtimeDoc>> = {
					let mut state = self.state.lock();
					let start = index.min(state.docs.len());
					let end = index.saturating_add(ids.len()).min(state.docs.len());
					let removed: Vec<_> = state.docs.drain(start..end).collect();
					for doc in &removed {
						if let Some(watcher) = state.doc_watchers.remove(doc.id()) {
							watcher.abort();
						}
					}
					removed
				};
				for doc in removed {
					tokio::spawn(async move { doc.on_removed_from_subscribe_query().await });
				}
			}
			ListChange::Move { from, to, count } => {
				let mut state = self.state.lock();
				let end = from.saturating_add(count);
				if end > state.docs.len() || to.saturating_add(count) > state.docs.len() {
					warn!("query {}: move {}..{} to {} out of range", self.name, from, end, to);
					return;
				}
				let moved: Vec<_> = state.docs.drain(from..end).collect();
				state.docs.splice(to..to, moved);
			}
		}
	}

	fn watch_doc(&self, doc: &RealtimeDoc) -> JoinHandle<()> {
		let mut changes = doc.changes();
		let query = self.this.clone();
		let id = doc.id().to_string();
		tokio::spawn(async move {
			loop {
				match changes.recv().await {
					Ok(DocChange::Remote(_)) => {
						let Some(query) = query.upgrade() else {
							return;
						};
						query.emit(QueryChange::RemoteDocChange(id.clone()));
					}
					Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
		})
	}

	/// Apply one adapter event to the mirror and bring `docs` in line
	async fn on_event(&self, event: QueryEvent, mirror: &mut Vec<String>) {
		let Ok(service) = self.service() else {
			return;
		};
		let _guard = self.apply_lock.lock().await;
		if self.is_disposed() {
			return;
		}
		match event {
			QueryEvent::Ready => {
				self.sync_docs(&service, mirror).await;
				self.refresh_counts(true);
				debug!("query {}: ready with {} results", self.name, mirror.len());
				self.emit(QueryChange::Ready);
			}
			QueryEvent::Changed => {
				self.refresh_counts(false);
				self.emit(QueryChange::Remote);
			}
			event => {
				let Some(change) = event.as_list_change() else {
					return;
				};
				if let Err(err) = apply_change(mirror, &change) {
					warn!("query {}: event out of step, taking adapter ids: {}", self.name, err);
					*mirror = self.adapter.doc_ids();
				}
				self.sync_docs(&service, mirror).await;
				self.refresh_counts(false);
				self.emit(QueryChange::Remote);
			}
		}
	}

	fn refresh_counts(&self, set_ready: bool) {
		let mut state = self.state.lock();
		if set_ready {
			state.ready = true;
		}
		if state.ready {
			state.count = self.adapter.count();
			state.unpaged_count = self.adapter.unpaged_count();
		}
	}

	/// Stop live tracking and release the adapter.
	///
	/// A subscribed query releases its documents, which may evict those
	/// confirmed gone upstream.
	pub async fn dispose(&self) {
		let _guard = self.apply_lock.lock().await;
		let (docs, was_subscribed) = {
			let mut state = self.state.lock();
			if state.disposed {
				return;
			}
			state.disposed = true;
			if let Some(task) = state.reconcile.take() {
				task.abort();
			}
			for (_, watcher) in state.doc_watchers.drain() {
				watcher.abort();
			}
			(std::mem::take(&mut state.docs), state.subscribed)
		};
		if was_subscribed {
			join_all(docs.iter().map(|doc| doc.on_removed_from_subscribe_query())).await;
			if let Ok(service) = self.service() {
				service.on_query_unsubscribe(self);
			}
		}
		self.adapter.destroy().await;
		debug!("query {}: disposed", self.name);
	}

	/// Dispose once ready, or after `timeout` when the remote store never
	/// answers (e.g. offline)
	pub async fn dispose_when_settled(&self, timeout: Duration) {
		let mut changes = self.changes();
		let settled = tokio::time::timeout(timeout, async {
			while !self.ready() {
				if let Err(broadcast::error::RecvError::Closed) = changes.recv().await {
					return;
				}
			}
		})
		.await;
		if settled.is_err() {
			debug!("query {}: not ready after {:?}, disposing anyway", self.name, timeout);
		}
		self.dispose().await;
	}

	/// Release the adapter without touching documents, on service shutdown
	pub(crate) async fn close(&self) {
		{
			let mut state = self.state.lock();
			state.disposed = true;
			if let Some(task) = state.reconcile.take() {
				task.abort();
			}
			for (_, watcher) in state.doc_watchers.drain() {
				watcher.abort();
			}
		}
		self.adapter.destroy().await;
	}
}

/// Single consumer of the adapter's event channel
async fn reconcile(query: Weak<RealtimeQuery>, mut events: mpsc::UnboundedReceiver<QueryEvent>, mut mirror: Vec<String>) {
	while let Some(event) = events.recv().await {
		let Some(query) = query.upgrade() else {
			return;
		};
		let backlog = events.len();
		if backlog >= query.config.query_event_warn_threshold {
			warn!("query {}: {} events waiting", query.name, backlog);
		}
		query.on_event(event, &mut mirror).await;
	}
}

// vim: ts=4
