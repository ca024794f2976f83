//! Realtime Document
//!
//! A [`RealtimeDoc`] is the single in-memory instance of one document. It
//! owns the remote store adapter of the document, loads the offline record
//! before going to the network, and keeps the offline record in step with the
//! adapter: every local operation is persisted, pending operations included,
//! before the caller gets control back.
//!
//! Documents are obtained from [`RealtimeService::get`](crate::service::RealtimeService::get),
//! never constructed directly.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;

use rtsync_types::ot::{json0, OtTypeId};
use rtsync_types::remote_store::{AckReceiver, DocAdapter, DocEvent};
use rtsync_types::types::{DocKey, OfflineRecord, PendingOp};

use crate::prelude::*;
use crate::service::RealtimeService;

/// Change notifications of a document
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
	/// A local operation was applied, `source` as passed to `submit`
	Local { op: Value, source: Option<Value> },
	/// A remote operation was applied, transformed past local ones
	Remote(Value),
	/// The data was replaced by a snapshot
	Loaded,
	Created,
	/// The document was deleted. The object stays addressable and the
	/// document may be created again under the same id.
	Deleted,
}

#[derive(Debug, Default)]
struct DocState {
	/// Subscribed directly, not only through queries
	direct: bool,
	query_refs: usize,
	disposed: bool,
}

#[derive(Debug)]
struct Listener {
	events: Option<broadcast::Receiver<DocEvent>>,
	task: Option<JoinHandle<()>>,
}

/// (version, pending op count) of the last record written
type PersistKey = (u64, usize);

#[derive(Debug)]
pub struct RealtimeDoc {
	key: DocKey,
	ot_type: OtTypeId,
	adapter: Arc<dyn DocAdapter>,
	service: Weak<RealtimeService>,
	this: Weak<RealtimeDoc>,
	subscription: OnceCell<()>,
	state: Mutex<DocState>,
	/// Serializes offline writes; holds the key of the last one
	persisted: tokio::sync::Mutex<Option<PersistKey>>,
	listener: Mutex<Listener>,
	changes: broadcast::Sender<DocChange>,
}

impl RealtimeDoc {
	pub(crate) fn new(
		service: Weak<RealtimeService>,
		key: DocKey,
		ot_type: OtTypeId,
		adapter: Arc<dyn DocAdapter>,
		capacity: usize,
	) -> Arc<Self> {
		let events = adapter.events();
		let (changes, _) = broadcast::channel(capacity);
		Arc::new_cyclic(|this| Self {
			key,
			ot_type,
			adapter,
			service,
			this: this.clone(),
			subscription: OnceCell::new(),
			state: Mutex::new(DocState::default()),
			persisted: tokio::sync::Mutex::new(None),
			listener: Mutex::new(Listener { events: Some(events), task: None }),
			changes,
		})
	}

	pub fn key(&self) -> &DocKey {
		&self.key
	}

	pub fn collection(&self) -> &str {
		&self.key.collection
	}

	pub fn id(&self) -> &str {
		&self.key.id
	}

	pub fn ot_type(&self) -> OtTypeId {
		self.ot_type
	}

	/// Optimistic data, `None` until loaded or after deletion
	pub fn data(&self) -> Option<Value> {
		self.adapter.snapshot().data
	}

	/// Last version acknowledged by the remote store
	pub fn version(&self) -> u64 {
		self.adapter.snapshot().version
	}

	pub fn is_loaded(&self) -> bool {
		self.adapter.snapshot().exists()
	}

	pub fn pending_ops(&self) -> Vec<PendingOp> {
		self.adapter.pending_ops()
	}

	/// Whether the remote store currently streams changes of this document
	pub fn is_remote_subscribed(&self) -> bool {
		self.adapter.subscribed()
	}

	pub fn is_disposed(&self) -> bool {
		self.state.lock().disposed
	}

	/// Direct subscription plus query references
	pub fn subscriber_count(&self) -> usize {
		let state = self.state.lock();
		usize::from(state.direct) + state.query_refs
	}

	pub fn changes(&self) -> broadcast::Receiver<DocChange> {
		self.changes.subscribe()
	}

	fn is_held(&self) -> bool {
		let state = self.state.lock();
		state.direct || state.query_refs > 0
	}

	fn check_disposed(&self) -> RtResult<()> {
		if self.is_disposed() {
			return Err(Error::Disposed);
		}
		Ok(())
	}

	fn service(&self) -> RtResult<Arc<RealtimeService>> {
		self.service.upgrade().ok_or(Error::Disposed)
	}

	fn emit(&self, change: DocChange) {
		// nobody listening is fine
		let _ = self.changes.send(change);
	}

	/// Start following adapter events; needs a runtime, so it happens on the
	/// first async call rather than at construction
	fn start_listener(&self) {
		let mut listener = self.listener.lock();
		let Some(events) = listener.events.take() else {
			return;
		};
		listener.task = Some(tokio::spawn(listen(self.this.clone(), events)));
	}

	async fn on_event(&self, event: Option<DocEvent>) {
		match event {
			Some(DocEvent::LocalOp { op: PendingOp::Op(op), source }) => {
				self.emit(DocChange::Local { op, source });
				return;
			}
			Some(DocEvent::LocalOp { .. }) => return,
			Some(DocEvent::RemoteChange(op)) => self.emit(DocChange::Remote(op)),
			Some(DocEvent::Create) => self.emit(DocChange::Created),
			Some(DocEvent::Load) => self.emit(DocChange::Loaded),
			Some(DocEvent::Delete) => {
				self.on_delete().await;
				return;
			}
			Some(DocEvent::Idle) | None => {}
		}
		if let Err(err) = self.update_offline_data(false).await {
			warn!("doc {}: offline update failed: {}", self.key, err);
		}
	}

	async fn on_delete(&self) {
		if let Err(err) = self.update_offline_data(false).await {
			warn!("doc {}: removing offline record failed: {}", self.key, err);
		}
		self.emit(DocChange::Deleted);
		if let Ok(service) = self.service() {
			service.on_local_doc_update(&self.key.collection).await;
		}
	}

	/// Write the offline record if it changed since the last write.
	///
	/// Documents nobody holds are only written when `force` is set or when
	/// they were written before. A document that no longer exists and has
	/// nothing pending loses its record.
	pub async fn update_offline_data(&self, force: bool) -> RtResult<()> {
		let service = self.service()?;
		let mut persisted = self.persisted.lock().await;
		if self.is_disposed() {
			return Ok(());
		}
		let record = self.adapter.to_record();
		if !record.snapshot.exists() && record.pending_ops.is_empty() {
			if persisted.take().is_some() {
				service.offline_store().delete(&self.key.collection, &self.key.id).await?;
				drop(persisted);
				service.offline_data_updated(&self.key, None);
			}
			return Ok(());
		}

		let key = (record.snapshot.version, record.pending_ops.len());
		if !force && (*persisted == Some(key) || (persisted.is_none() && !self.is_held())) {
			return Ok(());
		}
		service.offline_store().put(&self.key.collection, &record).await?;
		*persisted = Some(key);
		drop(persisted);
		trace!("doc {}: offline record at v{} with {} pending", self.key, key.0, key.1);
		service.offline_data_updated(&self.key, record.snapshot.data);
		Ok(())
	}

	/// Install the offline record unless the adapter already holds state
	async fn load_from_store(&self) -> RtResult<()> {
		let service = self.service()?;
		let mut persisted = self.persisted.lock().await;
		let current = self.adapter.to_record();
		if current.snapshot.exists() || !current.pending_ops.is_empty() {
			return Ok(());
		}
		let Some(record) = service.offline_store().get(&self.key.collection, &self.key.id).await? else {
			return Ok(());
		};
		debug!("doc {}: loaded offline record v{} ({} pending)", self.key, record.snapshot.version, record.pending_ops.len());
		*persisted = Some((record.snapshot.version, record.pending_ops.len()));
		if record.pending_ops.is_empty() {
			self.adapter.ingest_snapshot(record.snapshot);
		} else {
			self.adapter.restore(record);
		}
		Ok(())
	}

	/// Load the offline record and attach to remote changes.
	///
	/// Concurrent calls share one attempt. Being offline does not fail the
	/// call; the document then serves its local data.
	pub async fn subscribe(&self) -> RtResult<()> {
		self.check_disposed()?;
		self.state.lock().direct = true;
		self.attach().await
	}

	async fn attach(&self) -> RtResult<()> {
		self.subscription.get_or_try_init(|| self.subscribe_to_changes()).await?;
		Ok(())
	}

	async fn subscribe_to_changes(&self) -> RtResult<()> {
		self.start_listener();
		self.load_from_store().await?;
		match self.adapter.subscribe().await {
			Ok(()) => debug!("doc {}: subscribed at v{}", self.key, self.version()),
			Err(err) if err.is_offline() => debug!("doc {}: offline, serving local data", self.key),
			Err(err) => warn!("doc {}: subscribe failed, serving local data: {}", self.key, err),
		}
		self.update_offline_data(false).await
	}

	/// One-shot authoritative pull without subscribing
	pub async fn online_fetch(&self) -> RtResult<()> {
		self.check_disposed()?;
		self.start_listener();
		self.adapter.fetch().await?;
		self.update_offline_data(false).await
	}

	/// Apply `op` locally and queue it for the remote store.
	///
	/// Returns once the offline record holds the operation; acknowledgement
	/// happens in the background. A full local store fails the call while the
	/// in-memory state keeps the operation.
	pub async fn submit(&self, op: Value, source: Option<Value>) -> RtResult<()> {
		self.check_disposed()?;
		self.start_listener();
		let ack = self.adapter.submit_op(op, source)?;
		self.watch_ack(ack);
		self.local_update().await
	}

	pub async fn create(&self, data: Value) -> RtResult<()> {
		self.check_disposed()?;
		self.start_listener();
		self.load_from_store().await?;
		let ack = self.adapter.create(data, self.ot_type)?;
		self.watch_ack(ack);
		debug!("doc {}: created locally", self.key);
		self.local_update().await
	}

	/// Request deletion; the record goes away once the remote store reports it
	pub async fn delete(&self) -> RtResult<()> {
		self.check_disposed()?;
		self.start_listener();
		let ack = self.adapter.delete()?;
		self.watch_ack(ack);
		self.local_update().await
	}

	async fn local_update(&self) -> RtResult<()> {
		self.update_offline_data(true).await?;
		self.service()?.on_local_doc_update(&self.key.collection).await;
		Ok(())
	}

	/// Re-persist once the operation is acknowledged
	fn watch_ack(&self, ack: AckReceiver) {
		let this = self.this.clone();
		let key = self.key.clone();
		tokio::spawn(async move {
			match ack.await {
				Ok(Ok(())) => trace!("doc {}: op acknowledged", key),
				Ok(Err(err)) => warn!("doc {}: op not applied: {}", key, err),
				Err(_) => debug!("doc {}: adapter dropped an unacknowledged op", key),
			}
			if let Some(doc) = this.upgrade()
				&& let Err(err) = doc.update_offline_data(false).await
			{
				warn!("doc {}: offline update after ack failed: {}", key, err);
			}
		});
	}

	/// Read a value inside the data, e.g. an attachment url
	pub fn get_path(&self, path: &[Value]) -> Option<Value> {
		let data = self.data()?;
		json0::get_path(&data, path).cloned()
	}

	/// Set a value inside the data through a json0 operation
	pub async fn set_path(&self, path: &[Value], value: Value) -> RtResult<()> {
		if self.ot_type != OtTypeId::Json0 {
			return Err(Error::InvalidOp(format!("{} is not a json0 document", self.key)));
		}
		let old = self.get_path(path);
		self.submit(json0::set_op(path, old.as_ref(), value), None).await
	}

	/// Wait until every local operation is acknowledged
	pub async fn wait_idle(&self) -> RtResult<()> {
		let mut events = self.adapter.events();
		loop {
			if self.adapter.pending_ops().is_empty() {
				return Ok(());
			}
			match events.recv().await {
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
				Err(broadcast::error::RecvError::Closed) => return Err(Error::Disposed),
			}
		}
	}

	/// A query started holding this document
	pub async fn on_added_to_subscribe_query(&self) -> RtResult<()> {
		self.check_disposed()?;
		self.state.lock().query_refs += 1;
		self.attach().await
	}

	/// A query stopped holding this document. The last holder going away
	/// triggers an existence check; a document confirmed gone upstream is
	/// evicted, any failure keeps it.
	pub async fn on_removed_from_subscribe_query(&self) {
		let unheld = {
			let mut state = self.state.lock();
			state.query_refs = state.query_refs.saturating_sub(1);
			state.query_refs == 0 && !state.direct && !state.disposed
		};
		if unheld {
			self.check_exists().await;
		}
	}

	async fn check_exists(&self) {
		if !self.adapter.pending_ops().is_empty() {
			return;
		}
		match self.adapter.exists().await {
			Ok(true) => {}
			Ok(false) if !self.is_held() => {
				info!("doc {}: gone upstream, evicting", self.key);
				if let Err(err) = self.dispose().await {
					warn!("doc {}: eviction failed: {}", self.key, err);
				}
			}
			Ok(false) => {}
			Err(err) => debug!("doc {}: existence check failed, keeping it: {}", self.key, err),
		}
	}

	/// Tear down and leave the registry.
	///
	/// Waits for an in-flight subscribe first. The offline record is removed
	/// unless operations are still pending.
	pub async fn dispose(&self) -> RtResult<()> {
		// waits for a running subscribe; never subscribes itself
		let _ = self.subscription.get_or_try_init(|| async { Err::<(), Error>(Error::Disposed) }).await;
		let _persisted = self.persisted.lock().await;
		{
			let mut state = self.state.lock();
			if state.disposed {
				return Ok(());
			}
			state.disposed = true;
		}
		self.close().await;
		debug!("doc {}: disposed", self.key);
		match self.service.upgrade() {
			Some(service) => service.on_local_doc_dispose(self).await,
			None => Ok(()),
		}
	}

	/// Release the adapter and the listener, leaving the offline record alone
	pub(crate) async fn close(&self) {
		self.state.lock().disposed = true;
		if let Some(task) = self.listener.lock().task.take() {
			task.abort();
		}
		self.adapter.destroy().await;
	}

	pub(crate) fn to_record(&self) -> OfflineRecord {
		self.adapter.to_record()
	}
}

async fn listen(doc: Weak<RealtimeDoc>, mut events: broadcast::Receiver<DocEvent>) {
	loop {
		let event = match events.recv().await {
			Ok(event) => Some(event),
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				debug!("doc listener lagged by {} events", skipped);
				None
			}
			Err(broadcast::error::RecvError::Closed) => return,
		};
		let Some(doc) = doc.upgrade() else {
			return;
		};
		doc.on_event(event).await;
	}
}

// vim: ts=4
