//! Document adapter of the in-memory remote store

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

use rtsync::client_doc::{ClientDoc, RemoteOutcome};
use rtsync::ot::OtTypeId;
use rtsync::prelude::*;
use rtsync::remote_store::{AckReceiver, DocAdapter, DocEvent};
use rtsync::types::{DocKey, OfflineRecord, PendingOp, Snapshot};

use crate::Client;

#[derive(Debug)]
struct DocState {
	doc: ClientDoc,
	/// Whether the adapter ever synced with the server or a local record
	loaded: bool,
	subscribed: bool,
	destroyed: bool,
	/// Ack senders, one per unacknowledged op, in submission order
	acks: VecDeque<oneshot::Sender<RtResult<()>>>,
}

#[derive(Debug)]
pub struct MemoryDocAdapter {
	key: DocKey,
	client: Arc<Client>,
	this: Weak<MemoryDocAdapter>,
	state: Mutex<DocState>,
	events: broadcast::Sender<DocEvent>,
}

impl MemoryDocAdapter {
	pub(crate) fn new(client: Arc<Client>, collection: &str, id: &str) -> Arc<Self> {
		let (events, _) = broadcast::channel(client.config.broadcast_capacity);
		Arc::new_cyclic(|this| Self {
			key: DocKey::new(collection, id),
			client,
			this: this.clone(),
			state: Mutex::new(DocState {
				doc: ClientDoc::new(id),
				loaded: false,
				subscribed: false,
				destroyed: false,
				acks: VecDeque::new(),
			}),
			events,
		})
	}

	pub(crate) fn key(&self) -> &DocKey {
		&self.key
	}

	pub(crate) fn src(&self) -> &str {
		&self.client.src
	}

	pub(crate) fn loaded_version(&self) -> Option<u64> {
		let state = self.state.lock();
		state.loaded.then(|| state.doc.version())
	}

	/// Subscription requested, whether or not the server was reachable
	pub(crate) fn subscribed_intent(&self) -> bool {
		let state = self.state.lock();
		state.subscribed && !state.destroyed
	}

	pub(crate) fn has_pending(&self) -> bool {
		!self.state.lock().doc.is_idle()
	}

	fn emit(&self, event: DocEvent) {
		// no receivers is fine
		let _ = self.events.send(event);
	}

	/// Called by the server, under its lock, once our in-flight op committed
	pub(crate) fn on_ack(&self, applied: u64, server: &Snapshot) {
		let mut state = self.state.lock();
		let expected = state.doc.version();
		let Some(op) = state.doc.ack(applied) else {
			return;
		};
		if let Some(ack) = state.acks.pop_front() {
			let _ = ack.send(Ok(()));
		}
		if applied != expected {
			// ops we never saw landed before ours
			resync(&mut state, server);
			self.emit(DocEvent::Load);
		}
		match op {
			PendingOp::Create { .. } => self.emit(DocEvent::Create),
			PendingOp::Del => self.emit(DocEvent::Delete),
			PendingOp::Op(_) => {}
		}
		if state.doc.is_idle() {
			self.emit(DocEvent::Idle);
		}
	}

	pub(crate) fn on_reject(&self, err: Error, server: &Snapshot) {
		let mut state = self.state.lock();
		if state.doc.reject().is_none() {
			return;
		}
		warn!("memory remote: {} op rejected: {}", self.key, err);
		if let Some(ack) = state.acks.pop_front() {
			let _ = ack.send(Err(err));
		}
		resync(&mut state, server);
		self.emit(DocEvent::Load);
	}

	/// Called by the server, under its lock, for ops of other clients
	pub(crate) fn on_remote_op(&self, version: u64, op: &PendingOp, server: &Snapshot) {
		if !self.client.is_online() {
			return;
		}
		let mut state = self.state.lock();
		if !state.subscribed || state.destroyed {
			return;
		}
		self.apply_remote(&mut state, version, op, server);
	}

	fn apply_remote(&self, state: &mut DocState, version: u64, op: &PendingOp, server: &Snapshot) {
		match state.doc.apply_remote(version, op) {
			Ok(RemoteOutcome::Applied(PendingOp::Op(op))) => self.emit(DocEvent::RemoteChange(op)),
			Ok(RemoteOutcome::Applied(PendingOp::Create { .. })) => self.emit(DocEvent::Create),
			Ok(RemoteOutcome::Applied(PendingOp::Del)) => {
				fail_acks(state, "document deleted remotely");
				self.emit(DocEvent::Delete);
			}
			Ok(RemoteOutcome::Absorbed | RemoteOutcome::Ignored) => {}
			Ok(RemoteOutcome::Resync) => {
				resync(state, server);
				self.emit(DocEvent::Load);
			}
			Err(err) => {
				warn!("memory remote: {} remote op failed, resyncing: {}", self.key, err);
				resync(state, server);
				self.emit(DocEvent::Load);
			}
		}
	}

	/// Catch up with the server, replaying missed ops when available
	pub(crate) fn sync(&self, ops: Option<Vec<(u64, crate::server::LoggedOp)>>, server: &Snapshot) {
		let mut state = self.state.lock();
		match ops {
			Some(ops) => {
				for (version, logged) in ops {
					self.apply_remote(&mut state, version, &logged.op, server);
				}
			}
			None => {
				let exists_before = state.doc.exists();
				let dropped = rebase_counting(&mut state.doc, server);
				if dropped > 0 {
					fail_acks(&mut state, "pending ops dropped on resync");
				}
				if state.doc.exists() && !exists_before {
					self.emit(DocEvent::Create);
				}
				self.emit(DocEvent::Load);
			}
		}
		state.loaded = true;
	}

	/// Send queued ops one by one while online
	pub(crate) fn flush(&self) {
		let Some(this) = self.this.upgrade() else {
			return;
		};
		loop {
			if !self.client.is_online() {
				return;
			}
			let (version, op) = {
				let mut state = self.state.lock();
				if state.destroyed {
					return;
				}
				match state.doc.next_to_send() {
					Some(op) => (state.doc.version(), op),
					None => return,
				}
			};
			self.client.server.submit(&this, version, op);
		}
	}

	fn submit(&self, op: PendingOp, source: Option<Value>) -> RtResult<AckReceiver> {
		let (tx, rx) = oneshot::channel();
		{
			let mut state = self.state.lock();
			if state.destroyed {
				return Err(Error::Disposed);
			}
			let op = state.doc.submit_local(op)?;
			state.acks.push_back(tx);
			self.emit(DocEvent::LocalOp { op, source });
		}
		self.flush();
		Ok(rx)
	}
}

fn rebase_counting(doc: &mut ClientDoc, server: &Snapshot) -> usize {
	let before = doc.pending_ops().len();
	doc.rebase(server.clone());
	before.saturating_sub(doc.pending_ops().len())
}

fn resync(state: &mut DocState, server: &Snapshot) {
	if rebase_counting(&mut state.doc, server) > 0 {
		fail_acks(state, "pending ops dropped on resync");
	}
	state.loaded = true;
}

fn fail_acks(state: &mut DocState, reason: &str) {
	for ack in state.acks.drain(..) {
		let _ = ack.send(Err(Error::Conflict(reason.to_string())));
	}
}

#[async_trait]
impl DocAdapter for MemoryDocAdapter {
	fn collection(&self) -> &str {
		&self.key.collection
	}

	fn id(&self) -> &str {
		&self.key.id
	}

	fn snapshot(&self) -> Snapshot {
		self.state.lock().doc.snapshot()
	}

	fn pending_ops(&self) -> Vec<PendingOp> {
		self.state.lock().doc.pending_ops()
	}

	fn to_record(&self) -> OfflineRecord {
		self.state.lock().doc.to_record()
	}

	fn subscribed(&self) -> bool {
		let state = self.state.lock();
		state.subscribed && state.loaded && self.client.is_online()
	}

	fn events(&self) -> broadcast::Receiver<DocEvent> {
		self.events.subscribe()
	}

	fn restore(&self, record: OfflineRecord) {
		let mut state = self.state.lock();
		// restored ops have no waiter, but each still consumes one ack
		for _ in 0..record.pending_ops.len() {
			state.acks.push_front(oneshot::channel().0);
		}
		state.doc.restore(record);
		state.loaded = true;
	}

	fn ingest_snapshot(&self, snapshot: Snapshot) {
		let mut state = self.state.lock();
		if state.doc.ingest_snapshot(snapshot) {
			state.loaded = true;
			self.emit(DocEvent::Load);
		}
	}

	async fn fetch(&self) -> RtResult<()> {
		if !self.client.is_online() {
			return Err(Error::Offline);
		}
		self.client.server.catch_up(self);
		Ok(())
	}

	async fn subscribe(&self) -> RtResult<()> {
		let this = self.this.upgrade().ok_or(Error::Disposed)?;
		{
			let mut state = self.state.lock();
			if state.destroyed {
				return Err(Error::Disposed);
			}
			state.subscribed = true;
		}
		self.client.server.register_doc(&this);
		if !self.client.is_online() {
			return Err(Error::Offline);
		}
		self.client.server.catch_up(self);
		self.flush();
		Ok(())
	}

	async fn unsubscribe(&self) -> RtResult<()> {
		self.state.lock().subscribed = false;
		self.client.server.unregister_doc(self);
		Ok(())
	}

	fn create(&self, data: Value, ot_type: OtTypeId) -> RtResult<AckReceiver> {
		self.submit(PendingOp::Create { ot_type, data }, None)
	}

	fn submit_op(&self, op: Value, source: Option<Value>) -> RtResult<AckReceiver> {
		self.submit(PendingOp::Op(op), source)
	}

	fn delete(&self) -> RtResult<AckReceiver> {
		self.submit(PendingOp::Del, None)
	}

	async fn exists(&self) -> RtResult<bool> {
		if !self.client.is_online() {
			return Err(Error::Offline);
		}
		Ok(self.client.server.exists(&self.key.collection, &self.key.id))
	}

	async fn destroy(&self) {
		{
			let mut state = self.state.lock();
			state.destroyed = true;
			state.subscribed = false;
		}
		self.client.server.unregister_doc(self);
		self.client.forget_doc(self);
	}
}

// vim: ts=4
