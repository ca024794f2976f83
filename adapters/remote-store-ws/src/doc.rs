//! Document adapter of the WebSocket remote store
//!
//! Ops are sent one at a time, each tagged with this client's source id and a
//! sequence number; the server acknowledges by echoing the tags. An op that
//! was in flight when the connection dropped is resent with the same tags on
//! the next connection, after the document is re-subscribed, so the server
//! can drop a duplicate.
//!
//! While a subscribe request is outstanding, incoming ops are buffered and
//! applied after its reply, in arrival order.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use rtsync::client_doc::{ClientDoc, RemoteOutcome};
use rtsync::ot::OtTypeId;
use rtsync::prelude::*;
use rtsync::query::QueryParameters;
use rtsync::remote_store::{AckReceiver, DocAdapter, DocEvent};
use rtsync::types::{DocKey, OfflineRecord, PendingOp, Snapshot};

use crate::connection::Shared;
use crate::protocol::{ClientMessage, OpMessage};

#[derive(Debug)]
struct DocState {
	doc: ClientDoc,
	/// Base version known (snapshot, record or local create)
	loaded: bool,
	/// Subscription requested by the consumer
	subscribed: bool,
	/// Subscription confirmed on the current connection
	live: bool,
	/// Waiting for an authoritative snapshot; no new ops are sent meanwhile
	resyncing: bool,
	destroyed: bool,
	seq: u64,
	inflight_seq: Option<u64>,
	inflight_sent: bool,
	buffered: Vec<OpMessage>,
	acks: VecDeque<oneshot::Sender<RtResult<()>>>,
}

#[derive(Debug)]
pub struct WsDocAdapter {
	key: DocKey,
	shared: Arc<Shared>,
	this: Weak<WsDocAdapter>,
	state: Mutex<DocState>,
	events: broadcast::Sender<DocEvent>,
}

impl WsDocAdapter {
	pub(crate) fn new(shared: Arc<Shared>, collection: &str, id: &str) -> Arc<Self> {
		let (events, _) = broadcast::channel(shared.config.broadcast_capacity);
		let adapter = Arc::new_cyclic(|this| Self {
			key: DocKey::new(collection, id),
			shared,
			this: this.clone(),
			state: Mutex::new(DocState {
				doc: ClientDoc::new(id),
				loaded: false,
				subscribed: false,
				live: false,
				resyncing: false,
				destroyed: false,
				seq: 0,
				inflight_seq: None,
				inflight_sent: false,
				buffered: Vec::new(),
				acks: VecDeque::new(),
			}),
			events,
		});
		adapter.shared.register_doc(adapter.key.clone(), &adapter);
		adapter
	}

	fn emit(&self, event: DocEvent) {
		let _ = self.events.send(event);
	}

	/// Send the next op if nothing is in flight, or resend the in-flight op
	/// after a reconnect
	fn flush(&self) {
		let msg = {
			let mut state = self.state.lock();
			if state.destroyed || state.resyncing || !self.shared.is_online() {
				return;
			}
			if state.subscribed && !state.live {
				return;
			}
			if state.doc.inflight().is_none() {
				if state.doc.next_to_send().is_none() {
					return;
				}
				// an op requeued by a rebase keeps its tag so the server can drop a duplicate
				if state.inflight_seq.is_none() {
					state.seq += 1;
					state.inflight_seq = Some(state.seq);
				}
			} else if state.inflight_sent {
				return;
			}
			let (Some(op), Some(seq)) = (state.doc.inflight().cloned(), state.inflight_seq) else {
				return;
			};
			state.inflight_sent = true;
			OpMessage::new(&self.key.collection, &self.key.id, state.doc.version(), &self.shared.src, seq, &op)
		};
		trace!("ws: {} sending op seq {} at v{}", self.key, msg.seq, msg.v);
		if let Err(err) = self.shared.send(&ClientMessage::Op(msg)) {
			debug!("ws: {} op not sent: {}", self.key, err);
			self.state.lock().inflight_sent = false;
		}
	}

	/// Called on the connection task for every op addressed to this document
	pub(crate) fn on_op(&self, msg: OpMessage) {
		let followup = {
			let mut state = self.state.lock();
			if state.destroyed {
				return;
			}
			if state.subscribed && !state.live {
				state.buffered.push(msg);
				return;
			}
			self.process_op(&mut state, msg)
		};
		self.follow_up(followup);
	}

	fn process_op(&self, state: &mut DocState, msg: OpMessage) -> FollowUp {
		if msg.src == self.shared.src {
			if state.inflight_seq != Some(msg.seq) || state.doc.inflight().is_none() {
				// duplicate acknowledgement or replay of an op already acked
				return FollowUp::None;
			}
			return match msg.error {
				Some(err) => self.on_reject(state, err.into()),
				None => self.on_ack(state, msg.v),
			};
		}
		let Some(op) = msg.pending_op() else {
			return FollowUp::None;
		};
		if !state.subscribed {
			return FollowUp::None;
		}
		match state.doc.apply_remote(msg.v, &op) {
			Ok(RemoteOutcome::Applied(PendingOp::Op(op))) => self.emit(DocEvent::RemoteChange(op)),
			Ok(RemoteOutcome::Applied(PendingOp::Create { .. })) => self.emit(DocEvent::Create),
			Ok(RemoteOutcome::Applied(PendingOp::Del)) => {
				state.inflight_seq = None;
				state.inflight_sent = false;
				fail_acks(state, "document deleted remotely");
				self.emit(DocEvent::Delete);
			}
			Ok(RemoteOutcome::Absorbed | RemoteOutcome::Ignored) => {}
			Ok(RemoteOutcome::Resync) => return self.request_resync(state),
			Err(err) => {
				warn!("ws: {} remote op failed, resyncing: {}", self.key, err);
				return self.request_resync(state);
			}
		}
		FollowUp::None
	}

	fn on_ack(&self, state: &mut DocState, applied: u64) -> FollowUp {
		let expected = state.doc.version();
		let Some(op) = state.doc.ack(applied) else {
			return FollowUp::None;
		};
		state.inflight_seq = None;
		state.inflight_sent = false;
		if let Some(ack) = state.acks.pop_front() {
			let _ = ack.send(Ok(()));
		}
		match op {
			PendingOp::Create { .. } => self.emit(DocEvent::Create),
			PendingOp::Del => self.emit(DocEvent::Delete),
			PendingOp::Op(_) => {}
		}
		if state.resyncing || applied != expected {
			// ops we never saw landed before ours
			return self.request_resync(state);
		}
		if state.doc.is_idle() {
			self.emit(DocEvent::Idle);
		}
		FollowUp::Flush
	}

	fn on_reject(&self, state: &mut DocState, err: Error) -> FollowUp {
		if state.doc.reject().is_none() {
			return FollowUp::None;
		}
		warn!("ws: {} op rejected: {}", self.key, err);
		state.inflight_seq = None;
		state.inflight_sent = false;
		if let Some(ack) = state.acks.pop_front() {
			let _ = ack.send(Err(err));
		}
		self.request_resync(state)
	}

	/// Mark the document for an authoritative refetch; it starts once no op
	/// is in flight
	fn request_resync(&self, state: &mut DocState) -> FollowUp {
		state.resyncing = true;
		if state.doc.inflight().is_some() && state.inflight_sent {
			FollowUp::None
		} else {
			FollowUp::Resync
		}
	}

	fn follow_up(&self, followup: FollowUp) {
		match followup {
			FollowUp::None => {}
			FollowUp::Flush => self.flush(),
			FollowUp::Resync => {
				let Some(this) = self.this.upgrade() else {
					return;
				};
				tokio::spawn(async move {
					if let Err(err) = this.resync().await {
						debug!("ws: {} resync deferred: {}", this.key, err);
					}
				});
			}
		}
	}

	async fn resync(&self) -> RtResult<()> {
		let reply = self
			.shared
			.request(|r| ClientMessage::Fetch { r, c: self.key.collection.to_string(), d: self.key.id.to_string() })
			.await?;
		self.install(reply.data.unwrap_or_else(|| Snapshot::new(self.key.id.to_string())));
		self.flush();
		Ok(())
	}

	/// Rebase onto an authoritative snapshot
	fn install(&self, snapshot: Snapshot) {
		let mut state = self.state.lock();
		if state.doc.inflight().is_some() && state.inflight_sent {
			// wait for the acknowledgement, then refetch
			state.resyncing = true;
			return;
		}
		let exists_before = state.doc.exists();
		let before = state.doc.pending_ops().len();
		state.doc.rebase(snapshot);
		if state.doc.pending_ops().len() < before {
			fail_acks(&mut state, "pending ops dropped on resync");
			state.inflight_seq = None;
		}
		state.inflight_sent = false;
		state.loaded = true;
		state.resyncing = false;
		if state.doc.exists() && !exists_before {
			self.emit(DocEvent::Create);
		}
		self.emit(DocEvent::Load);
	}

	async fn subscribe_remote(&self) -> RtResult<()> {
		let version = {
			let mut state = self.state.lock();
			state.live = false;
			state.buffered.clear();
			(state.loaded && !state.resyncing).then(|| state.doc.version())
		};
		let reply = self
			.shared
			.request(|r| ClientMessage::Subscribe {
				r,
				c: self.key.collection.to_string(),
				d: self.key.id.to_string(),
				v: version,
			})
			.await?;

		match reply.data {
			Some(snapshot) => self.install(snapshot),
			None if version.is_none() => self.install(Snapshot::new(self.key.id.to_string())),
			None => {}
		}
		let followups: Vec<FollowUp> = {
			let mut state = self.state.lock();
			state.live = true;
			let buffered = std::mem::take(&mut state.buffered);
			buffered.into_iter().map(|msg| self.process_op(&mut state, msg)).collect()
		};
		for followup in followups {
			self.follow_up(followup);
		}
		let resync = {
			let state = self.state.lock();
			state.resyncing && !(state.doc.inflight().is_some() && state.inflight_sent)
		};
		if resync {
			self.follow_up(FollowUp::Resync);
		}
		self.flush();
		Ok(())
	}

	/// Restore the subscription and resend unacknowledged ops on a new
	/// connection
	pub(crate) async fn reconnect(&self) {
		let (subscribed, resyncing) = {
			let state = self.state.lock();
			if state.destroyed {
				return;
			}
			(state.subscribed, state.resyncing)
		};
		if subscribed {
			if let Err(err) = self.subscribe_remote().await {
				warn!("ws: {} resubscribe failed: {}", self.key, err);
			}
		} else if resyncing {
			if let Err(err) = self.resync().await {
				warn!("ws: {} resync failed: {}", self.key, err);
			}
		} else {
			self.flush();
		}
	}

	pub(crate) fn on_disconnect(&self) {
		let mut state = self.state.lock();
		state.live = false;
		state.inflight_sent = false;
		state.buffered.clear();
	}

	fn submit(&self, op: PendingOp, source: Option<Value>) -> RtResult<AckReceiver> {
		let (tx, rx) = oneshot::channel();
		{
			let mut state = self.state.lock();
			if state.destroyed {
				return Err(Error::Disposed);
			}
			let is_create = matches!(op, PendingOp::Create { .. });
			let op = state.doc.submit_local(op)?;
			if is_create {
				state.loaded = true;
			}
			state.acks.push_back(tx);
			self.emit(DocEvent::LocalOp { op, source });
		}
		self.flush();
		Ok(rx)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
	None,
	Flush,
	Resync,
}

fn fail_acks(state: &mut DocState, reason: &str) {
	for ack in state.acks.drain(..) {
		let _ = ack.send(Err(Error::Conflict(reason.to_string())));
	}
}

#[async_trait]
impl DocAdapter for WsDocAdapter {
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
		self.state.lock().live && self.shared.is_online()
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
		if !self.shared.is_online() {
			return Err(Error::Offline);
		}
		let reply = self
			.shared
			.request(|r| ClientMessage::Fetch { r, c: self.key.collection.to_string(), d: self.key.id.to_string() })
			.await?;
		let snapshot = reply.data.unwrap_or_else(|| Snapshot::new(self.key.id.to_string()));
		let mut state = self.state.lock();
		if state.doc.ingest_snapshot(snapshot) {
			state.loaded = true;
			self.emit(DocEvent::Load);
		}
		Ok(())
	}

	async fn subscribe(&self) -> RtResult<()> {
		{
			let mut state = self.state.lock();
			if state.destroyed {
				return Err(Error::Disposed);
			}
			if state.subscribed && state.live {
				return Ok(());
			}
			state.subscribed = true;
		}
		if !self.shared.is_online() {
			return Err(Error::Offline);
		}
		self.subscribe_remote().await
	}

	async fn unsubscribe(&self) -> RtResult<()> {
		let was_live = {
			let mut state = self.state.lock();
			state.subscribed = false;
			std::mem::replace(&mut state.live, false)
		};
		if was_live && self.shared.is_online() {
			self.shared
				.request(|r| ClientMessage::Unsubscribe {
					r,
					c: self.key.collection.to_string(),
					d: self.key.id.to_string(),
				})
				.await?;
		}
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
		if !self.shared.is_online() {
			return Err(Error::Offline);
		}
		let q = QueryParameters::exists_parameters(&self.key.id).to_value();
		let id = self.shared.next_query_id();
		let reply = self
			.shared
			.request(|r| ClientMessage::QueryFetch { r, id, c: self.key.collection.to_string(), q })
			.await?;
		Ok(reply.extra == Some(1))
	}

	async fn destroy(&self) {
		let was_live = {
			let mut state = self.state.lock();
			state.destroyed = true;
			state.subscribed = false;
			state.buffered.clear();
			std::mem::replace(&mut state.live, false)
		};
		self.shared.forget_doc(&self.key, self);
		if was_live && self.shared.is_online() {
			let result = self
				.shared
				.request(|r| ClientMessage::Unsubscribe {
					r,
					c: self.key.collection.to_string(),
					d: self.key.id.to_string(),
				})
				.await;
			if let Err(err) = result {
				debug!("ws: {} unsubscribe on destroy failed: {}", self.key, err);
			}
		}
	}
}

// vim: ts=4
