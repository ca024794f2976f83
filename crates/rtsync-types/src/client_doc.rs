//! Client-side OT document state
//!
//! Tracks what a client knows about one document: the last acknowledged
//! server version, the optimistic data (every local operation applied), one
//! operation in flight to the server, and the ordered queue of operations not
//! sent yet. Remote operations are transformed past the local ones before
//! they are applied, so local edits are never lost or applied twice.

use serde_json::Value;
use std::collections::VecDeque;

use crate::ot::OtTypeId;
use crate::prelude::*;
use crate::types::{OfflineRecord, PendingOp, Snapshot};

/// Outcome of applying a remote operation
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
	/// Applied; carries the operation as transformed onto the local data
	Applied(PendingOp),
	/// The operation only touched state a local delete already removed
	Absorbed,
	/// Duplicate or already known version
	Ignored,
	/// Version gap or unrecoverable state, the document must be refetched
	Resync,
}

#[derive(Debug, Clone)]
pub struct ClientDoc {
	id: String,
	version: u64,
	data: Option<Value>,
	ot_type: Option<OtTypeId>,
	/// Type of the document before a queued local delete
	last_type: Option<OtTypeId>,
	inflight: Option<PendingOp>,
	pending: VecDeque<PendingOp>,
	needs_resync: bool,
}

impl ClientDoc {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			version: 0,
			data: None,
			ot_type: None,
			last_type: None,
			inflight: None,
			pending: VecDeque::new(),
			needs_resync: false,
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn version(&self) -> u64 {
		self.version
	}

	pub fn data(&self) -> Option<&Value> {
		self.data.as_ref()
	}

	pub fn ot_type(&self) -> Option<OtTypeId> {
		self.ot_type
	}

	pub fn exists(&self) -> bool {
		self.ot_type.is_some()
	}

	pub fn needs_resync(&self) -> bool {
		self.needs_resync
	}

	pub fn inflight(&self) -> Option<&PendingOp> {
		self.inflight.as_ref()
	}

	/// True when nothing is in flight or queued
	pub fn is_idle(&self) -> bool {
		self.inflight.is_none() && self.pending.is_empty()
	}

	/// Optimistic snapshot: last acked version, current local data
	pub fn snapshot(&self) -> Snapshot {
		Snapshot { id: self.id.clone(), version: self.version, data: self.data.clone(), ot_type: self.ot_type }
	}

	/// Unacknowledged operations in submission order, in-flight one first
	pub fn pending_ops(&self) -> Vec<PendingOp> {
		self.inflight.iter().chain(self.pending.iter()).cloned().collect()
	}

	pub fn to_record(&self) -> OfflineRecord {
		OfflineRecord::new(self.snapshot(), self.pending_ops())
	}

	/// Apply a local operation optimistically and queue it for sending.
	///
	/// Returns the operation as queued (json0 ops are normalized).
	pub fn submit_local(&mut self, op: PendingOp) -> RtResult<PendingOp> {
		let op = match op {
			PendingOp::Create { ot_type, data } => {
				if self.exists() {
					return Err(Error::AlreadyExists);
				}
				let data = ot_type.create(Some(data))?;
				self.ot_type = Some(ot_type);
				self.last_type = Some(ot_type);
				self.data = Some(data.clone());
				PendingOp::Create { ot_type, data }
			}
			PendingOp::Op(op) => {
				let (Some(ot_type), Some(data)) = (self.ot_type, self.data.as_ref()) else {
					return Err(Error::NotLoaded);
				};
				let op = ot_type.normalize(op)?;
				self.data = Some(ot_type.apply(data, &op)?);
				PendingOp::Op(op)
			}
			PendingOp::Del => {
				if !self.exists() {
					return Err(Error::NotLoaded);
				}
				self.ot_type = None;
				self.data = None;
				PendingOp::Del
			}
		};
		self.pending.push_back(op.clone());
		Ok(op)
	}

	/// Move the next queued operation in flight.
	///
	/// Returns `None` while another operation is awaiting acknowledgement.
	pub fn next_to_send(&mut self) -> Option<PendingOp> {
		if self.inflight.is_some() {
			return None;
		}
		self.inflight = self.pending.pop_front();
		self.inflight.clone()
	}

	/// The server applied the in-flight operation at `version`
	pub fn ack(&mut self, version: u64) -> Option<PendingOp> {
		let acked = self.inflight.take()?;
		self.version = self.version.max(version + 1);
		Some(acked)
	}

	/// The server refused the in-flight operation.
	///
	/// Local data still includes its effect, so the document is marked for
	/// resync.
	pub fn reject(&mut self) -> Option<PendingOp> {
		let rejected = self.inflight.take()?;
		self.needs_resync = true;
		Some(rejected)
	}

	/// Put the in-flight operation back at the head of the queue, e.g. when
	/// the connection dropped before it was acknowledged
	pub fn requeue_inflight(&mut self) {
		if let Some(op) = self.inflight.take() {
			self.pending.push_front(op);
		}
	}

	/// Apply an operation the server applied at `version`.
	pub fn apply_remote(&mut self, version: u64, op: &PendingOp) -> RtResult<RemoteOutcome> {
		if version < self.version {
			return Ok(RemoteOutcome::Ignored);
		}
		if version > self.version || self.needs_resync {
			self.needs_resync = true;
			return Ok(RemoteOutcome::Resync);
		}

		match op {
			PendingOp::Op(remote) => {
				let Some(ot_type) = self.ot_type.or(self.last_type) else {
					self.needs_resync = true;
					return Ok(RemoteOutcome::Resync);
				};
				let mut remote = remote.clone();
				let mut absorbed = false;
				for local in self.inflight.iter_mut().chain(self.pending.iter_mut()) {
					match local {
						PendingOp::Op(local_op) => {
							let (local_t, remote_t) = ot_type.transform_x(local_op, &remote)?;
							*local_op = local_t;
							remote = remote_t;
						}
						PendingOp::Del => {
							absorbed = true;
							break;
						}
						PendingOp::Create { .. } => {
							self.needs_resync = true;
							return Ok(RemoteOutcome::Resync);
						}
					}
				}
				self.version = version + 1;
				if absorbed {
					return Ok(RemoteOutcome::Absorbed);
				}
				let Some(data) = self.data.as_ref() else {
					self.needs_resync = true;
					return Ok(RemoteOutcome::Resync);
				};
				self.data = Some(ot_type.apply(data, &remote)?);
				Ok(RemoteOutcome::Applied(PendingOp::Op(remote)))
			}
			PendingOp::Create { ot_type, data } => {
				let data = ot_type.create(Some(data.clone()))?;
				self.rebase(Snapshot::with_data(self.id.clone(), version + 1, data, *ot_type));
				Ok(RemoteOutcome::Applied(op.clone()))
			}
			PendingOp::Del => {
				self.version = version + 1;
				self.data = None;
				self.ot_type = None;
				self.inflight = None;
				self.pending.clear();
				Ok(RemoteOutcome::Applied(PendingOp::Del))
			}
		}
	}

	/// Install a snapshot obtained from the server or a cache.
	///
	/// Older snapshots are ignored, and so is any snapshot while an operation
	/// is in flight (its acknowledgement brings the version forward). Queued
	/// operations are replayed on top of a taken snapshot. Returns whether
	/// the snapshot was taken.
	pub fn ingest_snapshot(&mut self, snapshot: Snapshot) -> bool {
		if !self.needs_resync && (snapshot.version < self.version || self.inflight.is_some()) {
			return false;
		}
		if snapshot.version == self.version && self.is_idle() && !self.needs_resync && self.exists() {
			return false;
		}
		self.replay_onto(snapshot);
		true
	}

	/// Authoritative resync: base everything on `snapshot` and replay every
	/// unacknowledged operation, the in-flight one included, on top of it
	pub fn rebase(&mut self, snapshot: Snapshot) {
		self.requeue_inflight();
		self.replay_onto(snapshot);
	}

	/// Load a persisted record without re-applying its pending operations,
	/// its data already includes them
	pub fn restore(&mut self, record: OfflineRecord) {
		let OfflineRecord { snapshot, pending_ops } = record;
		self.version = snapshot.version;
		self.data = snapshot.data;
		self.ot_type = snapshot.ot_type;
		self.last_type = snapshot.ot_type.or(self.last_type);
		self.inflight = None;
		self.pending = pending_ops.into();
		self.needs_resync = false;
	}

	fn replay_onto(&mut self, snapshot: Snapshot) {
		let ops: Vec<PendingOp> = self.inflight.iter().chain(self.pending.iter()).cloned().collect();

		self.version = snapshot.version;
		self.ot_type = snapshot.ot_type;
		self.last_type = snapshot.ot_type.or(self.last_type);
		self.data = if snapshot.ot_type.is_some() { snapshot.data } else { None };
		self.needs_resync = false;
		self.inflight = None;
		self.pending.clear();

		let mut kept = VecDeque::with_capacity(ops.len());
		for op in ops {
			match self.replay_one(op) {
				Ok(op) => kept.push_back(op),
				Err(err) => warn!("doc {}: dropping pending op on resync: {}", self.id, err),
			}
		}
		self.pending = kept;
	}

	fn replay_one(&mut self, op: PendingOp) -> RtResult<PendingOp> {
		let queued = self.submit_local(op)?;
		self.pending.pop_back();
		Ok(queued)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn loaded(data: Value, version: u64) -> ClientDoc {
		let mut doc = ClientDoc::new("a");
		doc.ingest_snapshot(Snapshot::with_data("a", version, data, OtTypeId::Json0));
		doc
	}

	fn na(path: &str, n: i64) -> PendingOp {
		PendingOp::Op(json!([{ "p": [path], "na": n }]))
	}

	#[test]
	fn test_submit_and_ack() {
		let mut doc = loaded(json!({ "n": 1 }), 4);
		doc.submit_local(na("n", 2)).expect("submit");
		assert_eq!(doc.data(), Some(&json!({ "n": 3 })));
		assert_eq!(doc.version(), 4);
		assert_eq!(doc.pending_ops().len(), 1);

		assert!(doc.next_to_send().is_some());
		assert!(doc.next_to_send().is_none());
		assert!(doc.ack(4).is_some());
		assert_eq!(doc.version(), 5);
		assert!(doc.is_idle());
		// a second ack for the same op drains nothing
		assert!(doc.ack(4).is_none());
	}

	#[test]
	fn test_remote_op_transformed_past_pending() {
		let mut doc = loaded(json!({ "s": "ab" }), 1);
		doc.submit_local(PendingOp::Op(json!([{ "p": ["s", 0], "si": "X" }]))).expect("submit");
		let outcome = doc.apply_remote(1, &PendingOp::Op(json!([{ "p": ["s", 2], "si": "Y" }]))).expect("remote");
		assert_eq!(outcome, RemoteOutcome::Applied(PendingOp::Op(json!([{ "p": ["s", 3], "si": "Y" }]))));
		assert_eq!(doc.data(), Some(&json!({ "s": "XabY" })));
		assert_eq!(doc.version(), 2);
		assert_eq!(doc.pending_ops(), vec![PendingOp::Op(json!([{ "p": ["s", 0], "si": "X" }]))]);
	}

	#[test]
	fn test_duplicate_and_gap() {
		let mut doc = loaded(json!({ "n": 0 }), 3);
		assert_eq!(doc.apply_remote(3, &na("n", 1)).expect("apply"), RemoteOutcome::Applied(na("n", 1)));
		assert_eq!(doc.apply_remote(3, &na("n", 1)).expect("dup"), RemoteOutcome::Ignored);
		assert_eq!(doc.data(), Some(&json!({ "n": 1 })));
		assert_eq!(doc.apply_remote(9, &na("n", 1)).expect("gap"), RemoteOutcome::Resync);
		assert!(doc.needs_resync());
	}

	#[test]
	fn test_restore_does_not_reapply() {
		let record = OfflineRecord::new(
			Snapshot::with_data("a", 2, json!({ "n": 5 }), OtTypeId::Json0),
			vec![na("n", 4)],
		);
		let mut doc = ClientDoc::new("a");
		doc.restore(record.clone());
		assert_eq!(doc.data(), Some(&json!({ "n": 5 })));
		assert_eq!(doc.to_record(), record);
	}

	#[test]
	fn test_rebase_replays_pending() {
		let mut doc = loaded(json!({ "n": 1 }), 1);
		doc.submit_local(na("n", 10)).expect("submit");
		doc.next_to_send();
		doc.rebase(Snapshot::with_data("a", 3, json!({ "n": 7 }), OtTypeId::Json0));
		assert_eq!(doc.data(), Some(&json!({ "n": 17 })));
		assert_eq!(doc.version(), 3);
		assert!(doc.inflight().is_none());
		assert_eq!(doc.pending_ops(), vec![na("n", 10)]);
	}

	#[test]
	fn test_create_and_delete() {
		let mut doc = ClientDoc::new("a");
		assert!(matches!(doc.submit_local(na("n", 1)), Err(Error::NotLoaded)));
		doc.submit_local(PendingOp::Create { ot_type: OtTypeId::Json0, data: json!({ "n": 0 }) })
			.expect("create");
		assert!(matches!(
			doc.submit_local(PendingOp::Create { ot_type: OtTypeId::Json0, data: json!({}) }),
			Err(Error::AlreadyExists)
		));
		doc.submit_local(PendingOp::Del).expect("delete");
		assert!(!doc.exists());
		assert_eq!(doc.pending_ops().len(), 2);

		let outcome = doc.apply_remote(0, &PendingOp::Del).expect("remote delete");
		assert_eq!(outcome, RemoteOutcome::Applied(PendingOp::Del));
		assert!(doc.is_idle());
	}
}

// vim: ts=4
