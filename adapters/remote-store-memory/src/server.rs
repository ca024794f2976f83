//! In-process authoritative OT server
//!
//! Holds one ordered snapshot map per collection and the op log of every
//! document. Every mutation happens under one lock; acknowledgements, remote
//! deliveries and query re-evaluation are dispatched before the lock is
//! released, so each client sees server events in commit order.
//!
//! Lock order is always server, then adapter. Adapters never call into the
//! server while holding their own lock.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use rtsync::ot::{OtTypeId, Side};
use rtsync::prelude::*;
use rtsync::query::{perform_query, QueryParameters, QueryResults};
use rtsync::types::{DocKey, PendingOp, Snapshot};

use crate::doc::MemoryDocAdapter;
use crate::query::MemoryQueryAdapter;

#[derive(Debug, Clone)]
pub(crate) struct LoggedOp {
	pub op: PendingOp,
	pub src: String,
}

#[derive(Debug)]
pub(crate) struct ServerDoc {
	snapshot: Snapshot,
	/// Version of the first logged op; seeded snapshots start mid-history
	log_start: u64,
	log: Vec<LoggedOp>,
}

impl ServerDoc {
	fn new(id: &str) -> Self {
		Self { snapshot: Snapshot::new(id), log_start: 0, log: Vec::new() }
	}

	fn seeded(snapshot: Snapshot) -> Self {
		Self { log_start: snapshot.version, snapshot, log: Vec::new() }
	}

	/// Logged ops from `version` on, `None` when the log does not reach back
	pub(crate) fn ops_since(&self, version: u64) -> Option<Vec<(u64, LoggedOp)>> {
		if version < self.log_start || version > self.snapshot.version {
			return None;
		}
		let skip = usize::try_from(version - self.log_start).ok()?;
		Some(
			self.log
				.iter()
				.enumerate()
				.skip(skip)
				.map(|(i, op)| (self.log_start + i as u64, op.clone()))
				.collect(),
		)
	}

	/// Transform `op`, submitted against `version`, past the ops logged since
	/// and apply it. Returns the version it was applied at and the op as
	/// applied.
	fn commit(&mut self, version: u64, op: PendingOp, src: &str) -> RtResult<(u64, PendingOp)> {
		let current = self.snapshot.version;
		let concurrent = self
			.ops_since(version)
			.ok_or_else(|| Error::Conflict(format!("op at version {} outside history (at {})", version, current)))?;

		let mut op = op;
		for (_, logged) in &concurrent {
			op = transform_incoming(op, &logged.op, self.snapshot.ot_type)?;
		}

		match &op {
			PendingOp::Create { ot_type, data } => {
				if self.snapshot.exists() {
					return Err(Error::AlreadyExists);
				}
				self.snapshot.data = Some(ot_type.create(Some(data.clone()))?);
				self.snapshot.ot_type = Some(*ot_type);
			}
			PendingOp::Op(inner) => {
				let (Some(ot_type), Some(data)) = (self.snapshot.ot_type, self.snapshot.data.as_ref()) else {
					return Err(Error::NotLoaded);
				};
				self.snapshot.data = Some(ot_type.apply(data, inner)?);
			}
			PendingOp::Del => {
				if !self.snapshot.exists() {
					return Err(Error::NotLoaded);
				}
				self.snapshot.data = None;
				self.snapshot.ot_type = None;
			}
		}
		self.log.push(LoggedOp { op: op.clone(), src: src.to_string() });
		self.snapshot.version += 1;
		Ok((current, op))
	}
}

fn transform_incoming(op: PendingOp, logged: &PendingOp, ot_type: Option<OtTypeId>) -> RtResult<PendingOp> {
	match (op, logged) {
		(PendingOp::Op(op), PendingOp::Op(other)) => {
			let ot_type = ot_type.ok_or(Error::NotLoaded)?;
			Ok(PendingOp::Op(ot_type.transform(&op, other, Side::Left)?))
		}
		(PendingOp::Op(_), _) => Err(Error::Conflict("document was created or deleted concurrently".into())),
		(op, _) => Ok(op),
	}
}

#[derive(Debug, Default)]
struct ServerState {
	collections: HashMap<String, BTreeMap<String, ServerDoc>>,
	doc_subscribers: HashMap<DocKey, Vec<Weak<MemoryDocAdapter>>>,
	query_subscribers: HashMap<String, Vec<Weak<MemoryQueryAdapter>>>,
}

impl ServerState {
	fn snapshot(&self, collection: &str, id: &str) -> Snapshot {
		self.collections
			.get(collection)
			.and_then(|docs| docs.get(id))
			.map_or_else(|| Snapshot::new(id), |doc| doc.snapshot.clone())
	}

	fn evaluate(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<Snapshot>> {
		let snapshots: Vec<Snapshot> = self
			.collections
			.get(collection)
			.map(|docs| docs.values().map(|doc| doc.snapshot.clone()).collect())
			.unwrap_or_default();
		perform_query(params, &snapshots)
	}

	fn refresh_queries(&mut self, collection: &str) {
		let Some(subscribers) = self.query_subscribers.get_mut(collection) else {
			return;
		};
		subscribers.retain(|q| q.strong_count() > 0);
		let queries: Vec<Arc<MemoryQueryAdapter>> = subscribers.iter().filter_map(Weak::upgrade).collect();
		for query in queries {
			if query.is_online() {
				let results = self.evaluate(collection, query.params());
				query.deliver_results(results);
			}
		}
	}
}

/// Shared in-process server; several remote stores (clients) may connect
/// to the same instance
#[derive(Debug, Default)]
pub struct MemoryServer {
	state: Mutex<ServerState>,
}

impl MemoryServer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Seed documents. Snapshots with data but no type default to json0.
	pub fn add_snapshots(&self, collection: &str, snapshots: impl IntoIterator<Item = Snapshot>) {
		let mut state = self.state.lock();
		let docs = state.collections.entry(collection.to_string()).or_default();
		for mut snapshot in snapshots {
			if snapshot.data.is_some() && snapshot.ot_type.is_none() {
				snapshot.ot_type = Some(OtTypeId::Json0);
			}
			docs.insert(snapshot.id.clone(), ServerDoc::seeded(snapshot));
		}
		state.refresh_queries(collection);
	}

	pub fn snapshot(&self, collection: &str, id: &str) -> Option<Snapshot> {
		let state = self.state.lock();
		state.collections.get(collection)?.get(id).map(|doc| doc.snapshot.clone())
	}

	pub fn exists(&self, collection: &str, id: &str) -> bool {
		self.snapshot(collection, id).is_some_and(|s| s.exists())
	}

	/// Evaluate a query description against the server data
	pub fn query(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<Snapshot>> {
		self.state.lock().evaluate(collection, params)
	}

	/// Number of ops applied to a document
	pub fn op_count(&self, collection: &str, id: &str) -> usize {
		let state = self.state.lock();
		state.collections.get(collection).and_then(|docs| docs.get(id)).map_or(0, |doc| doc.log.len())
	}

	/// Commit an op from `from`, acknowledge or reject it, then deliver it
	pub(crate) fn submit(&self, from: &Arc<MemoryDocAdapter>, version: u64, op: PendingOp) {
		let mut state = self.state.lock();
		let ServerState { collections, doc_subscribers, .. } = &mut *state;
		let key = from.key().clone();
		let doc = collections
			.entry(key.collection.to_string())
			.or_default()
			.entry(key.id.to_string())
			.or_insert_with(|| ServerDoc::new(&key.id));

		match doc.commit(version, op, from.src()) {
			Ok((applied, op)) => {
				trace!("server: {} op committed at v{}", key, applied);
				from.on_ack(applied, &doc.snapshot);
				let subscribers = doc_subscribers.get_mut(&key);
				if let Some(subscribers) = subscribers {
					subscribers.retain(|d| d.strong_count() > 0);
					for adapter in subscribers.iter().filter_map(Weak::upgrade) {
						if !Arc::ptr_eq(&adapter, from) {
							adapter.on_remote_op(applied, &op, &doc.snapshot);
						}
					}
				}
				state.refresh_queries(&key.collection);
			}
			Err(err) => {
				debug!("server: {} op rejected: {}", key, err);
				let snapshot = doc.snapshot.clone();
				from.on_reject(err, &snapshot);
			}
		}
	}

	/// Bring an adapter up to date: replay the ops it missed or, when it
	/// never loaded or the log does not reach back, hand it the snapshot
	pub(crate) fn catch_up(&self, adapter: &MemoryDocAdapter) {
		let state = self.state.lock();
		let key = adapter.key();
		let doc = state.collections.get(&*key.collection).and_then(|docs| docs.get(&*key.id));
		match doc {
			Some(doc) => {
				let ops = adapter.loaded_version().and_then(|v| doc.ops_since(v));
				adapter.sync(ops, &doc.snapshot);
			}
			None => adapter.sync(None, &state.snapshot(&key.collection, &key.id)),
		}
	}

	pub(crate) fn register_doc(&self, adapter: &Arc<MemoryDocAdapter>) {
		let mut state = self.state.lock();
		let subscribers = state.doc_subscribers.entry(adapter.key().clone()).or_default();
		subscribers.retain(|d| d.strong_count() > 0 && !std::ptr::eq(d.as_ptr(), Arc::as_ptr(adapter)));
		subscribers.push(Arc::downgrade(adapter));
	}

	pub(crate) fn unregister_doc(&self, adapter: &MemoryDocAdapter) {
		let mut state = self.state.lock();
		if let Some(subscribers) = state.doc_subscribers.get_mut(adapter.key()) {
			subscribers.retain(|d| d.strong_count() > 0 && !std::ptr::eq(d.as_ptr(), adapter));
		}
	}

	pub(crate) fn register_query(&self, query: &Arc<MemoryQueryAdapter>) {
		let mut state = self.state.lock();
		let subscribers = state.query_subscribers.entry(query.collection_name().to_string()).or_default();
		subscribers.retain(|q| q.strong_count() > 0 && !std::ptr::eq(q.as_ptr(), Arc::as_ptr(query)));
		subscribers.push(Arc::downgrade(query));
	}

	pub(crate) fn unregister_query(&self, query: &MemoryQueryAdapter) {
		let mut state = self.state.lock();
		if let Some(subscribers) = state.query_subscribers.get_mut(query.collection_name()) {
			subscribers.retain(|q| q.strong_count() > 0 && !std::ptr::eq(q.as_ptr(), query));
		}
	}

	/// Evaluate a query for one adapter and deliver the results to it
	pub(crate) fn evaluate_for(&self, query: &MemoryQueryAdapter) {
		let state = self.state.lock();
		let results = state.evaluate(query.collection_name(), query.params());
		query.deliver_results(results);
	}

	pub(crate) fn evaluate_once(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<Snapshot>> {
		self.state.lock().evaluate(collection, params)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn na(n: i64) -> PendingOp {
		PendingOp::Op(json!([{ "p": ["n"], "na": n }]))
	}

	#[test]
	fn test_commit_transforms_concurrent_ops() {
		let mut doc = ServerDoc::seeded(Snapshot::with_data("a", 0, json!({ "s": "ab" }), OtTypeId::Json0));
		let first = PendingOp::Op(json!([{ "p": ["s", 0], "si": "X" }]));
		assert_eq!(doc.commit(0, first, "c1").expect("first").0, 0);
		// submitted against version 0, lands after the first op
		let second = PendingOp::Op(json!([{ "p": ["s", 2], "si": "Y" }]));
		let (applied, op) = doc.commit(0, second, "c2").expect("second");
		assert_eq!(applied, 1);
		assert_eq!(op, PendingOp::Op(json!([{ "p": ["s", 3], "si": "Y" }])));
		assert_eq!(doc.snapshot.data, Some(json!({ "s": "XabY" })));
		assert_eq!(doc.snapshot.version, 2);
	}

	#[test]
	fn test_commit_errors() {
		let mut doc = ServerDoc::new("a");
		assert!(matches!(doc.commit(0, na(1), "c"), Err(Error::NotLoaded)));
		let create = PendingOp::Create { ot_type: OtTypeId::Json0, data: json!({ "n": 0 }) };
		doc.commit(0, create.clone(), "c").expect("create");
		assert!(matches!(doc.commit(1, create, "c"), Err(Error::AlreadyExists)));
		assert!(matches!(doc.commit(5, na(1), "c"), Err(Error::Conflict(_))));
		// an op written before the create cannot be transformed past it
		assert!(matches!(doc.commit(0, na(1), "c"), Err(Error::Conflict(_))));
	}

	#[test]
	fn test_ops_since() {
		let mut doc = ServerDoc::seeded(Snapshot::with_data("a", 3, json!({ "n": 0 }), OtTypeId::Json0));
		doc.commit(3, na(1), "c").expect("commit");
		doc.commit(4, na(1), "c").expect("commit");
		assert!(doc.ops_since(2).is_none());
		let ops = doc.ops_since(4).expect("in range");
		assert_eq!(ops.len(), 1);
		assert_eq!(ops[0].0, 4);
		assert_eq!(doc.ops_since(5).map(|ops| ops.len()), Some(0));
	}
}

// vim: ts=4
