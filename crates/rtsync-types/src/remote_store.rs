//! Remote Store adapter traits
//!
//! A remote store hands out one [`DocAdapter`] per document and one
//! [`QueryAdapter`] per live query. Document adapters apply local operations
//! optimistically and synchronously; the returned [`AckReceiver`] resolves
//! when the backend acknowledges the operation. Query adapters report
//! membership as positional insert/remove/move events relative to the id
//! list the consumer started from.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::list_diff::ListChange;
use crate::ot::OtTypeId;
use crate::prelude::*;
use crate::query::QueryParameters;
use crate::types::{ConnectionState, OfflineRecord, PendingOp, Snapshot};

/// Resolves once the backend acknowledged (or refused) an operation
pub type AckReceiver = oneshot::Receiver<RtResult<()>>;

#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
	/// A remote operation was applied; carries it as applied locally
	RemoteChange(Value),
	/// A local operation was applied optimistically
	LocalOp { op: PendingOp, source: Option<Value> },
	/// The document was created remotely or the local create was acknowledged
	Create,
	/// The document was deleted
	Delete,
	/// A snapshot replaced the local state (fetch or resync)
	Load,
	/// No operation is in flight or queued any more
	Idle,
}

#[async_trait]
pub trait DocAdapter: Debug + Send + Sync {
	fn collection(&self) -> &str;

	fn id(&self) -> &str;

	/// Optimistic state: last acknowledged version, data with local ops applied
	fn snapshot(&self) -> Snapshot;

	/// Unacknowledged operations in submission order
	fn pending_ops(&self) -> Vec<PendingOp>;

	/// Snapshot and pending operations read together, as persisted offline
	fn to_record(&self) -> OfflineRecord;

	fn subscribed(&self) -> bool;

	fn events(&self) -> broadcast::Receiver<DocEvent>;

	/// Install a persisted record; its data already includes its pending ops
	fn restore(&self, record: OfflineRecord);

	/// Install a snapshot obtained elsewhere, without a round trip
	fn ingest_snapshot(&self, snapshot: Snapshot);

	/// One-shot authoritative pull
	async fn fetch(&self) -> RtResult<()>;

	/// Open the live channel and start sending queued operations
	async fn subscribe(&self) -> RtResult<()>;

	async fn unsubscribe(&self) -> RtResult<()>;

	fn create(&self, data: Value, ot_type: OtTypeId) -> RtResult<AckReceiver>;

	/// Apply `op` locally and queue it for the backend. `source` travels with
	/// the local event so the submitter can recognize its own operations.
	fn submit_op(&self, op: Value, source: Option<Value>) -> RtResult<AckReceiver>;

	fn delete(&self) -> RtResult<AckReceiver>;

	/// Authoritative existence check; fails with `Error::Offline` when the
	/// backend is unreachable
	async fn exists(&self) -> RtResult<bool>;

	/// Release every resource; queued operations stay in memory only
	async fn destroy(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
	/// First authoritative result delivered
	Ready,
	Insert { index: usize, ids: Vec<String> },
	Remove { index: usize, ids: Vec<String> },
	Move { from: usize, to: usize, count: usize },
	/// Counts changed without a membership change
	Changed,
}

impl From<ListChange> for QueryEvent {
	fn from(change: ListChange) -> Self {
		match change {
			ListChange::Insert { index, ids } => QueryEvent::Insert { index, ids },
			ListChange::Remove { index, ids } => QueryEvent::Remove { index, ids },
			ListChange::Move { from, to, count } => QueryEvent::Move { from, to, count },
		}
	}
}

impl QueryEvent {
	/// The positional change carried by a membership event
	pub fn as_list_change(&self) -> Option<ListChange> {
		match self {
			QueryEvent::Insert { index, ids } => Some(ListChange::Insert { index: *index, ids: ids.clone() }),
			QueryEvent::Remove { index, ids } => Some(ListChange::Remove { index: *index, ids: ids.clone() }),
			QueryEvent::Move { from, to, count } => Some(ListChange::Move { from: *from, to: *to, count: *count }),
			QueryEvent::Ready | QueryEvent::Changed => None,
		}
	}
}

#[async_trait]
pub trait QueryAdapter: Debug + Send + Sync {
	fn collection(&self) -> &str;

	fn parameters(&self) -> &QueryParameters;

	fn ready(&self) -> bool;

	fn subscribed(&self) -> bool;

	/// Authoritative id list as last reported
	fn doc_ids(&self) -> Vec<String>;

	/// Result count (`$count` value for count queries)
	fn count(&self) -> usize;

	fn unpaged_count(&self) -> usize;

	/// Event channel; there is exactly one consumer, so it can be taken once
	fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QueryEvent>>;

	/// One-shot evaluation, no live updates
	async fn fetch(&self) -> RtResult<()>;

	/// Start live tracking. Events are relative to `initial_ids`.
	async fn subscribe(&self, initial_ids: Vec<String>) -> RtResult<()>;

	async fn destroy(&self);
}

pub trait RemoteStore: Debug + Send + Sync {
	/// Fails with `Error::InvalidDocId` when `id` cannot name a document
	fn create_doc_adapter(&self, collection: &str, id: &str) -> RtResult<Arc<dyn DocAdapter>>;

	fn create_query_adapter(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<dyn QueryAdapter>>;

	fn connection_state(&self) -> watch::Receiver<ConnectionState>;

	fn is_online(&self) -> bool {
		*self.connection_state().borrow() == ConnectionState::Connected
	}
}

// vim: ts=4
