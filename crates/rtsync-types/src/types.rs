//! Snapshot and offline record types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ot::OtTypeId;

/// Authoritative shape of a document at a point in time.
///
/// A snapshot without `ot_type` describes a document that does not exist
/// (never created, or deleted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
	pub id: String,
	#[serde(rename = "v", default)]
	pub version: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub ot_type: Option<OtTypeId>,
}

impl Snapshot {
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into(), version: 0, data: None, ot_type: None }
	}

	pub fn with_data(id: impl Into<String>, version: u64, data: Value, ot_type: OtTypeId) -> Self {
		Self { id: id.into(), version, data: Some(data), ot_type: Some(ot_type) }
	}

	pub fn exists(&self) -> bool {
		self.ot_type.is_some()
	}
}

impl AsRef<Snapshot> for Snapshot {
	fn as_ref(&self) -> &Snapshot {
		self
	}
}

/// An operation submitted locally but not acknowledged yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingOp {
	Create {
		#[serde(rename = "type")]
		ot_type: OtTypeId,
		data: Value,
	},
	Op(Value),
	Del,
}

/// Persisted per-document state: last known server version, optimistic data
/// and the queue of operations not yet acknowledged by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineRecord {
	#[serde(flatten)]
	pub snapshot: Snapshot,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub pending_ops: Vec<PendingOp>,
}

impl OfflineRecord {
	pub fn new(snapshot: Snapshot, pending_ops: Vec<PendingOp>) -> Self {
		Self { snapshot, pending_ops }
	}

	/// Record holding plain (non-OT) data, e.g. queued file entries
	pub fn plain(id: impl Into<String>, data: Value) -> Self {
		Self {
			snapshot: Snapshot { id: id.into(), version: 0, data: Some(data), ot_type: None },
			pending_ops: Vec::new(),
		}
	}

	pub fn id(&self) -> &str {
		&self.snapshot.id
	}
}

impl AsRef<Snapshot> for OfflineRecord {
	fn as_ref(&self) -> &Snapshot {
		&self.snapshot
	}
}

/// Registry key of a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
	pub collection: Box<str>,
	pub id: Box<str>,
}

impl DocKey {
	pub fn new(collection: &str, id: &str) -> Self {
		Self { collection: collection.into(), id: id.into() }
	}
}

impl fmt::Display for DocKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.collection, self.id)
	}
}

/// Connection state of a remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_offline_record_layout() {
		let record = OfflineRecord::new(
			Snapshot::with_data("a", 3, json!({ "n": 1 }), OtTypeId::Json0),
			vec![PendingOp::Op(json!([{ "p": ["n"], "na": 1 }])), PendingOp::Del],
		);
		let value = serde_json::to_value(&record).expect("serialize");
		assert_eq!(
			value,
			json!({
				"id": "a",
				"v": 3,
				"data": { "n": 1 },
				"type": "json0",
				"pendingOps": [{ "op": [{ "p": ["n"], "na": 1 }] }, "del"]
			})
		);
		let back: OfflineRecord = serde_json::from_value(value).expect("deserialize");
		assert_eq!(back, record);
	}

	#[test]
	fn test_missing_fields_default() {
		let record: OfflineRecord = serde_json::from_value(json!({ "id": "x" })).expect("deserialize");
		assert_eq!(record.snapshot.version, 0);
		assert!(record.snapshot.data.is_none());
		assert!(!record.snapshot.exists());
		assert!(record.pending_ops.is_empty());
	}

	#[test]
	fn test_doc_key_display() {
		assert_eq!(DocKey::new("widgets", "a").to_string(), "widgets:a");
	}
}

// vim: ts=4
