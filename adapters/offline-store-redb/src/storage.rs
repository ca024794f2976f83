//! Table layout and key helpers
//!
//! - `records`: `{collection}/{id}` -> offline record JSON
//! - `indexes`: `{collection}/{path}/{value}/{id}` -> ""
//! - `meta`: `collections/{collection}` -> JSON list of indexed paths
//!
//! Collection names and document ids never contain `/`, so a prefix scan
//! over `{collection}/` yields exactly the records of one collection, in id
//! order.

use rtsync::filter::FieldPath;
use rtsync::types::OfflineRecord;
use serde_json::Value;

/// Record storage table
pub const TABLE_RECORDS: redb::TableDefinition<&str, &str> = redb::TableDefinition::new("records");

/// Index storage table
pub const TABLE_INDEXES: redb::TableDefinition<&str, &str> = redb::TableDefinition::new("indexes");

/// Metadata storage table
pub const TABLE_METADATA: redb::TableDefinition<&str, &str> = redb::TableDefinition::new("meta");

pub fn is_valid_collection_name(name: &str) -> bool {
	!name.is_empty() && !name.contains('/')
}

pub fn record_prefix(collection: &str) -> String {
	format!("{}/", collection)
}

pub fn record_key(collection: &str, id: &str) -> String {
	format!("{}/{}", collection, id)
}

pub fn meta_key(collection: &str) -> String {
	format!("collections/{}", collection)
}

pub fn index_prefix(collection: &str, path: &str, value: &str) -> String {
	format!("{}/{}/{}/", collection, path, value)
}

/// Convert a scalar JSON value to its index string.
///
/// Only strings and booleans are indexed: numbers compare by value (`1` equals
/// `1.0`) and null matches missing fields, neither of which a string key can
/// express.
pub fn index_string(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => Some(format!("s:{}", s)),
		Value::Bool(b) => Some(format!("b:{}", b)),
		_ => None,
	}
}

/// Index strings for a field value, expanding arrays into per-element entries
pub fn index_strings(values: &[&Value]) -> Vec<String> {
	let mut out = Vec::new();
	for value in values {
		match value {
			Value::Array(items) => out.extend(items.iter().filter_map(index_string)),
			other => out.extend(index_string(other)),
		}
	}
	out.sort();
	out.dedup();
	out
}

/// All index keys of a record for the given indexed paths
pub fn index_keys(collection: &str, record: &OfflineRecord, paths: &[String]) -> Vec<String> {
	let id_value = Value::String(record.id().to_string());
	let mut keys = Vec::new();
	for path in paths {
		let field = FieldPath::parse(path);
		let values = field.resolve(&record.snapshot, &id_value);
		for value in index_strings(&values) {
			keys.push(format!("{}{}", index_prefix(collection, path, &value), record.id()));
		}
	}
	keys
}

/// Extract the id from a key under `prefix`, skipping nested keys
pub fn child_id<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
	let remainder = key.strip_prefix(prefix)?;
	if remainder.is_empty() || remainder.contains('/') {
		return None;
	}
	Some(remainder)
}

// vim: ts=4
