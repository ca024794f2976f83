//! Tests for key and index helpers

use rtsync::ot::OtTypeId;
use rtsync::types::{OfflineRecord, Snapshot};
use rtsync_offline_store_redb::storage::*;
use serde_json::{json, Value};

#[test]
fn test_child_id() {
	assert_eq!(child_id("widgets/a", "widgets/"), Some("a"));
	assert_eq!(child_id("widgets/a/b", "widgets/"), None);
	assert_eq!(child_id("widgets/", "widgets/"), None);
	assert_eq!(child_id("other/a", "widgets/"), None);
}

#[test]
fn test_index_string() {
	assert_eq!(index_string(&json!("x")), Some("s:x".into()));
	assert_eq!(index_string(&json!(false)), Some("b:false".into()));
	assert_eq!(index_string(&json!(1)), None);
	assert_eq!(index_string(&Value::Null), None);
}

#[test]
fn test_index_keys_expand_arrays() {
	let record = OfflineRecord::new(
		Snapshot::with_data("q1", 0, json!({ "tags": ["a", "b", "a", 3], "ref": "p1" }), OtTypeId::Json0),
		Vec::new(),
	);
	let keys = index_keys("questions", &record, &["tags".to_string(), "ref".to_string(), "missing".to_string()]);
	assert_eq!(keys, ["questions/tags/s:a/q1", "questions/tags/s:b/q1", "questions/ref/s:p1/q1"]);
}

#[test]
fn test_collection_names() {
	assert!(is_valid_collection_name("widgets"));
	assert!(!is_valid_collection_name(""));
	assert!(!is_valid_collection_name("a/b"));
	assert_eq!(record_key("widgets", "a"), format!("{}a", record_prefix("widgets")));
}
