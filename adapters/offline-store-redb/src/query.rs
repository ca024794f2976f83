use redb::{ReadableDatabase, ReadableTable};
use tracing::trace;
use rtsync::prelude::*;
use rtsync::query::{perform_query, QueryParameters, QueryResults};
use rtsync::types::OfflineRecord;
use serde_json::Value;

use crate::error::{from_redb_error, Error};
use crate::storage;

/// First top-level equality clause on an indexed path, as `(path, index string)`
fn indexed_equality(params: &QueryParameters, paths: &[String]) -> Option<(String, String)> {
	params.as_map().iter().find_map(|(key, value)| {
		if key.starts_with('$') || !paths.contains(key) {
			return None;
		}
		let expected = match value {
			Value::Object(ops) if ops.len() == 1 => ops.get("$eq")?,
			Value::Object(_) => return None,
			other => other,
		};
		Some((key.clone(), storage::index_string(expected)?))
	})
}

/// Execute a query against one collection.
///
/// Candidates come from an index when the filter has an indexed equality
/// clause, from a prefix scan otherwise. Either way they are ordered by id
/// before evaluation.
pub fn execute_query(
	db: &redb::Database,
	collection: &str,
	params: &QueryParameters,
	paths: &[String],
) -> RtResult<QueryResults<OfflineRecord>> {
	let tx = db.begin_read().map_err(from_redb_error)?;
	let records = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
	let mut candidates: Vec<OfflineRecord> = Vec::new();

	if let Some((path, value)) = indexed_equality(params, paths) {
		trace!("offline store: index lookup {}.{} = {}", collection, path, value);
		let indexes = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
		let prefix = storage::index_prefix(collection, &path, &value);
		for item in indexes.range(prefix.as_str()..).map_err(from_redb_error)? {
			let (key, _) = item.map_err(from_redb_error)?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			let Some(id) = storage::child_id(key.value(), &prefix) else {
				continue;
			};
			if let Some(value) = records.get(storage::record_key(collection, id).as_str()).map_err(from_redb_error)? {
				candidates.push(serde_json::from_str(value.value()).map_err(Error::from)?);
			}
		}
		candidates.sort_by(|a, b| a.id().cmp(b.id()));
	} else {
		let prefix = storage::record_prefix(collection);
		for item in records.range(prefix.as_str()..).map_err(from_redb_error)? {
			let (key, value) = item.map_err(from_redb_error)?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			if storage::child_id(key.value(), &prefix).is_none() {
				continue;
			}
			candidates.push(serde_json::from_str(value.value()).map_err(Error::from)?);
		}
	}

	perform_query(params, &candidates)
}


// vim: ts=4
