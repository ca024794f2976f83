//! Equality index maintenance

use redb::ReadableTable;
use rtsync::types::OfflineRecord;

use crate::error::{from_redb_error, Error};
use crate::storage;

type StrTable<'txn> = redb::Table<'txn, &'static str, &'static str>;

/// Replace the index entries of one record
pub fn reindex_record(
	indexes: &mut StrTable<'_>,
	collection: &str,
	paths: &[String],
	old: Option<&OfflineRecord>,
	new: Option<&OfflineRecord>,
) -> Result<(), Error> {
	if paths.is_empty() {
		return Ok(());
	}
	if let Some(old) = old {
		for key in storage::index_keys(collection, old, paths) {
			indexes.remove(key.as_str()).map_err(from_redb_error)?;
		}
	}
	if let Some(new) = new {
		for key in storage::index_keys(collection, new, paths) {
			indexes.insert(key.as_str(), "").map_err(from_redb_error)?;
		}
	}
	Ok(())
}

/// Index existing records of a collection on newly added paths
pub fn build_index(tx: &redb::WriteTransaction, collection: &str, paths: &[String]) -> Result<usize, Error> {
	if paths.is_empty() {
		return Ok(0);
	}
	let records = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
	let mut indexes = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
	let prefix = storage::record_prefix(collection);
	let mut count = 0;

	for item in records.range(prefix.as_str()..).map_err(from_redb_error)? {
		let (key, value) = item.map_err(from_redb_error)?;
		if !key.value().starts_with(&prefix) {
			break;
		}
		if storage::child_id(key.value(), &prefix).is_none() {
			continue;
		}
		let record: OfflineRecord = serde_json::from_str(value.value())?;
		for index_key in storage::index_keys(collection, &record, paths) {
			indexes.insert(index_key.as_str(), "").map_err(from_redb_error)?;
		}
		count += 1;
	}
	Ok(count)
}

// vim: ts=4
