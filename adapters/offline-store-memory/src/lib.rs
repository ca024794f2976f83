//! In-memory Persistent Local Store
//!
//! Keeps one ordered map per collection, so records come back sorted by id
//! exactly like the durable store. An optional record quota simulates a full
//! device store: `put` of a new record past the quota fails with
//! `Error::StorageQuota`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use rtsync::offline_store::OfflineStore;
use rtsync::prelude::*;
use rtsync::query::{perform_query, QueryParameters, QueryResults};
use rtsync::types::OfflineRecord;

type Collection = BTreeMap<String, OfflineRecord>;

#[derive(Debug, Default)]
pub struct MemoryOfflineStore {
	collections: RwLock<HashMap<String, Collection>>,
	max_records: Option<usize>,
}

impl MemoryOfflineStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store refusing new records once `max_records` are held in total
	pub fn with_quota(max_records: usize) -> Self {
		Self { collections: RwLock::default(), max_records: Some(max_records) }
	}

	pub fn record_count(&self) -> usize {
		self.collections.read().values().map(BTreeMap::len).sum()
	}

	fn with_collection<T>(&self, collection: &str, f: impl FnOnce(&Collection) -> T) -> RtResult<T> {
		let collections = self.collections.read();
		let records =
			collections.get(collection).ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
		Ok(f(records))
	}
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
	async fn register_collection(&self, collection: &str, _index_paths: &[String]) -> RtResult<()> {
		let mut collections = self.collections.write();
		if !collections.contains_key(collection) {
			debug!("offline store: creating collection {}", collection);
			collections.insert(collection.to_string(), Collection::new());
		}
		Ok(())
	}

	async fn get_all_ids(&self, collection: &str) -> RtResult<Vec<String>> {
		self.with_collection(collection, |records| records.keys().cloned().collect())
	}

	async fn get_all(&self, collection: &str) -> RtResult<Vec<OfflineRecord>> {
		self.with_collection(collection, |records| records.values().cloned().collect())
	}

	async fn get(&self, collection: &str, id: &str) -> RtResult<Option<OfflineRecord>> {
		self.with_collection(collection, |records| records.get(id).cloned())
	}

	async fn query(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<OfflineRecord>> {
		let records = self.get_all(collection).await?;
		perform_query(params, &records)
	}

	async fn put(&self, collection: &str, record: &OfflineRecord) -> RtResult<()> {
		let mut collections = self.collections.write();
		let total: usize = collections.values().map(BTreeMap::len).sum();
		let records = collections
			.get_mut(collection)
			.ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
		if let Some(max) = self.max_records
			&& !records.contains_key(record.id())
			&& total >= max
		{
			warn!("offline store: quota of {} records reached, refusing {}:{}", max, collection, record.id());
			return Err(Error::StorageQuota);
		}
		records.insert(record.id().to_string(), record.clone());
		Ok(())
	}

	async fn delete(&self, collection: &str, id: &str) -> RtResult<()> {
		let mut collections = self.collections.write();
		let records = collections
			.get_mut(collection)
			.ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
		records.remove(id);
		Ok(())
	}

	async fn delete_db(&self) -> RtResult<()> {
		self.collections.write().clear();
		Ok(())
	}
}

// vim: ts=4
