//! Persistent Local Store adapter trait

use async_trait::async_trait;
use std::fmt::Debug;

use crate::prelude::*;
use crate::query::{QueryParameters, QueryResults};
use crate::types::OfflineRecord;

/// Key-value store of offline records, one logical collection per document
/// type.
///
/// Records are kept ordered by id within a collection, so queries evaluated
/// here see the same input order as the remote store.
#[async_trait]
pub trait OfflineStore: Debug + Send + Sync {
	/// Create the backing collection if it does not exist yet.
	///
	/// `index_paths` name data paths worth indexing for equality lookups.
	async fn register_collection(&self, collection: &str, index_paths: &[String]) -> RtResult<()>;

	async fn get_all_ids(&self, collection: &str) -> RtResult<Vec<String>>;

	async fn get_all(&self, collection: &str) -> RtResult<Vec<OfflineRecord>>;

	async fn get(&self, collection: &str, id: &str) -> RtResult<Option<OfflineRecord>>;

	async fn query(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<OfflineRecord>>;

	/// Insert or replace a record. Fails with `Error::StorageQuota` when full.
	async fn put(&self, collection: &str, record: &OfflineRecord) -> RtResult<()>;

	async fn delete(&self, collection: &str, id: &str) -> RtResult<()>;

	/// Drop every collection and record
	async fn delete_db(&self) -> RtResult<()>;
}

// vim: ts=4
