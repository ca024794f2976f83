//! redb-backed Persistent Local Store
//!
//! Stores one JSON offline record per document in a single database file.
//! Collections are created by `register_collection` at startup; equality
//! clauses on the registered index paths are answered from an index table.
//!
//! # Storage Layout
//!
//! - `records` - `{collection}/{id}` -> offline record JSON
//! - `indexes` - `{collection}/{path}/{value}/{id}` -> empty
//! - `meta` - `collections/{collection}` -> indexed paths
//!
//! All redb work runs on the blocking thread pool.

#![forbid(unsafe_code)]

mod error;
mod index;
mod query;
pub mod storage;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub use error::Error;

use error::from_redb_error;
use rtsync::offline_store::OfflineStore;
use rtsync::prelude::RtResult;
use rtsync::query::{QueryParameters, QueryResults};
use rtsync::types::OfflineRecord;

type RtError = rtsync::error::Error;

/// Store configuration options
#[derive(Debug, Clone)]
pub struct RedbStoreConfig {
	/// Database file
	pub path: PathBuf,

	/// Create the database file (and its directory) when missing
	pub create_if_missing: bool,

	/// Refuse new records past this many, reporting a storage quota error
	pub max_records: Option<u64>,
}

impl Default for RedbStoreConfig {
	fn default() -> Self {
		Self { path: PathBuf::from("rtsync.redb"), create_if_missing: true, max_records: None }
	}
}

impl RedbStoreConfig {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), ..Self::default() }
	}
}

#[derive(Debug)]
pub struct RedbOfflineStore {
	db: Arc<redb::Database>,
	/// Registered collections and their indexed paths
	collections: RwLock<HashMap<String, Vec<String>>>,
	config: RedbStoreConfig,
}

impl RedbOfflineStore {
	pub async fn open(config: RedbStoreConfig) -> RtResult<Self> {
		let path = config.path.clone();
		let exists = tokio::fs::try_exists(&path).await?;
		if !exists && !config.create_if_missing {
			return Err(RtError::Storage(format!("database {} does not exist", path.display())));
		}
		if !exists && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			tokio::fs::create_dir_all(parent).await?;
		}

		let (db, collections) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
			let db = if exists {
				redb::Database::open(&path).map_err(from_redb_error)?
			} else {
				redb::Database::create(&path).map_err(from_redb_error)?
			};

			// Initialize tables
			{
				let tx = db.begin_write().map_err(from_redb_error)?;
				let _ = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
				let _ = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
				let _ = tx.open_table(storage::TABLE_METADATA).map_err(from_redb_error)?;
				tx.commit().map_err(from_redb_error)?;
			}

			let collections = load_collections(&db)?;
			Ok((db, collections))
		})
		.await??;

		info!("offline store: opened {} ({} collections)", config.path.display(), collections.len());
		Ok(Self { db: Arc::new(db), collections: RwLock::new(collections), config })
	}

	/// Registered collection names
	pub fn collections(&self) -> Vec<String> {
		let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
		names.sort();
		names
	}

	fn index_paths(&self, collection: &str) -> RtResult<Vec<String>> {
		self.collections
			.read()
			.get(collection)
			.cloned()
			.ok_or_else(|| RtError::UnknownCollection(collection.to_string()))
	}

	/// Run blocking redb work on the blocking pool
	async fn blocking<T, F>(&self, f: F) -> RtResult<T>
	where
		T: Send + 'static,
		F: FnOnce(&redb::Database) -> RtResult<T> + Send + 'static,
	{
		let db = Arc::clone(&self.db);
		tokio::task::spawn_blocking(move || f(&db)).await?
	}
}

fn load_collections(db: &redb::Database) -> Result<HashMap<String, Vec<String>>, Error> {
	let tx = db.begin_read().map_err(from_redb_error)?;
	let meta = tx.open_table(storage::TABLE_METADATA).map_err(from_redb_error)?;
	let prefix = storage::meta_key("");
	let mut collections = HashMap::new();
	for item in meta.range(prefix.as_str()..).map_err(from_redb_error)? {
		let (key, value) = item.map_err(from_redb_error)?;
		let Some(name) = key.value().strip_prefix(&prefix) else {
			break;
		};
		let paths: Vec<String> = serde_json::from_str(value.value())?;
		collections.insert(name.to_string(), paths);
	}
	Ok(collections)
}

fn read_record(
	table: &impl ReadableTable<&'static str, &'static str>,
	key: &str,
) -> Result<Option<OfflineRecord>, Error> {
	match table.get(key).map_err(from_redb_error)? {
		Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
		None => Ok(None),
	}
}

#[async_trait]
impl OfflineStore for RedbOfflineStore {
	async fn register_collection(&self, collection: &str, index_paths: &[String]) -> RtResult<()> {
		if !storage::is_valid_collection_name(collection) {
			return Err(Error::InvalidName(collection.to_string()).into());
		}
		let known = self.collections.read().get(collection).cloned();
		let mut paths = known.clone().unwrap_or_default();
		let added: Vec<String> = index_paths.iter().filter(|p| !paths.contains(p)).cloned().collect();
		if known.is_some() && added.is_empty() {
			return Ok(());
		}
		paths.extend(added.iter().cloned());

		let name = collection.to_string();
		let stored = paths.clone();
		let indexed = self
			.blocking(move |db| {
				let tx = db.begin_write().map_err(from_redb_error)?;
				{
					let mut meta = tx.open_table(storage::TABLE_METADATA).map_err(from_redb_error)?;
					let json = serde_json::to_string(&stored)?;
					meta.insert(storage::meta_key(&name).as_str(), json.as_str()).map_err(from_redb_error)?;
				}
				let indexed = index::build_index(&tx, &name, &added)?;
				tx.commit().map_err(from_redb_error)?;
				Ok(indexed)
			})
			.await?;

		debug!("offline store: registered {} (indexes {:?}, {} records indexed)", collection, paths, indexed);
		self.collections.write().insert(collection.to_string(), paths);
		Ok(())
	}

	async fn get_all_ids(&self, collection: &str) -> RtResult<Vec<String>> {
		self.index_paths(collection)?;
		let prefix = storage::record_prefix(collection);
		self.blocking(move |db| {
			let tx = db.begin_read().map_err(from_redb_error)?;
			let table = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
			let mut ids = Vec::new();
			for item in table.range(prefix.as_str()..).map_err(from_redb_error)? {
				let (key, _) = item.map_err(from_redb_error)?;
				if !key.value().starts_with(&prefix) {
					break;
				}
				if let Some(id) = storage::child_id(key.value(), &prefix) {
					ids.push(id.to_string());
				}
			}
			Ok(ids)
		})
		.await
	}

	async fn get_all(&self, collection: &str) -> RtResult<Vec<OfflineRecord>> {
		let results = self.query(collection, &QueryParameters::new()).await?;
		Ok(results.into_docs())
	}

	async fn get(&self, collection: &str, id: &str) -> RtResult<Option<OfflineRecord>> {
		self.index_paths(collection)?;
		let key = storage::record_key(collection, id);
		self.blocking(move |db| {
			let tx = db.begin_read().map_err(from_redb_error)?;
			let table = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
			Ok(read_record(&table, &key)?)
		})
		.await
	}

	async fn query(&self, collection: &str, params: &QueryParameters) -> RtResult<QueryResults<OfflineRecord>> {
		let paths = self.index_paths(collection)?;
		let collection = collection.to_string();
		let params = params.clone();
		self.blocking(move |db| query::execute_query(db, &collection, &params, &paths)).await
	}

	async fn put(&self, collection: &str, record: &OfflineRecord) -> RtResult<()> {
		let paths = self.index_paths(collection)?;
		let collection = collection.to_string();
		let record = record.clone();
		let max_records = self.config.max_records;

		self.blocking(move |db| {
			let key = storage::record_key(&collection, record.id());
			let json = serde_json::to_string(&record)?;
			let tx = db.begin_write().map_err(from_redb_error)?;
			{
				let mut records = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
				let old = read_record(&records, &key)?;
				if old.is_none()
					&& let Some(max) = max_records
					&& records.len().map_err(from_redb_error)? >= max
				{
					return Err(Error::QuotaExceeded.into());
				}
				records.insert(key.as_str(), json.as_str()).map_err(from_redb_error)?;

				let mut indexes = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
				index::reindex_record(&mut indexes, &collection, &paths, old.as_ref(), Some(&record))?;
			}
			tx.commit().map_err(from_redb_error)?;
			Ok(())
		})
		.await
	}

	async fn delete(&self, collection: &str, id: &str) -> RtResult<()> {
		let paths = self.index_paths(collection)?;
		let collection = collection.to_string();
		let key = storage::record_key(&collection, id);

		self.blocking(move |db| {
			let tx = db.begin_write().map_err(from_redb_error)?;
			{
				let mut records = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
				let old = read_record(&records, &key)?;
				if old.is_some() {
					records.remove(key.as_str()).map_err(from_redb_error)?;
					let mut indexes = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
					index::reindex_record(&mut indexes, &collection, &paths, old.as_ref(), None)?;
				}
			}
			tx.commit().map_err(from_redb_error)?;
			Ok(())
		})
		.await
	}

	async fn delete_db(&self) -> RtResult<()> {
		self.blocking(|db| {
			let tx = db.begin_write().map_err(from_redb_error)?;
			tx.delete_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
			tx.delete_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
			tx.delete_table(storage::TABLE_METADATA).map_err(from_redb_error)?;
			let _ = tx.open_table(storage::TABLE_RECORDS).map_err(from_redb_error)?;
			let _ = tx.open_table(storage::TABLE_INDEXES).map_err(from_redb_error)?;
			let _ = tx.open_table(storage::TABLE_METADATA).map_err(from_redb_error)?;
			tx.commit().map_err(from_redb_error)?;
			Ok(())
		})
		.await?;
		self.collections.write().clear();
		info!("offline store: deleted all records in {}", self.config.path.display());
		Ok(())
	}
}

// vim: ts=4
