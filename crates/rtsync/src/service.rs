//! Realtime Service
//!
//! Process-wide registry and factory of realtime documents and queries. It
//! owns the local and the remote store, guarantees a single in-memory
//! instance per `collection:id`, and forwards local writes to the open
//! queries of the collection so they update before the network answers.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use rtsync_types::offline_store::OfflineStore;
use rtsync_types::query::QueryParameters;
use rtsync_types::remote_store::RemoteStore;
use rtsync_types::types::{ConnectionState, DocKey};
use rtsync_types::utils;

use crate::config::RealtimeConfig;
use crate::doc::RealtimeDoc;
use crate::prelude::*;
use crate::query::RealtimeQuery;
use crate::type_registry::TypeRegistry;

/// Notified whenever the offline copy of a document was written or removed
#[async_trait]
pub trait OfflineDataHook: Send + Sync {
	async fn offline_data_updated(&self, key: &DocKey, data: Option<&Value>);
}

/// Per-collection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
	pub docs: usize,
	/// Direct subscriptions plus query references
	pub subscribers: usize,
	pub queries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
	pub total_docs: usize,
	pub collections: HashMap<String, CollectionStats>,
}

pub struct RealtimeService {
	config: RealtimeConfig,
	types: TypeRegistry,
	offline_store: Arc<dyn OfflineStore>,
	remote_store: Arc<dyn RemoteStore>,
	this: Weak<RealtimeService>,
	docs: Mutex<HashMap<DocKey, Arc<RealtimeDoc>>>,
	/// Subscribed queries per collection
	queries: Mutex<HashMap<String, Vec<Arc<RealtimeQuery>>>>,
	offline_data_hook: RwLock<Option<Arc<dyn OfflineDataHook>>>,
	shut_down: Mutex<bool>,
}

impl std::fmt::Debug for RealtimeService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RealtimeService")
			.field("config", &self.config)
			.field("docs", &self.docs.lock().len())
			.finish_non_exhaustive()
	}
}

impl RealtimeService {
	/// Create the service and the backing collections of every registered
	/// type
	pub async fn new(
		config: RealtimeConfig,
		types: TypeRegistry,
		offline_store: Arc<dyn OfflineStore>,
		remote_store: Arc<dyn RemoteStore>,
	) -> RtResult<Arc<Self>> {
		for doc_type in types.doc_types() {
			offline_store.register_collection(&doc_type.collection, &doc_type.index_paths).await?;
		}
		for file_type in types.file_types() {
			offline_store.register_collection(&file_type.name, &[]).await?;
		}
		info!(
			"realtime service: {} document types, {} file types",
			types.doc_types().count(),
			types.file_types().len()
		);
		Ok(Arc::new_cyclic(|this| Self {
			config,
			types,
			offline_store,
			remote_store,
			this: this.clone(),
			docs: Mutex::new(HashMap::new()),
			queries: Mutex::new(HashMap::new()),
			offline_data_hook: RwLock::new(None),
			shut_down: Mutex::new(false),
		}))
	}

	pub fn config(&self) -> &RealtimeConfig {
		&self.config
	}

	pub fn types(&self) -> &TypeRegistry {
		&self.types
	}

	pub fn offline_store(&self) -> &Arc<dyn OfflineStore> {
		&self.offline_store
	}

	pub fn remote_store(&self) -> &Arc<dyn RemoteStore> {
		&self.remote_store
	}

	pub fn is_online(&self) -> bool {
		self.remote_store.is_online()
	}

	pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
		self.remote_store.connection_state()
	}

	/// Fresh random document id
	pub fn new_doc_id(&self) -> String {
		utils::random_id()
	}

	pub fn set_offline_data_hook(&self, hook: Arc<dyn OfflineDataHook>) {
		*self.offline_data_hook.write() = Some(hook);
	}

	fn check_running(&self) -> RtResult<()> {
		if *self.shut_down.lock() {
			return Err(Error::Disposed);
		}
		Ok(())
	}

	/// The one in-memory instance of a document, created on first access
	pub fn get(&self, collection: &str, id: &str) -> RtResult<Arc<RealtimeDoc>> {
		self.check_running()?;
		let doc_type = self.types.doc_type(collection)?;
		let key = DocKey::new(collection, id);
		let mut docs = self.docs.lock();
		if let Some(doc) = docs.get(&key) {
			return Ok(doc.clone());
		}
		let adapter = self.remote_store.create_doc_adapter(collection, id)?;
		if adapter.id() != id {
			return Err(Error::InvalidDocId { collection: collection.to_string() });
		}
		let doc =
			RealtimeDoc::new(self.this.clone(), key.clone(), doc_type.ot_type, adapter, self.config.broadcast_capacity);
		trace!("realtime service: tracking {}", key);
		docs.insert(key, doc.clone());
		Ok(doc)
	}

	pub fn is_tracked(&self, collection: &str, id: &str) -> bool {
		self.docs.lock().contains_key(&DocKey::new(collection, id))
	}

	pub async fn subscribe(&self, collection: &str, id: &str) -> RtResult<Arc<RealtimeDoc>> {
		let doc = self.get(collection, id)?;
		doc.subscribe().await?;
		Ok(doc)
	}

	pub async fn create(&self, collection: &str, id: &str, data: Value) -> RtResult<Arc<RealtimeDoc>> {
		let doc = self.get(collection, id)?;
		doc.create(data).await?;
		Ok(doc)
	}

	pub async fn online_fetch(&self, collection: &str, id: &str) -> RtResult<Arc<RealtimeDoc>> {
		let doc = self.get(collection, id)?;
		doc.online_fetch().await?;
		Ok(doc)
	}

	pub fn create_query(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<RealtimeQuery>> {
		self.check_running()?;
		self.types.doc_type(collection)?;
		let adapter = self.remote_store.create_query_adapter(collection, params)?;
		Ok(RealtimeQuery::new(self.this.clone(), adapter, self.config.clone()))
	}

	/// Live query: local results first, then remote updates
	pub async fn subscribe_query(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<RealtimeQuery>> {
		let query = self.create_query(collection, params)?;
		query.subscribe().await?;
		Ok(query)
	}

	/// One-shot remote query
	pub async fn online_query(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<RealtimeQuery>> {
		let query = self.create_query(collection, params)?;
		query.fetch().await?;
		Ok(query)
	}

	pub(crate) fn on_query_subscribe(&self, query: &Arc<RealtimeQuery>) {
		let mut queries = self.queries.lock();
		let list = queries.entry(query.collection().to_string()).or_default();
		if !list.iter().any(|q| Arc::ptr_eq(q, query)) {
			list.push(query.clone());
		}
	}

	pub(crate) fn on_query_unsubscribe(&self, query: &RealtimeQuery) {
		let mut queries = self.queries.lock();
		if let Some(list) = queries.get_mut(query.collection()) {
			list.retain(|q| !std::ptr::eq(Arc::as_ptr(q), query));
			if list.is_empty() {
				queries.remove(query.collection());
			}
		}
	}

	/// Recompute the local membership of every subscribed query over
	/// `collection`
	pub async fn on_local_doc_update(&self, collection: &str) {
		let queries: Vec<Arc<RealtimeQuery>> = self.queries.lock().get(collection).cloned().unwrap_or_default();
		for (query, result) in queries.iter().zip(join_all(queries.iter().map(|q| q.local_update())).await) {
			if let Err(err) = result {
				warn!("query {}: local update failed: {}", query.name(), err);
			}
		}
	}

	/// Evict a disposed document: registry entry and offline record. Records
	/// still holding pending operations are kept.
	pub async fn on_local_doc_dispose(&self, doc: &RealtimeDoc) -> RtResult<()> {
		if !doc.is_disposed() {
			warn!("realtime service: refusing to evict live document {}", doc.key());
			return Ok(());
		}
		let registered = self.docs.lock().get(doc.key()).is_some_and(|d| std::ptr::eq(Arc::as_ptr(d), doc));
		if !registered {
			return Ok(());
		}
		let pending = doc.to_record().pending_ops.len();
		if pending == 0 {
			self.offline_store.delete(doc.collection(), doc.id()).await?;
		} else {
			info!("realtime service: keeping offline record of {} with {} pending ops", doc.key(), pending);
		}
		let mut docs = self.docs.lock();
		if docs.get(doc.key()).is_some_and(|d| std::ptr::eq(Arc::as_ptr(d), doc)) {
			docs.remove(doc.key());
		}
		Ok(())
	}

	pub(crate) fn offline_data_updated(&self, key: &DocKey, data: Option<Value>) {
		let Some(hook) = self.offline_data_hook.read().clone() else {
			return;
		};
		let key = key.clone();
		tokio::spawn(async move {
			hook.offline_data_updated(&key, data.as_ref()).await;
		});
	}

	pub fn doc_stats(&self) -> ServiceStats {
		let mut stats = ServiceStats::default();
		for (key, doc) in self.docs.lock().iter() {
			let entry = stats.collections.entry(key.collection.to_string()).or_default();
			entry.docs += 1;
			entry.subscribers += doc.subscriber_count();
			stats.total_docs += 1;
		}
		for (collection, queries) in self.queries.lock().iter() {
			stats.collections.entry(collection.clone()).or_default().queries += queries.len();
		}
		stats
	}

	/// Release every adapter. Offline records stay in place, so a new
	/// service over the same local store picks up where this one stopped.
	pub async fn shutdown(&self) {
		{
			let mut shut_down = self.shut_down.lock();
			if *shut_down {
				return;
			}
			*shut_down = true;
		}
		let queries: Vec<Arc<RealtimeQuery>> = self.queries.lock().drain().flat_map(|(_, list)| list).collect();
		for query in queries {
			query.close().await;
		}
		let docs: Vec<Arc<RealtimeDoc>> = self.docs.lock().drain().map(|(_, doc)| doc).collect();
		for doc in &docs {
			doc.close().await;
		}
		info!("realtime service: shut down, released {} documents", docs.len());
	}
}

// vim: ts=4
