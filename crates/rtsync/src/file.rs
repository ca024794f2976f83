//! File / offline-data service
//!
//! Binary attachments referenced from documents. Uploads and deletions made
//! while offline are staged in the local store and queued in a durable
//! [`WorkQueue`]; the queue is drained in order whenever the remote store
//! connects. Attachments of documents kept offline are cached locally and
//! refreshed whenever the document's offline copy changes.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use rtsync_types::ot::json0;
use rtsync_types::types::{ConnectionState, DocKey, OfflineRecord};

use crate::prelude::*;
use crate::service::{OfflineDataHook, RealtimeService};
use crate::type_registry::FileType;
use crate::work_queue::WorkQueue;

const QUEUE_COLLECTION: &str = "_file_queue";
const LOCAL_URL_PREFIX: &str = "local:";

/// Moves file contents to and from the file server
#[async_trait]
pub trait FileTransport: Send + Sync {
	/// Returns the url the file is served from
	async fn upload(&self, file_type: &str, id: &str, filename: &str, content: &[u8]) -> RtResult<String>;

	async fn download(&self, file_type: &str, url: &str) -> RtResult<Vec<u8>>;

	async fn delete(&self, file_type: &str, id: &str, owner: &str) -> RtResult<()>;
}

/// Url of a staged file that was not uploaded yet
pub fn local_url(file_type: &str, id: &str) -> String {
	format!("{}{}/{}", LOCAL_URL_PREFIX, file_type, id)
}

pub fn is_local_url(url: &str) -> bool {
	url.starts_with(LOCAL_URL_PREFIX)
}

/// Offline copy of one attachment, keyed by the owning document id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
	pub data_collection: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub online_url: Option<String>,
	/// Owner of a file whose deletion is still to be sent
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delete_ref: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
	pub content: Option<Vec<u8>>,
	#[serde(default)]
	pub keep_offline: bool,
}

mod base64_bytes {
	use super::*;

	pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
		match bytes {
			Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
		let encoded: Option<String> = Option::deserialize(deserializer)?;
		encoded.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom)).transpose()
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum FileTask {
	#[serde(rename_all = "camelCase")]
	Upload { file_type: String, id: String },
	#[serde(rename_all = "camelCase")]
	Delete { file_type: String, id: String, owner: String },
}

impl FileTask {
	fn targets(&self, file_type: &str, id: &str) -> bool {
		match self {
			FileTask::Upload { file_type: ft, id: i } | FileTask::Delete { file_type: ft, id: i, .. } => {
				ft == file_type && i == id
			}
		}
	}
}

pub struct FileService {
	service: Weak<RealtimeService>,
	transport: Arc<dyn FileTransport>,
	queue: WorkQueue<FileTask>,
	/// Serializes queue draining
	sync_lock: tokio::sync::Mutex<()>,
	sync_complete: broadcast::Sender<usize>,
	watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FileService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FileService").field("queue", &self.queue).finish_non_exhaustive()
	}
}

impl FileService {
	/// Open the durable queue and hook into the service's offline writes
	pub async fn new(service: &Arc<RealtimeService>, transport: Arc<dyn FileTransport>) -> RtResult<Arc<Self>> {
		let queue = WorkQueue::open(service.offline_store().clone(), QUEUE_COLLECTION).await?;
		let (sync_complete, _) = broadcast::channel(service.config().broadcast_capacity);
		let files = Arc::new(Self {
			service: Arc::downgrade(service),
			transport,
			queue,
			sync_lock: tokio::sync::Mutex::new(()),
			sync_complete,
			watcher: Mutex::new(None),
		});
		service.set_offline_data_hook(files.clone());
		Ok(files)
	}

	/// Drain the queue every time the remote store connects
	pub fn start(self: &Arc<Self>) -> RtResult<()> {
		let mut state = self.service()?.connection_state();
		let files = Arc::downgrade(self);
		let task = tokio::spawn(async move {
			loop {
				let connected = *state.borrow_and_update() == ConnectionState::Connected;
				if connected {
					let Some(files) = files.upgrade() else {
						return;
					};
					if let Err(err) = files.sync_files().await {
						warn!("file sync: stopped: {}", err);
					}
				}
				if state.changed().await.is_err() {
					return;
				}
			}
		});
		if let Some(old) = self.watcher.lock().replace(task) {
			old.abort();
		}
		Ok(())
	}

	pub fn stop(&self) {
		if let Some(task) = self.watcher.lock().take() {
			task.abort();
		}
	}

	/// Emits the number of queue entries handled by each completed sync
	pub fn sync_complete(&self) -> broadcast::Receiver<usize> {
		self.sync_complete.subscribe()
	}

	fn service(&self) -> RtResult<Arc<RealtimeService>> {
		self.service.upgrade().ok_or(Error::Disposed)
	}

	fn file_type(&self, name: &str) -> RtResult<FileType> {
		Ok(self.service()?.types().file_type(name)?.clone())
	}

	pub async fn get(&self, file_type: &str, id: &str) -> RtResult<Option<FileRecord>> {
		let service = self.service()?;
		let Some(record) = service.offline_store().get(file_type, id).await? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_value(record.snapshot.data.unwrap_or_default())?))
	}

	pub async fn get_all(&self, file_type: &str) -> RtResult<Vec<(String, FileRecord)>> {
		let service = self.service()?;
		let mut files = Vec::new();
		for record in service.offline_store().get_all(file_type).await? {
			let id = record.snapshot.id;
			files.push((id, serde_json::from_value(record.snapshot.data.unwrap_or_default())?));
		}
		Ok(files)
	}

	async fn put(&self, file_type: &str, id: &str, file: &FileRecord) -> RtResult<()> {
		let record = OfflineRecord::plain(id, serde_json::to_value(file)?);
		self.service()?.offline_store().put(file_type, &record).await
	}

	async fn remove(&self, file_type: &str, id: &str) -> RtResult<()> {
		self.service()?.offline_store().delete(file_type, id).await
	}

	/// Upload the attachment of document `id`.
	///
	/// Online, the file goes straight to the server and the returned url is
	/// the server's. Otherwise the content is staged locally, queued, and a
	/// local url is returned. A full local store fails the call.
	pub async fn upload_file(
		&self,
		file_type: &str,
		id: &str,
		filename: &str,
		content: Vec<u8>,
		keep_offline: bool,
	) -> RtResult<String> {
		let ft = self.file_type(file_type)?;
		if self.service()?.is_online() {
			match self.transport.upload(file_type, id, filename, &content).await {
				Ok(url) => {
					if keep_offline {
						let file = FileRecord {
							data_collection: ft.data_collection,
							online_url: Some(url.clone()),
							filename: Some(filename.to_string()),
							content: Some(content),
							keep_offline,
							..FileRecord::default()
						};
						self.put(file_type, id, &file).await?;
					}
					return Ok(url);
				}
				Err(err) => debug!("file {}/{}: upload failed, staging offline: {}", file_type, id, err),
			}
		}

		let file = FileRecord {
			data_collection: ft.data_collection,
			filename: Some(filename.to_string()),
			content: Some(content),
			keep_offline,
			..FileRecord::default()
		};
		self.put(file_type, id, &file).await?;
		self.queue.remove_where(|task| task.targets(file_type, id)).await?;
		self.queue.push(&FileTask::Upload { file_type: file_type.to_string(), id: id.to_string() }).await?;
		info!("file {}/{}: staged for upload", file_type, id);
		Ok(local_url(file_type, id))
	}

	/// Delete the attachment of document `id`, now or once connected
	pub async fn delete_file(&self, file_type: &str, id: &str, owner: &str) -> RtResult<()> {
		let data_collection = self.file_type(file_type)?.data_collection;
		let local = self.get(file_type, id).await?;
		self.queue.remove_where(|task| task.targets(file_type, id)).await?;
		if local.as_ref().is_some_and(|file| file.online_url.is_none() && file.delete_ref.is_none()) {
			// never left this device
			return self.remove(file_type, id).await;
		}

		if self.service()?.is_online() {
			match self.transport.delete(file_type, id, owner).await {
				Ok(()) => {
					if local.is_some() {
						self.remove(file_type, id).await?;
					}
					return Ok(());
				}
				Err(err) => debug!("file {}/{}: delete failed, queueing: {}", file_type, id, err),
			}
		}

		let file = FileRecord { data_collection, delete_ref: Some(owner.to_string()), ..FileRecord::default() };
		self.put(file_type, id, &file).await?;
		self.queue
			.push(&FileTask::Delete { file_type: file_type.to_string(), id: id.to_string(), owner: owner.to_string() })
			.await?;
		Ok(())
	}

	/// Return the cached copy, refreshing it from `url` when stale.
	///
	/// `None` as url drops the cached copy. Records of queued uploads and
	/// deletions are never touched here.
	pub async fn find_or_update_cache(
		&self,
		file_type: &str,
		id: &str,
		url: Option<&str>,
	) -> RtResult<Option<FileRecord>> {
		let cached = self.get(file_type, id).await?;
		if cached.as_ref().is_some_and(|file| file.online_url.is_none()) {
			return Ok(cached);
		}
		let Some(url) = url else {
			if cached.is_some() {
				self.remove(file_type, id).await?;
			}
			return Ok(None);
		};
		if is_local_url(url) || !self.service()?.is_online() {
			return Ok(cached);
		}
		if cached.as_ref().is_some_and(|file| file.online_url.as_deref() == Some(url)) {
			return Ok(cached);
		}
		let content = match self.transport.download(file_type, url).await {
			Ok(content) => content,
			Err(err) => {
				debug!("file {}/{}: caching {} failed: {}", file_type, id, url, err);
				return Ok(cached);
			}
		};
		let file = FileRecord {
			data_collection: self.file_type(file_type)?.data_collection,
			online_url: Some(url.to_string()),
			content: Some(content),
			keep_offline: true,
			..FileRecord::default()
		};
		self.put(file_type, id, &file).await?;
		Ok(Some(file))
	}

	pub async fn queued(&self) -> RtResult<Vec<FileTask>> {
		Ok(self.queue.entries().await?.into_iter().map(|(_, task)| task).collect())
	}

	/// Send queued uploads and deletions in the order they were made.
	///
	/// A failing entry stays at the front of the queue and ends the run.
	/// Returns how many entries were handled.
	pub async fn sync_files(&self) -> RtResult<usize> {
		let _guard = self.sync_lock.lock().await;
		let mut handled = 0;
		while let Some((seq, task)) = self.queue.front().await? {
			if !self.service()?.is_online() {
				debug!("file sync: went offline with entries left");
				return Ok(handled);
			}
			self.run_task(&task).await?;
			self.queue.remove(seq).await?;
			handled += 1;
		}
		if handled > 0 {
			info!("file sync: {} entries sent", handled);
		}
		let _ = self.sync_complete.send(handled);
		Ok(handled)
	}

	async fn run_task(&self, task: &FileTask) -> RtResult<()> {
		match task {
			FileTask::Delete { file_type, id, owner } => {
				self.transport.delete(file_type, id, owner).await?;
				self.remove(file_type, id).await
			}
			FileTask::Upload { file_type, id } => {
				let Some(file) = self.get(file_type, id).await? else {
					return Ok(());
				};
				let (Some(content), None) = (&file.content, &file.online_url) else {
					return Ok(());
				};
				let ft = self.file_type(file_type)?;
				let doc = self.service()?.online_fetch(&ft.data_collection, id).await?;
				if !doc.is_loaded() {
					debug!("file {}/{}: document gone, dropping staged file", file_type, id);
					return self.remove(file_type, id).await;
				}
				let filename = file.filename.as_deref().unwrap_or(id);
				let url = self.transport.upload(file_type, id, filename, content).await?;
				doc.set_path(&ft.url_path, Value::String(url.clone())).await?;
				if file.keep_offline {
					self.put(file_type, id, &FileRecord { online_url: Some(url), ..file }).await
				} else {
					self.remove(file_type, id).await
				}
			}
		}
	}
}

#[async_trait]
impl OfflineDataHook for FileService {
	async fn offline_data_updated(&self, key: &DocKey, data: Option<&Value>) {
		let Ok(service) = self.service() else {
			return;
		};
		for ft in service.types().file_types().iter().filter(|ft| *ft.data_collection == *key.collection) {
			let url = data.and_then(|data| json0::get_path(data, &ft.url_path)).and_then(Value::as_str);
			if let Err(err) = self.find_or_update_cache(&ft.name, &key.id, url).await {
				warn!("file {}/{}: cache refresh failed: {}", ft.name, key.id, err);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_file_record_layout() {
		let file = FileRecord {
			data_collection: "questions".into(),
			filename: Some("a.mp3".into()),
			content: Some(vec![1, 2, 3]),
			..FileRecord::default()
		};
		let value = serde_json::to_value(&file).expect("serialize");
		assert_eq!(value, json!({ "dataCollection": "questions", "filename": "a.mp3", "content": "AQID", "keepOffline": false }));
		assert_eq!(serde_json::from_value::<FileRecord>(value).expect("deserialize"), file);
	}

	#[test]
	fn test_task_layout() {
		let task = FileTask::Delete { file_type: "audio".into(), id: "q1".into(), owner: "u1".into() };
		assert_eq!(
			serde_json::to_value(&task).expect("serialize"),
			json!({ "action": "delete", "fileType": "audio", "id": "q1", "owner": "u1" })
		);
		assert!(task.targets("audio", "q1"));
		assert!(!task.targets("audio", "q2"));
	}

	#[test]
	fn test_local_url() {
		let url = local_url("audio", "q1");
		assert_eq!(url, "local:audio/q1");
		assert!(is_local_url(&url));
		assert!(!is_local_url("/audio/q1.mp3"));
	}
}

// vim: ts=4
