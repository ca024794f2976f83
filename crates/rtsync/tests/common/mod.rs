//! Shared setup for the engine integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rtsync::{DocType, FileType, RealtimeConfig, RealtimeService, TypeRegistry};
use rtsync_types::offline_store::OfflineStore;
use rtsync_types::ot::OtTypeId;
use rtsync_types::remote_store::RemoteStore;
use rtsync_types::types::Snapshot;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter(EnvFilter::from_default_env()).try_init();
}

pub fn types() -> TypeRegistry {
	TypeRegistry::new()
		.with_doc_type(DocType::new("widgets", OtTypeId::Json0).with_index("color"))
		.with_doc_type(DocType::new("notes", OtTypeId::RichText))
		.with_file_type(FileType::new("audio", "widgets", &["audioUrl"]))
}

pub async fn service(offline: Arc<dyn OfflineStore>, remote: Arc<dyn RemoteStore>) -> Arc<RealtimeService> {
	init_tracing();
	RealtimeService::new(RealtimeConfig::default(), types(), offline, remote).await.expect("Failed to create service")
}

pub fn widget(id: &str, data: Value) -> Snapshot {
	Snapshot::with_data(id, 1, data, OtTypeId::Json0)
}

/// Poll `check` until it holds, for effects of background tasks
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..200 {
		if check().await {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	false
}

/// Next message accepted by `accept`, skipping others; `None` on timeout
pub async fn next_matching<T: Clone>(rx: &mut broadcast::Receiver<T>, accept: impl Fn(&T) -> bool) -> Option<T> {
	tokio::time::timeout(Duration::from_secs(2), async {
		loop {
			match rx.recv().await {
				Ok(message) if accept(&message) => return Some(message),
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	})
	.await
	.ok()
	.flatten()
}
