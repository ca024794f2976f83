//! Realtime query membership, ordering and lifecycle

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, next_matching, service, widget};
use rtsync::QueryChange;
use rtsync_offline_store_memory::MemoryOfflineStore;
use rtsync_offline_store_redb::{RedbOfflineStore, RedbStoreConfig};
use rtsync_remote_store_memory::{MemoryRemoteStore, MemoryServer};
use rtsync_types::offline_store::OfflineStore;
use rtsync_types::query::{QueryParameters, QueryResultSet};
use rtsync_types::remote_store::RemoteStore;
use serde_json::json;
use tempfile::TempDir;

fn seed_widgets(server: &MemoryServer) {
	server.add_snapshots(
		"widgets",
		[
			widget("a", json!({ "n": 3, "color": "red", "tags": ["x"] })),
			widget("b", json!({ "n": 1, "color": "blue", "tags": ["x", "y"] })),
			widget("c", json!({ "n": 2, "color": "red" })),
			widget("d", json!({ "n": 5, "color": "green", "tags": [] })),
			widget("e", json!({ "n": 4, "color": "red", "tags": ["y"] })),
		],
	);
}

#[tokio::test]
async fn test_local_write_reorders_results() {
	let server = MemoryServer::new();
	server.add_snapshots(
		"widgets",
		[widget("a", json!({ "n": 3 })), widget("b", json!({ "n": 1 })), widget("c", json!({ "n": 2 }))],
	);
	let remote = MemoryRemoteStore::connect(&server);
	let service = service(Arc::new(MemoryOfflineStore::new()), Arc::new(remote)).await;

	let by_n = QueryParameters::new().with_sort("n", true);
	let query = service.subscribe_query("widgets", &by_n).await.expect("subscribe");
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["b", "c", "a"] }).await);
	assert_eq!(query.count(), 3);

	let a = service.get("widgets", "a").expect("get");
	a.set_path(&[json!("n")], json!(0)).await.expect("set");
	// the local store answers before the server does
	assert_eq!(query.doc_ids(), ["a", "b", "c"]);

	let a = &a;
	assert!(eventually(|| async move { a.pending_ops().is_empty() }).await);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(query.doc_ids(), ["a", "b", "c"]);
	assert_eq!(query.count(), 3);
}

#[tokio::test]
async fn test_remote_inserts_and_removals_follow_server_order() {
	let server = MemoryServer::new();
	seed_widgets(&server);
	let alice = MemoryRemoteStore::connect(&server);
	let bob = MemoryRemoteStore::connect(&server);
	let service = service(Arc::new(MemoryOfflineStore::new()), Arc::new(alice)).await;

	let red = QueryParameters::new().with_filter("color", json!("red")).with_sort("n", false);
	let query = service.subscribe_query("widgets", &red).await.expect("subscribe");
	let mut changes = query.changes();
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["e", "a", "c"] }).await);

	let d = bob.create_doc_adapter("widgets", "d").expect("adapter");
	d.subscribe().await.expect("subscribe");
	d.submit_op(json!([{ "p": ["color"], "od": "green", "oi": "red" }]), None)
		.expect("submit")
		.await
		.expect("sent")
		.expect("acked");
	let c = bob.create_doc_adapter("widgets", "c").expect("adapter");
	c.subscribe().await.expect("subscribe");
	c.submit_op(json!([{ "p": ["color"], "od": "red", "oi": "blue" }]), None)
		.expect("submit")
		.await
		.expect("sent")
		.expect("acked");

	assert!(eventually(|| async move { q.doc_ids() == ["d", "e", "a"] }).await);
	assert!(next_matching(&mut changes, |c| *c == QueryChange::Remote).await.is_some());
	assert_eq!(query.count(), 3);
	let d_doc = service.get("widgets", "d").expect("get");
	assert_eq!(d_doc.data().and_then(|v| v.get("color").cloned()), Some(json!("red")));
}

#[tokio::test]
async fn test_local_store_matches_server_results() {
	let temp_dir = TempDir::new().expect("Failed to create temp directory");
	let store: Arc<dyn OfflineStore> = Arc::new(
		RedbOfflineStore::open(RedbStoreConfig::new(temp_dir.path().join("parity.redb"))).await.expect("open"),
	);
	let server = MemoryServer::new();
	seed_widgets(&server);
	let service = service(store.clone(), Arc::new(MemoryRemoteStore::connect(&server))).await;

	let all = service.subscribe_query("widgets", &QueryParameters::new()).await.expect("subscribe");
	let q = &all;
	assert!(eventually(|| async move { q.ready() && q.doc_ids().len() == 5 }).await);
	let s = &store;
	assert!(eventually(|| async move { s.get_all_ids("widgets").await.is_ok_and(|ids| ids.len() == 5) }).await);

	let cases = [
		QueryParameters::new().with_filter("color", json!("red")).with_sort("n", true),
		QueryParameters::new().with_sort("n", false).with_skip(1).with_limit(2),
		QueryParameters::new().with_filter("n", json!({ "$gt": 2 })).with_sort("_id", true),
		QueryParameters::new().with_filter("tags", json!("y")).with_sort("_id", true),
		QueryParameters::new().with_filter("color", json!({ "$in": ["blue", "green"] })).with_sort("n", true),
		QueryParameters::new().with_filter("tags", json!({ "$size": 0 })),
		QueryParameters::new().with_filter("color", json!("red")).with_limit(2).with_count(true),
		QueryParameters::new().with_filter("color", json!("red")).with_limit(2).with_count(false),
	];
	for params in &cases {
		let local = store.query("widgets", params).await.expect("local query");
		let remote = server.query("widgets", params).expect("server query");
		assert_eq!(local.unpaged_count, remote.unpaged_count, "unpaged count of {}", params.to_value());
		assert_eq!(local.count(), remote.count(), "count of {}", params.to_value());
		if let (QueryResultSet::Docs(local), QueryResultSet::Docs(remote)) = (local.results, remote.results) {
			let local: Vec<String> = local.into_iter().map(|r| r.snapshot.id).collect();
			let remote: Vec<String> = remote.into_iter().map(|s| s.id).collect();
			assert_eq!(local, remote, "results of {}", params.to_value());
		}
	}
}

#[tokio::test]
async fn test_offline_subscribe_serves_local_results() {
	let server = MemoryServer::new();
	seed_widgets(&server);
	let store: Arc<dyn OfflineStore> = Arc::new(MemoryOfflineStore::new());
	let red = QueryParameters::new().with_filter("color", json!("red")).with_sort("n", true);

	{
		let service = service(store.clone(), Arc::new(MemoryRemoteStore::connect(&server))).await;
		let query = service.subscribe_query("widgets", &red).await.expect("subscribe");
		let q = &query;
		assert!(eventually(|| async move { q.ready() && q.doc_ids().len() == 3 }).await);
		service.shutdown().await;
	}

	let remote = MemoryRemoteStore::connect(&server);
	remote.set_online(false);
	let service = service(store, Arc::new(remote.clone())).await;
	let query = service.subscribe_query("widgets", &red).await.expect("subscribe offline");
	assert_eq!(query.doc_ids(), ["c", "a", "e"]);
	assert!(!query.ready());
	assert_eq!(query.count(), 3);
	assert!(query.docs().iter().all(|doc| doc.is_loaded()));

	// a local write moves the offline results too
	let c = service.get("widgets", "c").expect("get");
	c.set_path(&[json!("color")], json!("blue")).await.expect("set");
	assert_eq!(query.doc_ids(), ["a", "e"]);

	remote.set_online(true);
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["a", "e"] }).await);
	assert_eq!(server.snapshot("widgets", "c").and_then(|s| s.data).and_then(|d| d.get("color").cloned()), Some(json!("blue")));
}

#[tokio::test]
async fn test_offline_dispose_keeps_documents() {
	let server = MemoryServer::new();
	seed_widgets(&server);
	let remote = MemoryRemoteStore::connect(&server);
	let store = Arc::new(MemoryOfflineStore::new());
	let service = service(store.clone(), Arc::new(remote.clone())).await;

	let blue = QueryParameters::new().with_filter("color", json!("blue"));
	let query = service.subscribe_query("widgets", &blue).await.expect("subscribe");
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["b"] }).await);

	remote.set_online(false);
	query.dispose().await;
	assert!(query.is_disposed());
	assert!(service.is_tracked("widgets", "b"));
	assert!(store.get("widgets", "b").await.expect("get").is_some());
	assert_eq!(service.doc_stats().collections["widgets"].queries, 0);
}

#[tokio::test]
async fn test_upstream_delete_evicts_document() {
	let server = MemoryServer::new();
	seed_widgets(&server);
	let alice = MemoryRemoteStore::connect(&server);
	let bob = MemoryRemoteStore::connect(&server);
	let store = Arc::new(MemoryOfflineStore::new());
	let service = service(store.clone(), Arc::new(alice)).await;

	let red = QueryParameters::new().with_filter("color", json!("red")).with_sort("n", true);
	let query = service.subscribe_query("widgets", &red).await.expect("subscribe");
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["c", "a", "e"] }).await);

	let a = bob.create_doc_adapter("widgets", "a").expect("adapter");
	a.subscribe().await.expect("subscribe");
	a.delete().expect("delete").await.expect("sent").expect("acked");

	let (service_ref, store_ref) = (&service, &store);
	assert!(
		eventually(|| async move {
			q.doc_ids() == ["c", "e"]
				&& !service_ref.is_tracked("widgets", "a")
				&& store_ref.get("widgets", "a").await.is_ok_and(|r| r.is_none())
		})
		.await
	);
	assert!(service.is_tracked("widgets", "c"));
}

#[tokio::test]
async fn test_online_query_fetches_once() {
	let server = MemoryServer::new();
	seed_widgets(&server);
	let service = service(Arc::new(MemoryOfflineStore::new()), Arc::new(MemoryRemoteStore::connect(&server))).await;

	let top = QueryParameters::new().with_sort("n", false).with_limit(2);
	let query = service.online_query("widgets", &top).await.expect("query");
	assert!(query.ready());
	assert!(!query.subscribed());
	assert_eq!(query.doc_ids(), ["d", "e"]);
	assert_eq!(query.unpaged_count(), 5);
	assert!(query.docs().iter().all(|doc| doc.is_loaded()));
	assert_eq!(service.doc_stats().collections.get("widgets").map_or(0, |c| c.queries), 0);
}

#[tokio::test]
async fn test_dispose_when_settled_gives_up_offline() {
	let remote = MemoryRemoteStore::new();
	let service = service(Arc::new(MemoryOfflineStore::new()), Arc::new(remote.clone())).await;
	remote.set_online(false);

	let query = service.subscribe_query("widgets", &QueryParameters::new()).await.expect("subscribe");
	query.dispose_when_settled(Duration::from_millis(50)).await;
	assert!(query.is_disposed());
	assert!(!query.ready());
}

#[tokio::test]
async fn test_paged_query_keeps_its_page_on_local_writes() {
	let server = MemoryServer::new();
	server.add_snapshots("widgets", ["a", "b", "c", "d", "e"].into_iter().zip(1..).map(|(id, n)| widget(id, json!({ "n": n }))));
	let service = service(Arc::new(MemoryOfflineStore::new()), Arc::new(MemoryRemoteStore::connect(&server))).await;

	let page = QueryParameters::new().with_sort("n", true).with_skip(2).with_limit(2);
	let query = service.subscribe_query("widgets", &page).await.expect("subscribe");
	let q = &query;
	assert!(eventually(|| async move { q.ready() && q.doc_ids() == ["c", "d"] }).await);

	let c = service.get("widgets", "c").expect("get");
	c.set_path(&[json!("label")], json!("x")).await.expect("set");
	assert_eq!(query.doc_ids(), ["c", "d"]);
	let c = &c;
	assert!(eventually(|| async move { c.pending_ops().is_empty() }).await);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(query.doc_ids(), ["c", "d"]);
	assert_eq!((query.count(), query.unpaged_count()), (2, 5));

	// moving d to the front shifts the window onto b and c
	let d = service.get("widgets", "d").expect("get");
	d.set_path(&[json!("n")], json!(0)).await.expect("set");
	assert!(eventually(|| async move { q.doc_ids() == ["b", "c"] }).await);
	assert_eq!(query.count(), 2);
}

#[tokio::test]
async fn test_settled_dispose_offline_keeps_pending_documents() {
	let server = MemoryServer::new();
	let remote = MemoryRemoteStore::connect(&server);
	let store = Arc::new(MemoryOfflineStore::new());
	let service = service(store.clone(), Arc::new(remote.clone())).await;
	remote.set_online(false);

	let w1 = service.create("widgets", "w1", json!({ "n": 1 })).await.expect("create");
	let query = service.subscribe_query("widgets", &QueryParameters::new()).await.expect("subscribe");
	assert_eq!(query.doc_ids(), ["w1"]);

	query.dispose_when_settled(Duration::from_millis(50)).await;
	assert!(query.is_disposed());
	assert!(service.is_tracked("widgets", "w1"));
	assert_eq!(w1.pending_ops().len(), 1);
	let record = store.get("widgets", "w1").await.expect("get").expect("kept");
	assert_eq!(record.pending_ops.len(), 1);

	remote.set_online(true);
	let server = &server;
	assert!(eventually(|| async move { server.exists("widgets", "w1") }).await);
}
