//! Tests for the in-memory remote store

use rtsync::list_diff::apply_change;
use rtsync::ot::OtTypeId;
use rtsync::prelude::*;
use rtsync::query::QueryParameters;
use rtsync::remote_store::{DocAdapter, DocEvent, QueryAdapter, QueryEvent, RemoteStore};
use rtsync::types::{OfflineRecord, PendingOp, Snapshot};
use rtsync_remote_store_memory::{MemoryRemoteStore, MemoryServer};
use serde_json::json;
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<DocEvent>) -> Vec<DocEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}

#[tokio::test]
async fn test_ops_reach_other_clients() {
	let server = MemoryServer::new();
	let alice = MemoryRemoteStore::connect(&server);
	let bob = MemoryRemoteStore::connect(&server);

	let a = alice.create_doc_adapter("widgets", "w1").expect("adapter");
	a.subscribe().await.expect("subscribe");
	let ack = a.create(json!({ "n": 0 }), OtTypeId::Json0).expect("create");
	ack.await.expect("ack sent").expect("acked");
	assert!(server.exists("widgets", "w1"));

	let b = bob.create_doc_adapter("widgets", "w1").expect("adapter");
	b.subscribe().await.expect("subscribe");
	assert_eq!(b.snapshot().data, Some(json!({ "n": 0 })));
	assert_eq!(b.snapshot().version, 1);

	let mut b_events = b.events();
	let ack = a.submit_op(json!([{ "p": ["n"], "na": 5 }]), None).expect("submit");
	ack.await.expect("ack sent").expect("acked");
	assert_eq!(b.snapshot().data, Some(json!({ "n": 5 })));
	assert_eq!(b.snapshot().version, 2);
	assert_eq!(drain(&mut b_events), vec![DocEvent::RemoteChange(json!([{ "p": ["n"], "na": 5 }]))]);
	assert_eq!(a.snapshot().version, 2);
}

#[tokio::test]
async fn test_offline_ops_replay_in_order() {
	let server = MemoryServer::new();
	server.add_snapshots("notes", [Snapshot::with_data("n1", 0, json!({ "s": "--" }), OtTypeId::Json0)]);
	let alice = MemoryRemoteStore::connect(&server);
	let bob = MemoryRemoteStore::connect(&server);

	bob.set_online(false);
	let b = bob.create_doc_adapter("notes", "n1").expect("adapter");
	b.restore(OfflineRecord::new(Snapshot::with_data("n1", 0, json!({ "s": "--" }), OtTypeId::Json0), Vec::new()));
	assert!(matches!(b.subscribe().await, Err(Error::Offline)));

	let first = b.submit_op(json!([{ "p": ["s", 0], "si": "a" }]), None).expect("first");
	let second = b.submit_op(json!([{ "p": ["s", 1], "si": "b" }]), None).expect("second");
	assert_eq!(b.pending_ops().len(), 2);
	assert_eq!(server.op_count("notes", "n1"), 0);

	let a = alice.create_doc_adapter("notes", "n1").expect("adapter");
	a.subscribe().await.expect("subscribe");
	a.submit_op(json!([{ "p": ["s", 2], "si": "X" }]), None).expect("submit").await.expect("sent").expect("acked");

	bob.set_online(true);
	first.await.expect("sent").expect("first acked");
	second.await.expect("sent").expect("second acked");

	let expected = json!({ "s": "ab--X" });
	assert_eq!(server.snapshot("notes", "n1").and_then(|s| s.data), Some(expected.clone()));
	assert_eq!(server.op_count("notes", "n1"), 3);
	assert_eq!(b.snapshot().data, Some(expected.clone()));
	assert_eq!(b.snapshot().version, 3);
	assert!(b.pending_ops().is_empty());
	assert_eq!(a.snapshot().data, Some(expected));
}

#[tokio::test]
async fn test_concurrent_create_fails_the_late_one() {
	let server = MemoryServer::new();
	let alice = MemoryRemoteStore::connect(&server);
	let bob = MemoryRemoteStore::connect(&server);

	alice.set_online(false);
	let a = alice.create_doc_adapter("widgets", "w1").expect("adapter");
	assert!(a.subscribe().await.is_err());
	let late = a.create(json!({ "owner": "alice" }), OtTypeId::Json0).expect("create");

	let b = bob.create_doc_adapter("widgets", "w1").expect("adapter");
	b.subscribe().await.expect("subscribe");
	b.create(json!({ "owner": "bob" }), OtTypeId::Json0).expect("create").await.expect("sent").expect("acked");

	alice.set_online(true);
	assert!(matches!(late.await.expect("sent"), Err(Error::Conflict(_))));
	assert_eq!(a.snapshot().data, Some(json!({ "owner": "bob" })));
	assert!(a.pending_ops().is_empty());
}

#[tokio::test]
async fn test_query_events_track_membership() {
	let server = MemoryServer::new();
	server.add_snapshots(
		"widgets",
		[
			Snapshot::with_data("a", 0, json!({ "n": 1 }), OtTypeId::Json0),
			Snapshot::with_data("b", 0, json!({ "n": 2 }), OtTypeId::Json0),
		],
	);
	let store = MemoryRemoteStore::connect(&server);
	let params = QueryParameters::new().with_sort("n", true);
	let query = store.create_query_adapter("widgets", &params).expect("query");
	let mut events = query.take_events().expect("events");
	assert!(query.take_events().is_none());

	let mut mirror: Vec<String> = Vec::new();
	let mut apply_pending = |events: &mut tokio::sync::mpsc::UnboundedReceiver<QueryEvent>| {
		let mut seen = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let Some(change) = event.as_list_change() {
				apply_change(&mut mirror, &change).expect("valid change");
			}
			seen.push(event);
		}
		(seen, mirror.clone())
	};

	query.subscribe(Vec::new()).await.expect("subscribe");
	let (seen, ids) = apply_pending(&mut events);
	assert_eq!(seen.last(), Some(&QueryEvent::Ready));
	assert_eq!(ids, ["a", "b"]);
	assert!(query.subscribed());

	let c = store.create_doc_adapter("widgets", "c").expect("adapter");
	c.subscribe().await.expect("subscribe");
	c.create(json!({ "n": 0 }), OtTypeId::Json0).expect("create").await.expect("sent").expect("acked");
	let (seen, ids) = apply_pending(&mut events);
	assert_eq!(seen, vec![QueryEvent::Insert { index: 0, ids: vec!["c".to_string()] }]);
	assert_eq!(ids, ["c", "a", "b"]);

	let a = store.create_doc_adapter("widgets", "a").expect("adapter");
	a.subscribe().await.expect("subscribe");
	a.submit_op(json!([{ "p": ["n"], "na": 9 }]), None).expect("submit").await.expect("sent").expect("acked");
	let (_, ids) = apply_pending(&mut events);
	assert_eq!(ids, ["c", "b", "a"]);
	assert_eq!(query.doc_ids(), ids);

	c.delete().expect("delete").await.expect("sent").expect("acked");
	let (seen, ids) = apply_pending(&mut events);
	assert_eq!(seen, vec![QueryEvent::Remove { index: 0, ids: vec!["c".to_string()] }]);
	assert_eq!(ids, ["b", "a"]);
	assert_eq!(query.count(), 2);
}

#[tokio::test]
async fn test_windowed_query_counts() {
	let server = MemoryServer::new();
	server.add_snapshots(
		"widgets",
		(0..5).map(|n| Snapshot::with_data(format!("w{}", n), 0, json!({ "n": n }), OtTypeId::Json0)),
	);
	let store = MemoryRemoteStore::connect(&server);
	let params = QueryParameters::new().with_sort("n", false).with_limit(2);
	let query = store.create_query_adapter("widgets", &params).expect("query");
	query.fetch().await.expect("fetch");
	assert!(query.ready());
	assert_eq!(query.doc_ids(), ["w4", "w3"]);
	assert_eq!(query.count(), 2);
	assert_eq!(query.unpaged_count(), 5);
}

#[tokio::test]
async fn test_offline_calls_report_offline() {
	let store = MemoryRemoteStore::new();
	store.add_snapshots("widgets", [Snapshot::with_data("a", 0, json!({}), OtTypeId::Json0)]);
	let doc = store.create_doc_adapter("widgets", "a").expect("adapter");
	assert!(doc.exists().await.expect("online"));
	let missing = store.create_doc_adapter("widgets", "zz").expect("adapter");
	assert!(!missing.exists().await.expect("online"));

	let state = store.connection_state();
	store.set_online(false);
	assert!(state.has_changed().expect("sender alive"));
	assert!(!store.is_online());
	assert!(matches!(doc.exists().await, Err(Error::Offline)));
	assert!(matches!(doc.fetch().await, Err(Error::Offline)));
	let query = store.create_query_adapter("widgets", &QueryParameters::new()).expect("query");
	assert!(matches!(query.fetch().await, Err(Error::Offline)));
	assert!(!doc.subscribed());
}

#[tokio::test]
async fn test_invalid_doc_id() {
	let store = MemoryRemoteStore::new();
	assert!(matches!(store.create_doc_adapter("widgets", "a/b"), Err(Error::InvalidDocId { .. })));
	assert!(matches!(store.create_doc_adapter("widgets", ""), Err(Error::InvalidDocId { .. })));
}

#[tokio::test]
async fn test_restored_ops_keep_acks_paired() {
	let server = MemoryServer::new();
	server.add_snapshots("widgets", [Snapshot::with_data("w1", 0, json!({ "n": 0, "s": "text" }), OtTypeId::Json0)]);
	let remote = MemoryRemoteStore::connect(&server);
	let a = remote.create_doc_adapter("widgets", "w1").expect("adapter");
	// the server refuses the restored op: "s" is not a number
	a.restore(OfflineRecord::new(
		Snapshot::with_data("w1", 0, json!({ "n": 0, "s": "text" }), OtTypeId::Json0),
		vec![PendingOp::Op(json!([{ "p": ["s"], "na": 1 }]))],
	));

	let ack = a.submit_op(json!([{ "p": ["n"], "na": 1 }]), None).expect("submit");
	ack.await.expect("ack sent").expect("acked");
	assert!(a.pending_ops().is_empty());
	assert_eq!(server.snapshot("widgets", "w1").and_then(|s| s.data), Some(json!({ "n": 1, "s": "text" })));
}
