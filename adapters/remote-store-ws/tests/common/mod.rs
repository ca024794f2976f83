//! In-test OT server speaking the WebSocket protocol

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use rtsync::list_diff::diff_ids;
use rtsync::ot::Side;
use rtsync::query::{perform_query, QueryParameters, QueryResultSet};
use rtsync::remote_store::RemoteStore;
use rtsync::types::{ConnectionState, PendingOp, Snapshot};
use rtsync_remote_store_ws::protocol::{self, ClientMessage, OpMessage, RemoteError, Reply, ServerMessage};
use rtsync_remote_store_ws::{WsConfig, WsRemoteStore};

struct Logged {
	op: PendingOp,
	src: String,
	seq: u64,
}

struct Doc {
	snapshot: Snapshot,
	log_start: u64,
	log: Vec<Logged>,
}

impl Doc {
	fn new(id: &str) -> Self {
		Self { snapshot: Snapshot::new(id), log_start: 0, log: Vec::new() }
	}

	fn applied_version(&self, src: &str, seq: u64) -> Option<u64> {
		self.log.iter().position(|l| l.src == src && l.seq == seq).map(|i| self.log_start + i as u64)
	}

	fn since(&self, version: u64) -> Option<&[Logged]> {
		if version < self.log_start || version > self.snapshot.version {
			return None;
		}
		self.log.get(usize::try_from(version - self.log_start).ok()?..)
	}

	fn commit(&mut self, version: u64, op: PendingOp, src: &str, seq: u64) -> Result<PendingOp, RemoteError> {
		let conflict = |message: &str| RemoteError { code: 409, message: message.to_string() };
		let mut op = op;
		for logged in self.since(version).ok_or_else(|| conflict("version outside history"))? {
			op = match (op, &logged.op) {
				(PendingOp::Op(op), PendingOp::Op(other)) => {
					let ot_type = self.snapshot.ot_type.ok_or_else(|| conflict("document deleted"))?;
					PendingOp::Op(ot_type.transform(&op, other, Side::Left).map_err(|e| conflict(&e.to_string()))?)
				}
				(PendingOp::Op(_), _) => return Err(conflict("created or deleted concurrently")),
				(op, _) => op,
			};
		}
		match &op {
			PendingOp::Create { ot_type, data } => {
				if self.snapshot.exists() {
					return Err(conflict("document already exists"));
				}
				self.snapshot.data = Some(ot_type.create(Some(data.clone())).map_err(|e| conflict(&e.to_string()))?);
				self.snapshot.ot_type = Some(*ot_type);
			}
			PendingOp::Op(inner) => {
				let (Some(ot_type), Some(data)) = (self.snapshot.ot_type, self.snapshot.data.as_ref()) else {
					return Err(conflict("document does not exist"));
				};
				self.snapshot.data = Some(ot_type.apply(data, inner).map_err(|e| conflict(&e.to_string()))?);
			}
			PendingOp::Del => {
				if !self.snapshot.exists() {
					return Err(conflict("document does not exist"));
				}
				self.snapshot.data = None;
				self.snapshot.ot_type = None;
			}
		}
		self.log.push(Logged { op: op.clone(), src: src.to_string(), seq });
		self.snapshot.version += 1;
		Ok(op)
	}
}

struct Query {
	collection: String,
	params: QueryParameters,
	ids: Vec<String>,
	count: usize,
}

struct Conn {
	src: String,
	tx: mpsc::UnboundedSender<Message>,
	cancel: CancellationToken,
	subs: HashSet<(String, String)>,
	queries: HashMap<u64, Query>,
}

impl Conn {
	fn send(&self, msg: &ServerMessage) {
		let _ = self.tx.send(protocol::to_ws_message(msg).expect("serialize"));
	}
}

#[derive(Default)]
struct State {
	docs: BTreeMap<(String, String), Doc>,
	conns: HashMap<u64, Conn>,
	next_conn: u64,
	drop_next_ack: bool,
}

fn evaluate(docs: &BTreeMap<(String, String), Doc>, collection: &str, params: &QueryParameters) -> (Vec<String>, usize) {
	let snapshots: Vec<Snapshot> =
		docs.iter().filter(|((c, _), _)| c == collection).map(|(_, doc)| doc.snapshot.clone()).collect();
	let results = perform_query(params, &snapshots).expect("valid query");
	match results.results {
		QueryResultSet::Docs(docs) => {
			let count = docs.len();
			(docs.into_iter().map(|s| s.id).collect(), count)
		}
		QueryResultSet::Count(n) => (Vec::new(), n),
	}
}

fn count_extra(params: &QueryParameters, count: usize) -> Option<u64> {
	params.is_count().then_some(count as u64)
}

impl State {
	fn handle(&mut self, conn_id: u64, msg: ClientMessage) {
		match msg {
			ClientMessage::Handshake { src } => {
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.src = src;
					conn.send(&ServerMessage::Handshake { error: None });
				}
			}
			ClientMessage::Fetch { r, c, d } => {
				let data = self.docs.get(&(c, d.clone())).map_or_else(|| Snapshot::new(d), |doc| doc.snapshot.clone());
				self.reply(conn_id, ServerMessage::Fetch(Reply { r, data: Some(data), ..Reply::default() }));
			}
			ClientMessage::Subscribe { r, c, d, v } => {
				let key = (c.clone(), d.clone());
				let Some(conn) = self.conns.get_mut(&conn_id) else { return };
				conn.subs.insert(key.clone());
				let doc = self.docs.get(&key);
				let replay = v.and_then(|v| doc.and_then(|doc| doc.since(v).map(|ops| (v, ops))));
				match replay {
					Some((v, ops)) => {
						for (i, logged) in ops.iter().enumerate() {
							let msg = OpMessage::new(&c, &d, v + i as u64, &logged.src, logged.seq, &logged.op);
							conn.send(&ServerMessage::Op(msg));
						}
						conn.send(&ServerMessage::Subscribe(Reply { r, ..Reply::default() }));
					}
					None => {
						let data = doc.map_or_else(|| Snapshot::new(d.as_str()), |doc| doc.snapshot.clone());
						conn.send(&ServerMessage::Subscribe(Reply { r, data: Some(data), ..Reply::default() }));
					}
				}
			}
			ClientMessage::Unsubscribe { r, c, d } => {
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.subs.remove(&(c, d));
				}
				self.reply(conn_id, ServerMessage::Unsubscribe(Reply { r, ..Reply::default() }));
			}
			ClientMessage::Op(msg) => self.on_op(conn_id, msg),
			ClientMessage::QueryFetch { r, c, q, .. } => {
				let params = QueryParameters::from_value(q).expect("valid query");
				let (ids, count) = evaluate(&self.docs, &c, &params);
				let extra = count_extra(&params, count);
				self.reply(conn_id, ServerMessage::QueryFetch(Reply { r, ids: Some(ids), extra, ..Reply::default() }));
			}
			ClientMessage::QuerySubscribe { r, id, c, q } => {
				let params = QueryParameters::from_value(q).expect("valid query");
				let (ids, count) = evaluate(&self.docs, &c, &params);
				let extra = count_extra(&params, count);
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.queries.insert(id, Query { collection: c, params, ids: ids.clone(), count });
				}
				self.reply(conn_id, ServerMessage::QuerySubscribe(Reply { r, ids: Some(ids), extra, ..Reply::default() }));
			}
			ClientMessage::QueryUnsubscribe { r, id } => {
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.queries.remove(&id);
				}
				self.reply(conn_id, ServerMessage::QueryUnsubscribe(Reply { r, ..Reply::default() }));
			}
		}
	}

	fn reply(&self, conn_id: u64, msg: ServerMessage) {
		if let Some(conn) = self.conns.get(&conn_id) {
			conn.send(&msg);
		}
	}

	fn on_op(&mut self, conn_id: u64, msg: OpMessage) {
		let key = (msg.c.clone(), msg.d.clone());
		let doc = self.docs.entry(key.clone()).or_insert_with(|| Doc::new(&msg.d));

		if let Some(applied) = doc.applied_version(&msg.src, msg.seq) {
			let ack = OpMessage { v: applied, op: None, create: None, del: false, ..msg };
			self.reply(conn_id, ServerMessage::Op(ack));
			return;
		}
		let applied = doc.snapshot.version;
		let Some(op) = msg.pending_op() else { return };
		match doc.commit(msg.v, op, &msg.src, msg.seq) {
			Ok(op) => {
				let out = ServerMessage::Op(OpMessage::new(&msg.c, &msg.d, applied, &msg.src, msg.seq, &op));
				let drop_ack = std::mem::take(&mut self.drop_next_ack);
				for (id, conn) in &self.conns {
					if *id == conn_id {
						if drop_ack {
							conn.cancel.cancel();
						} else {
							conn.send(&out);
						}
					} else if conn.subs.contains(&key) {
						conn.send(&out);
					}
				}
				self.refresh_queries(&msg.c);
			}
			Err(error) => {
				let reject = OpMessage { v: applied, op: None, create: None, del: false, error: Some(error), ..msg };
				self.reply(conn_id, ServerMessage::Op(reject));
			}
		}
	}

	fn refresh_queries(&mut self, collection: &str) {
		let State { docs, conns, .. } = self;
		for conn in conns.values_mut() {
			let mut out = Vec::new();
			for (id, query) in conn.queries.iter_mut().filter(|(_, q)| q.collection == collection) {
				let (ids, count) = evaluate(docs, collection, &query.params);
				let diff: Vec<_> = diff_ids(&query.ids, &ids).into_iter().map(Into::into).collect();
				if diff.is_empty() && count == query.count {
					continue;
				}
				query.ids = ids;
				query.count = count;
				out.push(ServerMessage::QueryDiff { id: *id, diff, extra: count_extra(&query.params, count) });
			}
			for msg in out {
				conn.send(&msg);
			}
		}
	}
}

pub struct TestServer {
	pub addr: SocketAddr,
	state: Arc<Mutex<State>>,
	cancel: CancellationToken,
}

impl TestServer {
	pub async fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let state = Arc::new(Mutex::new(State::default()));
		let cancel = CancellationToken::new();

		let (accept_state, accept_cancel) = (state.clone(), cancel.clone());
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = accept_cancel.cancelled() => break,
					accepted = listener.accept() => {
						let Ok((stream, _)) = accepted else { break };
						tokio::spawn(serve(accept_state.clone(), stream, accept_cancel.child_token()));
					}
				}
			}
		});
		Self { addr, state, cancel }
	}

	pub fn config(&self) -> WsConfig {
		WsConfig {
			reconnect_min_delay: Duration::from_millis(20),
			reconnect_max_delay: Duration::from_millis(200),
			request_timeout: Duration::from_secs(2),
			..WsConfig::new(format!("ws://{}", self.addr))
		}
	}

	/// A connected client
	pub async fn client(&self) -> WsRemoteStore {
		let store = WsRemoteStore::connect(self.config());
		wait_online(&store).await;
		store
	}

	pub fn seed(&self, collection: &str, snapshots: impl IntoIterator<Item = Snapshot>) {
		let mut state = self.state.lock();
		for snapshot in snapshots {
			let doc = Doc { log_start: snapshot.version, snapshot, log: Vec::new() };
			state.docs.insert((collection.to_string(), doc.snapshot.id.clone()), doc);
		}
		state.refresh_queries(collection);
	}

	pub fn snapshot(&self, collection: &str, id: &str) -> Option<Snapshot> {
		self.state.lock().docs.get(&(collection.to_string(), id.to_string())).map(|doc| doc.snapshot.clone())
	}

	pub fn op_count(&self, collection: &str, id: &str) -> usize {
		self.state.lock().docs.get(&(collection.to_string(), id.to_string())).map_or(0, |doc| doc.log.len())
	}

	/// Commit the next op but cut the submitter's connection instead of
	/// acknowledging it
	pub fn drop_next_ack(&self) {
		self.state.lock().drop_next_ack = true;
	}

	pub fn drop_connections(&self) {
		for conn in self.state.lock().conns.values() {
			conn.cancel.cancel();
		}
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

async fn serve(state: Arc<Mutex<State>>, stream: TcpStream, cancel: CancellationToken) {
	let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
		return;
	};
	let (mut sink, mut source) = ws.split();
	let (tx, mut rx) = mpsc::unbounded_channel();
	let conn_id = {
		let mut state = state.lock();
		state.next_conn += 1;
		let id = state.next_conn;
		let conn = Conn {
			src: String::new(),
			tx,
			cancel: cancel.clone(),
			subs: HashSet::new(),
			queries: HashMap::new(),
		};
		state.conns.insert(id, conn);
		id
	};

	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			outgoing = rx.recv() => match outgoing {
				Some(msg) => {
					if sink.send(msg).await.is_err() {
						break;
					}
				}
				None => break,
			},
			incoming = source.next() => match incoming {
				Some(Ok(msg)) => {
					if let Ok(Some(msg)) = protocol::from_ws_message::<ClientMessage>(&msg) {
						state.lock().handle(conn_id, msg);
					}
				}
				_ => break,
			},
		}
	}
	state.lock().conns.remove(&conn_id);
}

pub async fn wait_online(store: &WsRemoteStore) {
	let mut state = store.connection_state();
	tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
		.await
		.expect("connected in time")
		.expect("connection task alive");
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	let mut reached = false;
	for _ in 0..300 {
		if condition() {
			reached = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(reached, "condition not reached in time");
}
