//! Connection management
//!
//! One task owns the socket: it connects, performs the handshake, then
//! multiplexes the outgoing channel, incoming frames and the heartbeat until
//! the socket fails, and reconnects with exponential backoff. Adapters talk
//! to it through [`Shared`]: fire-and-forget sends for ops and correlated
//! requests (`r`) with a timeout for everything else.
//!
//! Incoming messages are dispatched on the connection task itself, so
//! adapter handlers never await.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use rtsync::prelude::*;
use rtsync::types::{ConnectionState, DocKey};

use crate::doc::WsDocAdapter;
use crate::error::Error as WsError;
use crate::protocol::{self, ClientMessage, QueryDiff, Reply, ServerMessage};
use crate::query::WsQueryAdapter;
use crate::WsConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryRole {
	Results,
	UnpagedCount,
}

#[derive(Debug)]
pub(crate) struct Shared {
	pub(crate) config: WsConfig,
	/// Source tag of this client's ops
	pub(crate) src: String,
	state: watch::Sender<ConnectionState>,
	outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
	requests: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
	next_request: AtomicU64,
	next_query: AtomicU64,
	docs: Mutex<HashMap<DocKey, Weak<WsDocAdapter>>>,
	queries: Mutex<HashMap<u64, (Weak<WsQueryAdapter>, QueryRole)>>,
}

impl Shared {
	pub(crate) fn new(config: WsConfig) -> Self {
		let (state, _) = watch::channel(ConnectionState::Disconnected);
		Self {
			config,
			src: rtsync::utils::random_id(),
			state,
			outgoing: Mutex::new(None),
			requests: Mutex::new(HashMap::new()),
			next_request: AtomicU64::new(0),
			next_query: AtomicU64::new(0),
			docs: Mutex::new(HashMap::new()),
			queries: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) fn is_online(&self) -> bool {
		*self.state.borrow() == ConnectionState::Connected
	}

	pub(crate) fn connection_state(&self) -> watch::Receiver<ConnectionState> {
		self.state.subscribe()
	}

	fn set_state(&self, next: ConnectionState) {
		self.state.send_if_modified(|state| {
			let changed = *state != next;
			*state = next;
			changed
		});
	}

	pub(crate) fn next_query_id(&self) -> u64 {
		self.next_query.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Queue a message on the current connection
	pub(crate) fn send(&self, msg: &ClientMessage) -> RtResult<()> {
		let message = protocol::to_ws_message(msg)?;
		let outgoing = self.outgoing.lock();
		let tx = outgoing.as_ref().ok_or(Error::Offline)?;
		tx.send(message).map_err(|_| Error::Offline)
	}

	/// Send a request and wait for its reply
	pub(crate) async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> RtResult<Reply> {
		let r = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, rx) = oneshot::channel();
		self.requests.lock().insert(r, tx);
		if let Err(err) = self.send(&build(r)) {
			self.requests.lock().remove(&r);
			return Err(err);
		}
		match tokio::time::timeout(self.config.request_timeout, rx).await {
			Ok(Ok(reply)) => Ok(reply.into_result()?),
			// connection dropped, pending requests were discarded
			Ok(Err(_)) => Err(Error::Offline),
			Err(_) => {
				self.requests.lock().remove(&r);
				warn!("ws: request {} timed out", r);
				Err(Error::Timeout)
			}
		}
	}

	pub(crate) fn register_doc(&self, key: DocKey, adapter: &Arc<WsDocAdapter>) {
		let mut docs = self.docs.lock();
		docs.retain(|_, d| d.strong_count() > 0);
		docs.insert(key, Arc::downgrade(adapter));
	}

	pub(crate) fn forget_doc(&self, key: &DocKey, adapter: &WsDocAdapter) {
		let mut docs = self.docs.lock();
		if docs.get(key).is_some_and(|d| std::ptr::eq(d.as_ptr(), adapter)) {
			docs.remove(key);
		}
	}

	pub(crate) fn register_query(&self, id: u64, query: &Arc<WsQueryAdapter>, role: QueryRole) {
		let mut queries = self.queries.lock();
		queries.retain(|_, (q, _)| q.strong_count() > 0);
		queries.insert(id, (Arc::downgrade(query), role));
	}

	pub(crate) fn forget_query(&self, id: u64) {
		self.queries.lock().remove(&id);
	}

	fn dispatch(&self, msg: ServerMessage) {
		match msg {
			ServerMessage::Op(op) => {
				let key = DocKey::new(&op.c, &op.d);
				let adapter = self.docs.lock().get(&key).and_then(Weak::upgrade);
				match adapter {
					Some(adapter) => adapter.on_op(op),
					None => trace!("ws: op for untracked doc {}", key),
				}
			}
			ServerMessage::QueryDiff { id, diff, extra } => {
				let query = self.queries.lock().get(&id).and_then(|(q, role)| q.upgrade().map(|q| (q, *role)));
				if let Some((query, role)) = query {
					query.on_diff(role, diff, extra);
				}
			}
			ServerMessage::Handshake { .. } => debug!("ws: unexpected handshake"),
			reply => {
				if let Some(reply) = reply.into_reply() {
					let r = reply.r;
					match self.requests.lock().remove(&r) {
						Some(tx) => {
							let _ = tx.send(reply);
						}
						None => debug!("ws: reply to unknown request {}", r),
					}
				}
			}
		}
	}

	fn on_connected(&self) {
		let docs: Vec<Arc<WsDocAdapter>> = self.docs.lock().values().filter_map(Weak::upgrade).collect();
		let queries: Vec<Arc<WsQueryAdapter>> = self
			.queries
			.lock()
			.values()
			.filter(|(_, role)| *role == QueryRole::Results)
			.filter_map(|(q, _)| q.upgrade())
			.collect();
		if docs.is_empty() && queries.is_empty() {
			return;
		}
		debug!("ws: restoring {} docs and {} queries", docs.len(), queries.len());
		tokio::spawn(async move {
			for doc in docs {
				doc.reconnect().await;
			}
			for query in queries {
				query.reconnect().await;
			}
		});
	}

	fn on_disconnected(&self) {
		*self.outgoing.lock() = None;
		// dropping the senders fails every waiting request with `Offline`
		self.requests.lock().clear();
		let docs: Vec<Arc<WsDocAdapter>> = self.docs.lock().values().filter_map(Weak::upgrade).collect();
		for doc in docs {
			doc.on_disconnect();
		}
		let queries: Vec<Arc<WsQueryAdapter>> =
			self.queries.lock().values().filter_map(|(q, _)| q.upgrade()).collect();
		for query in queries {
			query.on_disconnect();
		}
		self.set_state(ConnectionState::Disconnected);
	}
}

/// Connection loop with reconnection logic
pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
	let min_delay = shared.config.reconnect_min_delay;
	let max_delay = shared.config.reconnect_max_delay;
	let mut delay = min_delay;

	loop {
		shared.set_state(ConnectionState::Connecting);
		debug!("ws: connecting to {}", shared.config.url);
		let connected = tokio::select! {
			() = cancel.cancelled() => break,
			result = connect(&shared) => result,
		};

		match connected {
			Ok(ws) => {
				delay = min_delay;
				let result = tokio::select! {
					() = cancel.cancelled() => {
						shared.on_disconnected();
						break;
					}
					result = serve(&shared, ws) => result,
				};
				match result {
					Ok(()) => info!("ws: connection closed by server"),
					Err(err) => warn!("ws: connection lost: {}", err),
				}
				shared.on_disconnected();
			}
			Err(err) => {
				warn!("ws: failed to connect: {}", err);
				shared.set_state(ConnectionState::Disconnected);
			}
		}

		debug!("ws: reconnecting in {:?}", delay);
		tokio::select! {
			() = cancel.cancelled() => break,
			() = tokio::time::sleep(delay) => {}
		}
		delay = (delay * 2).min(max_delay);
	}

	shared.set_state(ConnectionState::Disconnected);
	debug!("ws: connection task stopped");
}

async fn connect(shared: &Shared) -> Result<WsStream, WsError> {
	let (mut ws, _) = tokio_tungstenite::connect_async(shared.config.connect_url()).await?;
	ws.send(protocol::to_ws_message(&ClientMessage::Handshake { src: shared.src.clone() })?).await?;

	let handshake = async {
		while let Some(msg) = ws.next().await {
			if let Some(ServerMessage::Handshake { error }) = protocol::from_ws_message(&msg?)? {
				return Ok(error);
			}
		}
		Err(WsError::Closed)
	};
	let refused = tokio::time::timeout(shared.config.request_timeout, handshake)
		.await
		.map_err(|_| WsError::Handshake("timed out".into()))??;
	if let Some(err) = refused {
		return Err(WsError::Handshake(err.message));
	}
	Ok(ws)
}

async fn serve(shared: &Arc<Shared>, ws: WsStream) -> Result<(), WsError> {
	let (mut sink, mut stream) = ws.split();
	let (tx, mut rx) = mpsc::unbounded_channel();
	*shared.outgoing.lock() = Some(tx);
	shared.set_state(ConnectionState::Connected);
	info!("ws: connected to {}", shared.config.url);
	shared.on_connected();

	let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
	heartbeat.tick().await;

	loop {
		tokio::select! {
			outgoing = rx.recv() => match outgoing {
				Some(msg) => sink.send(msg).await?,
				None => return Err(WsError::Closed),
			},
			incoming = stream.next() => match incoming {
				Some(Ok(Message::Close(frame))) => {
					debug!("ws: close frame {:?}", frame);
					return Ok(());
				}
				Some(Ok(msg)) => match protocol::from_ws_message::<ServerMessage>(&msg) {
					Ok(Some(msg)) => shared.dispatch(msg),
					Ok(None) => {}
					Err(err) => warn!("ws: ignoring malformed message: {}", err),
				},
				Some(Err(err)) => return Err(err.into()),
				None => return Err(WsError::Closed),
			},
			_ = heartbeat.tick() => {
				sink.send(Message::Ping(Vec::new().into())).await?;
			}
		}
	}
}

/// Apply query diffs to an id list; fails when a diff does not fit the list
pub(crate) fn apply_diffs(ids: &mut Vec<String>, diff: Vec<QueryDiff>) -> RtResult<Vec<rtsync::list_diff::ListChange>> {
	let mut applied = Vec::with_capacity(diff.len());
	for entry in diff {
		let change = entry.into();
		rtsync::list_diff::apply_change(ids, &change)?;
		applied.push(change);
	}
	Ok(applied)
}

// vim: ts=4
