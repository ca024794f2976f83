//! Wire protocol
//!
//! JSON text frames, one message per frame, discriminated by the `a`
//! (action) field:
//!
//! | `a` | direction | meaning |
//! |---|---|---|
//! | `hs` | both | handshake, carries the client's op source tag |
//! | `f` | both | fetch a document snapshot |
//! | `s` / `us` | both | subscribe / unsubscribe a document; with `v` the server replays missed ops before replying |
//! | `op` | both | operation (`op`, `create` or `del`) tagged with `src`/`seq`; the server echoes the tags as acknowledgement |
//! | `qf` / `qs` / `qu` | both | fetch / subscribe / unsubscribe a query |
//! | `q` | server | query result diff |
//!
//! Requests carry a numeric `r` which the reply echoes. Failed requests
//! reply with an `error` object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use rtsync::list_diff::ListChange;
use rtsync::ot::OtTypeId;
use rtsync::types::{PendingOp, Snapshot};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
	pub code: i64,
	pub message: String,
}

impl From<RemoteError> for rtsync::error::Error {
	fn from(e: RemoteError) -> Self {
		rtsync::error::Error::Remote { code: e.code, message: e.message }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
	#[serde(rename = "type")]
	pub ot_type: OtTypeId,
	pub data: Value,
}

/// An operation on one document, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMessage {
	pub c: String,
	pub d: String,
	/// Version the op was submitted against (client) or applied at (server)
	pub v: u64,
	pub src: String,
	pub seq: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub op: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub create: Option<CreateData>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub del: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RemoteError>,
}

impl OpMessage {
	pub fn new(c: &str, d: &str, v: u64, src: &str, seq: u64, op: &PendingOp) -> Self {
		let mut msg = Self {
			c: c.to_string(),
			d: d.to_string(),
			v,
			src: src.to_string(),
			seq,
			op: None,
			create: None,
			del: false,
			error: None,
		};
		match op {
			PendingOp::Op(op) => msg.op = Some(op.clone()),
			PendingOp::Create { ot_type, data } => {
				msg.create = Some(CreateData { ot_type: *ot_type, data: data.clone() });
			}
			PendingOp::Del => msg.del = true,
		}
		msg
	}

	/// The carried operation; `None` for a bare acknowledgement
	pub fn pending_op(&self) -> Option<PendingOp> {
		if let Some(op) = &self.op {
			Some(PendingOp::Op(op.clone()))
		} else if let Some(create) = &self.create {
			Some(PendingOp::Create { ot_type: create.ot_type, data: create.data.clone() })
		} else if self.del {
			Some(PendingOp::Del)
		} else {
			None
		}
	}
}

/// Query result diff entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryDiff {
	Insert { index: usize, ids: Vec<String> },
	Remove { index: usize, ids: Vec<String> },
	Move { from: usize, to: usize, count: usize },
}

impl From<QueryDiff> for ListChange {
	fn from(diff: QueryDiff) -> Self {
		match diff {
			QueryDiff::Insert { index, ids } => ListChange::Insert { index, ids },
			QueryDiff::Remove { index, ids } => ListChange::Remove { index, ids },
			QueryDiff::Move { from, to, count } => ListChange::Move { from, to, count },
		}
	}
}

impl From<ListChange> for QueryDiff {
	fn from(change: ListChange) -> Self {
		match change {
			ListChange::Insert { index, ids } => QueryDiff::Insert { index, ids },
			ListChange::Remove { index, ids } => QueryDiff::Remove { index, ids },
			ListChange::Move { from, to, count } => QueryDiff::Move { from, to, count },
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ClientMessage {
	#[serde(rename = "hs")]
	Handshake { src: String },
	#[serde(rename = "f")]
	Fetch { r: u64, c: String, d: String },
	#[serde(rename = "s")]
	Subscribe {
		r: u64,
		c: String,
		d: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		v: Option<u64>,
	},
	#[serde(rename = "us")]
	Unsubscribe { r: u64, c: String, d: String },
	#[serde(rename = "op")]
	Op(OpMessage),
	#[serde(rename = "qf")]
	QueryFetch { r: u64, id: u64, c: String, q: Value },
	#[serde(rename = "qs")]
	QuerySubscribe { r: u64, id: u64, c: String, q: Value },
	#[serde(rename = "qu")]
	QueryUnsubscribe { r: u64, id: u64 },
}

/// Reply to a request, correlated by `r`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reply {
	pub r: u64,
	/// Document snapshot (`f`, `s` without a usable version)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Snapshot>,
	/// Query result ids (`qf`, `qs`)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ids: Option<Vec<String>>,
	/// Query count (`$count` queries)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extra: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RemoteError>,
}

impl Reply {
	pub fn into_result(self) -> Result<Self, RemoteError> {
		match self.error {
			Some(err) => Err(err),
			None => Ok(self),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ServerMessage {
	#[serde(rename = "hs")]
	Handshake {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<RemoteError>,
	},
	#[serde(rename = "f")]
	Fetch(Reply),
	#[serde(rename = "s")]
	Subscribe(Reply),
	#[serde(rename = "us")]
	Unsubscribe(Reply),
	#[serde(rename = "op")]
	Op(OpMessage),
	#[serde(rename = "qf")]
	QueryFetch(Reply),
	#[serde(rename = "qs")]
	QuerySubscribe(Reply),
	#[serde(rename = "qu")]
	QueryUnsubscribe(Reply),
	#[serde(rename = "q")]
	QueryDiff {
		id: u64,
		diff: Vec<QueryDiff>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		extra: Option<u64>,
	},
}

impl ServerMessage {
	/// The reply of a correlated request
	pub fn into_reply(self) -> Option<Reply> {
		match self {
			ServerMessage::Fetch(reply)
			| ServerMessage::Subscribe(reply)
			| ServerMessage::Unsubscribe(reply)
			| ServerMessage::QueryFetch(reply)
			| ServerMessage::QuerySubscribe(reply)
			| ServerMessage::QueryUnsubscribe(reply) => Some(reply),
			_ => None,
		}
	}
}

/// Serialize to JSON and wrap in a WebSocket message
pub fn to_ws_message<T: Serialize>(msg: &T) -> Result<Message, Error> {
	let json = serde_json::to_string(msg)?;
	Ok(Message::text(json))
}

/// Parse a WebSocket message; control and binary frames yield `None`
pub fn from_ws_message<T: for<'de> Deserialize<'de>>(msg: &Message) -> Result<Option<T>, Error> {
	match msg {
		Message::Text(text) => Ok(Some(serde_json::from_str(text.as_str())?)),
		Message::Close(_) | Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
			Ok(None)
		}
	}
}


// vim: ts=4
