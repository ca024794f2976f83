//! WebSocket Remote Store
//!
//! Production remote store speaking a JSON OT protocol over a single
//! WebSocket connection (see [`protocol`]). The connection is owned by a
//! background task which reconnects with exponential backoff; on every new
//! connection subscribed documents and queries are restored and
//! unacknowledged operations are resent.
//!
//! ```ignore
//! let store = WsRemoteStore::connect(WsConfig::from_env()?);
//! let doc = store.create_doc_adapter("notes", "n1")?;
//! doc.subscribe().await?;
//! ```

#![forbid(unsafe_code)]

mod connection;
mod doc;
pub mod error;
pub mod protocol;
mod query;

use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use doc::WsDocAdapter;
pub use query::WsQueryAdapter;

use rtsync::prelude::*;
use rtsync::query::QueryParameters;
use rtsync::remote_store::{DocAdapter, QueryAdapter, RemoteStore};
use rtsync::types::ConnectionState;
use rtsync::utils;

use crate::connection::Shared;

/// Connection configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
	/// Server endpoint, `ws://` or `wss://`
	pub url: String,
	/// Sent as the `access_token` query parameter
	pub auth_token: Option<String>,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub request_timeout: Duration,
	pub heartbeat_interval: Duration,
	/// Capacity of each document's event channel
	pub broadcast_capacity: usize,
}

impl Default for WsConfig {
	fn default() -> Self {
		Self {
			url: "ws://127.0.0.1:8080/ws/rtsync".to_string(),
			auth_token: None,
			reconnect_min_delay: Duration::from_millis(100),
			reconnect_max_delay: Duration::from_secs(30),
			request_timeout: Duration::from_secs(10),
			heartbeat_interval: Duration::from_secs(30),
			broadcast_capacity: 256,
		}
	}
}

impl WsConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into(), ..Self::default() }
	}

	/// Read `RTSYNC_WS_URL` (required) and `RTSYNC_WS_TOKEN`
	pub fn from_env() -> RtResult<Self> {
		let url = env::var("RTSYNC_WS_URL").map_err(|_| Error::Transport("RTSYNC_WS_URL is not set".into()))?;
		Ok(Self { url, auth_token: env::var("RTSYNC_WS_TOKEN").ok(), ..Self::default() })
	}

	pub fn connect_url(&self) -> String {
		match &self.auth_token {
			Some(token) => {
				let sep = if self.url.contains('?') { '&' } else { '?' };
				format!("{}{}access_token={}", self.url, sep, token)
			}
			None => self.url.clone(),
		}
	}
}

/// Stops the connection task when the last store handle is dropped
#[derive(Debug)]
struct ConnectionTask {
	cancel: CancellationToken,
}

impl Drop for ConnectionTask {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

#[derive(Debug, Clone)]
pub struct WsRemoteStore {
	shared: Arc<Shared>,
	task: Arc<ConnectionTask>,
}

impl WsRemoteStore {
	/// Start the connection task; must be called within a Tokio runtime
	pub fn connect(config: WsConfig) -> Self {
		let shared = Arc::new(Shared::new(config));
		let cancel = CancellationToken::new();
		tokio::spawn(connection::run(shared.clone(), cancel.clone()));
		Self { shared, task: Arc::new(ConnectionTask { cancel }) }
	}

	/// Source tag this client's operations carry
	pub fn source(&self) -> &str {
		&self.shared.src
	}

	/// Close the connection and stop reconnecting
	pub fn shutdown(&self) {
		info!("ws: shutting down remote store");
		self.task.cancel.cancel();
	}
}

impl RemoteStore for WsRemoteStore {
	fn create_doc_adapter(&self, collection: &str, id: &str) -> RtResult<Arc<dyn DocAdapter>> {
		if !utils::is_valid_doc_id(id) {
			return Err(Error::InvalidDocId { collection: collection.to_string() });
		}
		Ok(WsDocAdapter::new(self.shared.clone(), collection, id))
	}

	fn create_query_adapter(&self, collection: &str, params: &QueryParameters) -> RtResult<Arc<dyn QueryAdapter>> {
		params.compile()?;
		Ok(WsQueryAdapter::new(self.shared.clone(), collection, params))
	}

	fn connection_state(&self) -> watch::Receiver<ConnectionState> {
		self.shared.connection_state()
	}

	fn is_online(&self) -> bool {
		self.shared.is_online()
	}
}


// vim: ts=4
