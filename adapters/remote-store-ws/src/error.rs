use rtsync::error::Error as RtError;
use std::fmt;
use tokio_tungstenite::tungstenite;

/// Internal error type for the WebSocket transport
#[derive(Debug)]
pub enum Error {
	WsError(String),
	JsonError(String),
	/// Unexpected or malformed server message
	Protocol(String),
	/// The server refused the handshake
	Handshake(String),
	Closed,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::WsError(msg) => write!(f, "websocket error: {}", msg),
			Error::JsonError(msg) => write!(f, "json error: {}", msg),
			Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
			Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
			Error::Closed => write!(f, "connection closed"),
		}
	}
}

impl std::error::Error for Error {}

impl From<tungstenite::Error> for Error {
	fn from(e: tungstenite::Error) -> Self {
		match e {
			tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Error::Closed,
			e => Error::WsError(e.to_string()),
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::JsonError(e.to_string())
	}
}

impl From<Error> for RtError {
	fn from(e: Error) -> Self {
		match e {
			Error::JsonError(msg) => RtError::Serialization(msg),
			Error::Closed => RtError::Offline,
			e => RtError::Transport(e.to_string()),
		}
	}
}

// vim: ts=4
