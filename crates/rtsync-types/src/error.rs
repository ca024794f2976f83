//! Error type shared by the engine and all store adapters

use std::fmt;

pub type RtResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// No document type is registered for the collection
	UnknownCollection(String),
	/// The remote adapter could not provide a usable document id
	InvalidDocId { collection: String },
	UnknownOtType(String),
	/// Operation could not be applied or is malformed
	InvalidOp(String),
	InvalidQuery(String),

	/// The remote store is not reachable
	Offline,
	Transport(String),
	/// Error reported by the collaboration backend
	Remote { code: i64, message: String },
	Conflict(String),
	Timeout,

	/// The persistent local store refused a write because it is full
	StorageQuota,
	Storage(String),
	Serialization(String),
	Io(std::io::Error),

	NotLoaded,
	AlreadyExists,
	Disposed,
}

impl Error {
	/// Errors that only mean "the remote side is unreachable right now"
	pub fn is_offline(&self) -> bool {
		matches!(self, Error::Offline | Error::Transport(_) | Error::Timeout)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::UnknownCollection(c) => write!(f, "no document type registered for collection '{}'", c),
			Error::InvalidDocId { collection } => {
				write!(f, "adapter did not provide a valid document id in '{}'", collection)
			}
			Error::UnknownOtType(t) => write!(f, "unknown OT type '{}'", t),
			Error::InvalidOp(msg) => write!(f, "invalid operation: {}", msg),
			Error::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
			Error::Offline => write!(f, "remote store is offline"),
			Error::Transport(msg) => write!(f, "transport error: {}", msg),
			Error::Remote { code, message } => write!(f, "remote error {}: {}", code, message),
			Error::Conflict(msg) => write!(f, "version conflict: {}", msg),
			Error::Timeout => write!(f, "request timed out"),
			Error::StorageQuota => write!(f, "local storage quota exceeded"),
			Error::Storage(msg) => write!(f, "storage error: {}", msg),
			Error::Serialization(msg) => write!(f, "serialization error: {}", msg),
			Error::Io(err) => write!(f, "I/O error: {}", err),
			Error::NotLoaded => write!(f, "document is not loaded"),
			Error::AlreadyExists => write!(f, "document already exists"),
			Error::Disposed => write!(f, "object has been disposed"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(err) => Some(err),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

impl From<regex::Error> for Error {
	fn from(err: regex::Error) -> Self {
		Error::InvalidQuery(err.to_string())
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(err: tokio::task::JoinError) -> Self {
		Error::Storage(format!("background task failed: {}", err))
	}
}

// vim: ts=4
