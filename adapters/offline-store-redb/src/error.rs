use rtsync::error::Error as RtError;
use std::fmt;

/// Internal error type for the redb store
#[derive(Debug)]
pub enum Error {
	RedbError(String),
	JsonError(String),
	IoError(std::io::Error),
	InvalidName(String),
	QuotaExceeded,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::RedbError(msg) => write!(f, "redb error: {}", msg),
			Error::JsonError(msg) => write!(f, "json error: {}", msg),
			Error::IoError(e) => write!(f, "io error: {}", e),
			Error::InvalidName(name) => write!(f, "invalid collection name: {}", name),
			Error::QuotaExceeded => write!(f, "record quota exceeded"),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::IoError(e)
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
			Error::IoError(io_err) => RtError::Io(io_err),
			Error::JsonError(msg) => RtError::Serialization(msg),
			Error::QuotaExceeded => RtError::StorageQuota,
			Error::RedbError(msg) => RtError::Storage(msg),
			Error::InvalidName(name) => RtError::Storage(format!("invalid collection name: {}", name)),
		}
	}
}

/// Helper to convert redb errors
pub fn from_redb_error<E: fmt::Display>(err: E) -> Error {
	Error::RedbError(err.to_string())
}

// vim: ts=4
