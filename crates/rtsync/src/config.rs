//! Engine configuration

/// Realtime service configuration
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
	/// Capacity of the change channels of documents and queries
	pub broadcast_capacity: usize,
	/// Warn when this many query events are waiting to be applied
	pub query_event_warn_threshold: usize,
}

impl Default for RealtimeConfig {
	fn default() -> Self {
		Self { broadcast_capacity: 128, query_event_warn_threshold: 1024 }
	}
}

// vim: ts=4
