//! Durable FIFO queue kept in the offline store
//!
//! Entries are plain records keyed by a zero-padded sequence number, so the
//! id order of the store is the enqueue order. Consumers look at the front,
//! run it and only then pop it; a failed entry stays in front.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use rtsync_types::offline_store::OfflineStore;
use rtsync_types::types::OfflineRecord;

use crate::prelude::*;

const SEQ_WIDTH: usize = 20;

fn seq_id(seq: u64) -> String {
	format!("{:0width$}", seq, width = SEQ_WIDTH)
}

pub struct WorkQueue<T> {
	store: Arc<dyn OfflineStore>,
	collection: String,
	next_seq: Mutex<u64>,
	_entry: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for WorkQueue<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WorkQueue").field("collection", &self.collection).finish_non_exhaustive()
	}
}

impl<T: Serialize + DeserializeOwned> WorkQueue<T> {
	/// Open the queue stored in `collection`, creating it if needed
	pub async fn open(store: Arc<dyn OfflineStore>, collection: &str) -> RtResult<Self> {
		store.register_collection(collection, &[]).await?;
		let last = store.get_all_ids(collection).await?.iter().filter_map(|id| id.parse::<u64>().ok()).max();
		let next_seq = last.map_or(0, |seq| seq + 1);
		debug!("work queue {}: opened, next seq {}", collection, next_seq);
		Ok(Self { store, collection: collection.to_string(), next_seq: Mutex::new(next_seq), _entry: PhantomData })
	}

	/// Append an entry, returns its sequence number
	pub async fn push(&self, entry: &T) -> RtResult<u64> {
		let seq = {
			let mut next = self.next_seq.lock();
			let seq = *next;
			*next += 1;
			seq
		};
		let record = OfflineRecord::plain(seq_id(seq), serde_json::to_value(entry)?);
		self.store.put(&self.collection, &record).await?;
		Ok(seq)
	}

	pub async fn entries(&self) -> RtResult<Vec<(u64, T)>> {
		let records = self.store.get_all(&self.collection).await?;
		let mut entries = Vec::with_capacity(records.len());
		for record in records {
			let Ok(seq) = record.id().parse::<u64>() else {
				warn!("work queue {}: ignoring foreign record {}", self.collection, record.id());
				continue;
			};
			let data = record.snapshot.data.unwrap_or_default();
			entries.push((seq, serde_json::from_value(data)?));
		}
		Ok(entries)
	}

	/// Oldest entry, left in place
	pub async fn front(&self) -> RtResult<Option<(u64, T)>> {
		Ok(self.entries().await?.into_iter().next())
	}

	pub async fn pop_front(&self) -> RtResult<Option<T>> {
		let Some((seq, entry)) = self.front().await? else {
			return Ok(None);
		};
		self.remove(seq).await?;
		Ok(Some(entry))
	}

	pub async fn remove(&self, seq: u64) -> RtResult<()> {
		self.store.delete(&self.collection, &seq_id(seq)).await
	}

	/// Drop every entry matching `pred`, returns how many went
	pub async fn remove_where(&self, pred: impl Fn(&T) -> bool) -> RtResult<usize> {
		let mut removed = 0;
		for (seq, entry) in self.entries().await? {
			if pred(&entry) {
				self.remove(seq).await?;
				removed += 1;
			}
		}
		Ok(removed)
	}

	pub async fn len(&self) -> RtResult<usize> {
		Ok(self.store.get_all_ids(&self.collection).await?.len())
	}

	pub async fn is_empty(&self) -> RtResult<bool> {
		Ok(self.len().await? == 0)
	}
}


// vim: ts=4
