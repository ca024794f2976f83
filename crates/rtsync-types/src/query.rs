//! Query filter descriptions and the query translator
//!
//! A [`QueryParameters`] is the serializable description sent both to the
//! local store and to the remote backend:
//!
//! ```json
//! { "projectRef": "p1", "n": { "$gte": 2 }, "$sort": { "n": 1 }, "$skip": 10, "$limit": 10 }
//! ```
//!
//! [`perform_query`] evaluates it against an ordered set of snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::filter::{self, Criteria, FieldPath};
use crate::prelude::*;
use crate::types::Snapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParameters(Map<String, Value>);

impl QueryParameters {
	pub fn new() -> Self {
		Self(Map::new())
	}

	pub fn from_value(value: Value) -> RtResult<Self> {
		match value {
			Value::Object(map) => Ok(Self(map)),
			_ => Err(Error::InvalidQuery("query parameters must be an object".into())),
		}
	}

	pub fn as_map(&self) -> &Map<String, Value> {
		&self.0
	}

	pub fn to_value(&self) -> Value {
		Value::Object(self.0.clone())
	}

	pub fn with_filter(mut self, path: &str, condition: Value) -> Self {
		self.0.insert(path.to_string(), condition);
		self
	}

	/// Append a sort key; earlier keys take precedence
	pub fn with_sort(mut self, path: &str, ascending: bool) -> Self {
		let direction = Value::from(if ascending { 1 } else { -1 });
		match self.0.get_mut("$sort") {
			Some(Value::Object(sort)) => {
				sort.insert(path.to_string(), direction);
			}
			_ => {
				self.0.insert("$sort".into(), Value::Object(Map::from_iter([(path.to_string(), direction)])));
			}
		}
		self
	}

	pub fn with_skip(mut self, skip: usize) -> Self {
		self.0.insert("$skip".into(), Value::from(skip));
		self
	}

	pub fn with_limit(mut self, limit: usize) -> Self {
		self.0.insert("$limit".into(), Value::from(limit));
		self
	}

	pub fn with_count(mut self, apply_skip_limit: bool) -> Self {
		self.0.insert("$count".into(), serde_json::json!({ "applySkipLimit": apply_skip_limit }));
		self
	}

	pub fn is_count(&self) -> bool {
		self.0.contains_key("$count")
	}

	pub fn is_windowed(&self) -> bool {
		self.0.contains_key("$skip") || self.0.contains_key("$limit")
	}

	/// Same filter without windowing, counting all matches
	pub fn unpaged_count_parameters(&self) -> Self {
		let mut map = self.0.clone();
		for key in ["$skip", "$limit", "$sort"] {
			map.remove(key);
		}
		Self(map).with_count(false)
	}

	/// Same filter and sort over every match: no window, no `$count`
	pub fn unwindowed(&self) -> Self {
		let mut map = self.0.clone();
		for key in ["$skip", "$limit", "$count"] {
			map.remove(key);
		}
		Self(map)
	}

	/// Query answering whether a single document exists (count is 1)
	pub fn exists_parameters(id: &str) -> Self {
		Self::new().with_filter("_id", Value::String(id.to_string())).with_limit(1).with_count(true)
	}

	pub fn compile(&self) -> RtResult<CompiledQuery> {
		let mut filter = Map::new();
		let mut query = CompiledQuery::default();
		for (key, value) in &self.0 {
			match key.as_str() {
				"$sort" => {
					let sort = value.as_object().ok_or_else(|| bad("$sort must be an object"))?;
					for (path, dir) in sort {
						let ascending = match dir.as_i64() {
							Some(1) => true,
							Some(-1) => false,
							_ => return Err(bad("$sort direction must be 1 or -1")),
						};
						query.sort.push(SortField { field: FieldPath::parse(path), ascending });
					}
				}
				"$skip" => query.skip = Some(window_value(key, value)?),
				"$limit" => query.limit = Some(window_value(key, value)?),
				"$count" => {
					let apply = value.get("applySkipLimit").and_then(Value::as_bool).unwrap_or(false);
					query.count = Some(CountOptions { apply_skip_limit: apply });
				}
				_ => {
					filter.insert(key.clone(), value.clone());
				}
			}
		}
		query.criteria = filter::parse_criteria(&filter)?;
		Ok(query)
	}
}

fn bad(msg: &str) -> Error {
	Error::InvalidQuery(msg.to_string())
}

fn window_value(key: &str, value: &Value) -> RtResult<usize> {
	value
		.as_u64()
		.and_then(|n| usize::try_from(n).ok())
		.ok_or_else(|| Error::InvalidQuery(format!("{} must be a non-negative integer", key)))
}

impl From<Map<String, Value>> for QueryParameters {
	fn from(map: Map<String, Value>) -> Self {
		Self(map)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
	pub field: FieldPath,
	pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountOptions {
	pub apply_skip_limit: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
	pub criteria: Criteria,
	pub sort: Vec<SortField>,
	pub skip: Option<usize>,
	pub limit: Option<usize>,
	pub count: Option<CountOptions>,
}

impl Default for CompiledQuery {
	fn default() -> Self {
		Self { criteria: Criteria::And(Vec::new()), sort: Vec::new(), skip: None, limit: None, count: None }
	}
}

impl CompiledQuery {
	fn window(&self, len: usize) -> std::ops::Range<usize> {
		let start = self.skip.unwrap_or(0).min(len);
		let end = self.limit.map_or(len, |limit| start.saturating_add(limit).min(len));
		start..end
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResultSet<T> {
	Docs(Vec<T>),
	Count(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults<T> {
	pub results: QueryResultSet<T>,
	pub unpaged_count: usize,
}

impl<T> QueryResults<T> {
	/// Number of results: the document count or the `$count` value
	pub fn count(&self) -> usize {
		match &self.results {
			QueryResultSet::Docs(docs) => docs.len(),
			QueryResultSet::Count(n) => *n,
		}
	}

	pub fn into_docs(self) -> Vec<T> {
		match self.results {
			QueryResultSet::Docs(docs) => docs,
			QueryResultSet::Count(_) => Vec::new(),
		}
	}
}

fn compare_snapshots(a: &Snapshot, b: &Snapshot, sort: &[SortField]) -> Ordering {
	let (a_id, b_id) = (Value::String(a.id.clone()), Value::String(b.id.clone()));
	for field in sort {
		let a_val = field.field.resolve(a, &a_id).first().copied();
		let b_val = field.field.resolve(b, &b_id).first().copied();
		let ord = filter::compare_values(a_val, b_val);
		let ord = if field.ascending { ord } else { ord.reverse() };
		if ord != Ordering::Equal {
			return ord;
		}
	}
	Ordering::Equal
}

fn snapshot_of<T: AsRef<Snapshot>>(item: &T) -> &Snapshot {
	item.as_ref()
}

/// Evaluate a query description against snapshots.
///
/// Snapshots without data are skipped. Matching keeps the input order; the
/// sort is a stable pass over the matched set, so ties keep input order.
/// `unpaged_count` is the number of matches ignoring `$skip`/`$limit`.
pub fn perform_query<T>(params: &QueryParameters, snapshots: &[T]) -> RtResult<QueryResults<T>>
where
	T: AsRef<Snapshot> + Clone,
{
	let query = params.compile()?;
	let mut matched: Vec<&T> = snapshots
		.iter()
		.filter(|s| {
			let snapshot = snapshot_of(*s);
			snapshot.data.is_some() && query.criteria.matches(snapshot)
		})
		.collect();
	let unpaged_count = matched.len();

	if let Some(count) = query.count {
		let n = if count.apply_skip_limit { query.window(matched.len()).len() } else { matched.len() };
		return Ok(QueryResults { results: QueryResultSet::Count(n), unpaged_count });
	}

	if !query.sort.is_empty() {
		matched.sort_by(|a, b| compare_snapshots(snapshot_of(*a), snapshot_of(*b), &query.sort));
	}
	let window = query.window(matched.len());
	let docs = matched[window].iter().map(|s| T::clone(s)).collect();
	Ok(QueryResults { results: QueryResultSet::Docs(docs), unpaged_count })
}


// vim: ts=4
