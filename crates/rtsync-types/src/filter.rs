//! Filter criteria and their evaluation against snapshots
//!
//! Field paths use dot notation into the snapshot `data`; `_id` addresses the
//! snapshot id. Arrays met on the way are traversed element-wise, and array
//! values match a condition when any element does, the way document
//! databases evaluate filters.

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::prelude::*;
use crate::types::Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldPath {
	Id,
	Data(Vec<String>),
}

impl FieldPath {
	pub fn parse(path: &str) -> Self {
		if path == "_id" {
			FieldPath::Id
		} else {
			FieldPath::Data(path.split('.').map(str::to_string).collect())
		}
	}

	/// All values addressed by the path, arrays expanded on intermediate steps
	pub fn resolve<'a>(&self, snapshot: &'a Snapshot, id: &'a Value) -> Vec<&'a Value> {
		match self {
			FieldPath::Id => vec![id],
			FieldPath::Data(segments) => {
				let mut out = Vec::new();
				if let Some(data) = &snapshot.data {
					resolve_in(data, segments, &mut out);
				}
				out
			}
		}
	}
}

fn resolve_in<'a>(value: &'a Value, segments: &[String], out: &mut Vec<&'a Value>) {
	let Some((head, rest)) = segments.split_first() else {
		out.push(value);
		return;
	};
	match value {
		Value::Object(map) => {
			if let Some(child) = map.get(head) {
				resolve_in(child, rest, out);
			}
		}
		Value::Array(items) => {
			if let Ok(idx) = head.parse::<usize>() {
				if let Some(child) = items.get(idx) {
					resolve_in(child, rest, out);
				}
			} else {
				for item in items {
					resolve_in(item, segments, out);
				}
			}
		}
		_ => {}
	}
}

#[derive(Debug, Clone)]
pub enum Condition {
	Eq(Value),
	Ne(Value),
	Gt(Value),
	Gte(Value),
	Lt(Value),
	Lte(Value),
	In(Vec<Value>),
	Nin(Vec<Value>),
	Regex(Regex),
	Exists(bool),
	Size(usize),
	All(Vec<Value>),
	ElemMatch(Box<ElemMatch>),
	Not(Box<Condition>),
	And(Vec<Condition>),
}

#[derive(Debug, Clone)]
pub enum ElemMatch {
	/// Operator conditions applied to each element (`{$gt: 3}`)
	Value(Condition),
	/// Sub-filter applied to object elements (`{qty: {$gt: 3}}`)
	Document(Criteria),
}

#[derive(Debug, Clone)]
pub enum Criteria {
	And(Vec<Criteria>),
	Or(Vec<Criteria>),
	Nor(Vec<Criteria>),
	Field(FieldPath, Condition),
}

fn bad(msg: impl Into<String>) -> Error {
	Error::InvalidQuery(msg.into())
}

fn is_operator_object(value: &Value) -> bool {
	match value {
		Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
		_ => false,
	}
}

fn value_list(op: &str, value: &Value) -> RtResult<Vec<Value>> {
	match value {
		Value::Array(items) => Ok(items.clone()),
		_ => Err(bad(format!("{} needs an array", op))),
	}
}

fn build_regex(pattern: &str, options: &str) -> RtResult<Regex> {
	let mut builder = RegexBuilder::new(pattern);
	for flag in options.chars() {
		match flag {
			'i' => builder.case_insensitive(true),
			'm' => builder.multi_line(true),
			's' => builder.dot_matches_new_line(true),
			'x' => builder.ignore_whitespace(true),
			other => return Err(bad(format!("unsupported regex option '{}'", other))),
		};
	}
	Ok(builder.build()?)
}

/// Parse the right-hand side of a field clause
pub fn parse_condition(value: &Value) -> RtResult<Condition> {
	let Value::Object(ops) = value else {
		return Ok(Condition::Eq(value.clone()));
	};
	if !is_operator_object(value) {
		return Ok(Condition::Eq(value.clone()));
	}
	let mut conditions = Vec::with_capacity(ops.len());
	for (op, arg) in ops {
		let condition = match op.as_str() {
			"$eq" => Condition::Eq(arg.clone()),
			"$ne" => Condition::Ne(arg.clone()),
			"$gt" => Condition::Gt(arg.clone()),
			"$gte" => Condition::Gte(arg.clone()),
			"$lt" => Condition::Lt(arg.clone()),
			"$lte" => Condition::Lte(arg.clone()),
			"$in" => Condition::In(value_list(op, arg)?),
			"$nin" => Condition::Nin(value_list(op, arg)?),
			"$all" => Condition::All(value_list(op, arg)?),
			"$exists" => Condition::Exists(arg.as_bool().unwrap_or(!arg.is_null())),
			"$size" => Condition::Size(
				arg.as_u64()
					.and_then(|n| usize::try_from(n).ok())
					.ok_or_else(|| bad("$size needs a non-negative integer"))?,
			),
			"$regex" => {
				let pattern = arg.as_str().ok_or_else(|| bad("$regex needs a string"))?;
				let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
				Condition::Regex(build_regex(pattern, options)?)
			}
			"$options" => {
				if !ops.contains_key("$regex") {
					return Err(bad("$options without $regex"));
				}
				continue;
			}
			"$elemMatch" => {
				let elem = if is_operator_object(arg) {
					ElemMatch::Value(parse_condition(arg)?)
				} else {
					let map = arg.as_object().ok_or_else(|| bad("$elemMatch needs an object"))?;
					ElemMatch::Document(parse_criteria(map)?)
				};
				Condition::ElemMatch(Box::new(elem))
			}
			"$not" => Condition::Not(Box::new(match arg {
				Value::String(pattern) => Condition::Regex(build_regex(pattern, "")?),
				_ if is_operator_object(arg) => parse_condition(arg)?,
				_ => return Err(bad("$not needs an operator object")),
			})),
			other => return Err(bad(format!("unknown operator '{}'", other))),
		};
		conditions.push(condition);
	}
	Ok(if conditions.len() == 1 { conditions.remove(0) } else { Condition::And(conditions) })
}

fn parse_criteria_list(op: &str, value: &Value) -> RtResult<Vec<Criteria>> {
	let items = value.as_array().ok_or_else(|| bad(format!("{} needs an array", op)))?;
	if items.is_empty() {
		return Err(bad(format!("{} needs a non-empty array", op)));
	}
	items
		.iter()
		.map(|item| {
			item.as_object()
				.ok_or_else(|| bad(format!("{} entries must be objects", op)))
				.and_then(parse_criteria)
		})
		.collect()
}

/// Parse a filter object. Keys starting with `$` other than the logical
/// combinators are not allowed here.
pub fn parse_criteria(map: &Map<String, Value>) -> RtResult<Criteria> {
	let mut parts = Vec::with_capacity(map.len());
	for (key, value) in map {
		let part = match key.as_str() {
			"$and" => Criteria::And(parse_criteria_list(key, value)?),
			"$or" => Criteria::Or(parse_criteria_list(key, value)?),
			"$nor" => Criteria::Nor(parse_criteria_list(key, value)?),
			k if k.starts_with('$') => return Err(bad(format!("unknown top level operator '{}'", k))),
			path => Criteria::Field(FieldPath::parse(path), parse_condition(value)?),
		};
		parts.push(part);
	}
	Ok(Criteria::And(parts))
}

// Evaluation
//************

/// Equality with numbers compared by value (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
		(Value::Array(x), Value::Array(y)) => {
			x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
		}
		(Value::Object(x), Value::Object(y)) => {
			x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
		}
		_ => a == b,
	}
}

fn type_rank(value: Option<&Value>) -> u8 {
	match value {
		None | Some(Value::Null) => 0,
		Some(Value::Number(_)) => 1,
		Some(Value::String(_)) => 2,
		Some(Value::Object(_)) => 3,
		Some(Value::Array(_)) => 4,
		Some(Value::Bool(_)) => 5,
	}
}

/// Total order used for sorting: null/missing < numbers < strings < objects
/// < arrays < booleans, values of the same type compared naturally.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	let (ra, rb) = (type_rank(a), type_rank(b));
	if ra != rb {
		return ra.cmp(&rb);
	}
	match (a, b) {
		(Some(Value::Number(x)), Some(Value::Number(y))) => {
			let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
			x.partial_cmp(&y).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
		(Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
		(Some(Value::Array(x)), Some(Value::Array(y))) => {
			for (a, b) in x.iter().zip(y) {
				let ord = compare_values(Some(a), Some(b));
				if ord != Ordering::Equal {
					return ord;
				}
			}
			x.len().cmp(&y.len())
		}
		(Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => x.to_string().cmp(&y.to_string()),
		_ => Ordering::Equal,
	}
}

/// Candidate values plus the elements of array candidates
fn with_elements<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
	let mut out = Vec::with_capacity(candidates.len());
	for value in candidates {
		out.push(*value);
		if let Value::Array(items) = value {
			out.extend(items.iter());
		}
	}
	out
}

fn eq_matches(candidates: &[&Value], expected: &Value) -> bool {
	if expected.is_null() && (candidates.is_empty() || candidates.iter().all(|v| v.is_null())) {
		return true;
	}
	with_elements(candidates).iter().any(|v| values_equal(v, expected))
}

fn cmp_matches(candidates: &[&Value], bound: &Value, accept: fn(Ordering) -> bool) -> bool {
	if bound.is_null() && candidates.is_empty() {
		return accept(Ordering::Equal);
	}
	with_elements(candidates)
		.into_iter()
		.filter(|v| type_rank(Some(*v)) == type_rank(Some(bound)))
		.any(|v| accept(compare_values(Some(v), Some(bound))))
}

impl Condition {
	pub fn matches(&self, candidates: &[&Value]) -> bool {
		match self {
			Condition::Eq(v) => eq_matches(candidates, v),
			Condition::Ne(v) => !eq_matches(candidates, v),
			Condition::Gt(v) => cmp_matches(candidates, v, |o| o == Ordering::Greater),
			Condition::Gte(v) => cmp_matches(candidates, v, |o| o != Ordering::Less),
			Condition::Lt(v) => cmp_matches(candidates, v, |o| o == Ordering::Less),
			Condition::Lte(v) => cmp_matches(candidates, v, |o| o != Ordering::Greater),
			Condition::In(list) => list.iter().any(|v| eq_matches(candidates, v)),
			Condition::Nin(list) => !list.iter().any(|v| eq_matches(candidates, v)),
			Condition::Regex(re) => {
				with_elements(candidates).iter().any(|v| v.as_str().is_some_and(|s| re.is_match(s)))
			}
			Condition::Exists(expected) => candidates.is_empty() != *expected,
			Condition::Size(n) => candidates.iter().any(|v| v.as_array().is_some_and(|a| a.len() == *n)),
			Condition::All(list) => {
				!list.is_empty()
					&& candidates.iter().any(|v| {
						v.as_array()
							.is_some_and(|items| list.iter().all(|x| items.iter().any(|i| values_equal(i, x))))
					})
			}
			Condition::ElemMatch(elem) => candidates.iter().any(|v| {
				v.as_array().is_some_and(|items| items.iter().any(|item| elem.matches_element(item)))
			}),
			Condition::Not(inner) => !inner.matches(candidates),
			Condition::And(all) => all.iter().all(|c| c.matches(candidates)),
		}
	}
}

impl ElemMatch {
	fn matches_element(&self, item: &Value) -> bool {
		match self {
			ElemMatch::Value(condition) => condition.matches(&[item]),
			ElemMatch::Document(criteria) => {
				if !item.is_object() {
					return false;
				}
				// evaluate the sub-filter against the element as if it were a document
				let snapshot = Snapshot { id: String::new(), version: 0, data: Some(item.clone()), ot_type: None };
				criteria.matches(&snapshot)
			}
		}
	}
}

impl Criteria {
	pub fn matches(&self, snapshot: &Snapshot) -> bool {
		let id = Value::String(snapshot.id.clone());
		self.matches_with_id(snapshot, &id)
	}

	fn matches_with_id(&self, snapshot: &Snapshot, id: &Value) -> bool {
		match self {
			Criteria::And(parts) => parts.iter().all(|c| c.matches_with_id(snapshot, id)),
			Criteria::Or(parts) => parts.iter().any(|c| c.matches_with_id(snapshot, id)),
			Criteria::Nor(parts) => !parts.iter().any(|c| c.matches_with_id(snapshot, id)),
			Criteria::Field(path, condition) => condition.matches(&path.resolve(snapshot, id)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ot::OtTypeId;
	use serde_json::json;

	fn snap(id: &str, data: Value) -> Snapshot {
		Snapshot::with_data(id, 1, data, OtTypeId::Json0)
	}

	fn filter(value: Value) -> Criteria {
		parse_criteria(value.as_object().expect("object")).expect("parse")
	}

	#[test]
	fn test_equality_and_paths() {
		let doc = snap("q1", json!({ "projectRef": "p1", "answers": [{ "ownerRef": "u1" }, { "ownerRef": "u2" }] }));
		assert!(filter(json!({ "projectRef": "p1" })).matches(&doc));
		assert!(!filter(json!({ "projectRef": "p2" })).matches(&doc));
		assert!(filter(json!({ "answers.ownerRef": "u2" })).matches(&doc));
		assert!(filter(json!({ "answers.1.ownerRef": "u2" })).matches(&doc));
		assert!(filter(json!({ "_id": "q1" })).matches(&doc));
		assert!(filter(json!({ "missing": null })).matches(&doc));
	}

	#[test]
	fn test_comparison_operators() {
		let doc = snap("a", json!({ "n": 3, "name": "Bob", "tags": ["x", "y"] }));
		assert!(filter(json!({ "n": { "$gt": 2, "$lte": 3 } })).matches(&doc));
		assert!(!filter(json!({ "n": { "$lt": 3 } })).matches(&doc));
		assert!(!filter(json!({ "n": { "$gt": "2" } })).matches(&doc));
		assert!(filter(json!({ "n": { "$in": [1, 3.0] } })).matches(&doc));
		assert!(filter(json!({ "n": { "$nin": [1, 2] } })).matches(&doc));
		assert!(filter(json!({ "n": { "$ne": 4 } })).matches(&doc));
		assert!(filter(json!({ "tags": "y" })).matches(&doc));
		assert!(filter(json!({ "tags": { "$size": 2, "$all": ["y", "x"] } })).matches(&doc));
		assert!(filter(json!({ "name": { "$regex": "^bo", "$options": "i" } })).matches(&doc));
		assert!(filter(json!({ "name": { "$not": { "$regex": "^Al" } } })).matches(&doc));
		assert!(filter(json!({ "other": { "$exists": false } })).matches(&doc));
	}

	#[test]
	fn test_logical_combinators() {
		let doc = snap("a", json!({ "n": 3, "deleted": false }));
		assert!(filter(json!({ "$or": [{ "n": 1 }, { "n": 3 }] })).matches(&doc));
		assert!(filter(json!({ "$and": [{ "n": 3 }, { "deleted": false }] })).matches(&doc));
		assert!(!filter(json!({ "$nor": [{ "n": 3 }] })).matches(&doc));
	}

	#[test]
	fn test_elem_match() {
		let doc = snap("a", json!({ "items": [{ "qty": 1, "sku": "a" }, { "qty": 5, "sku": "b" }], "nums": [1, 8] }));
		assert!(filter(json!({ "items": { "$elemMatch": { "qty": { "$gt": 3 }, "sku": "b" } } })).matches(&doc));
		assert!(!filter(json!({ "items": { "$elemMatch": { "qty": { "$gt": 3 }, "sku": "a" } } })).matches(&doc));
		assert!(filter(json!({ "nums": { "$elemMatch": { "$gt": 5, "$lt": 10 } } })).matches(&doc));
	}

	#[test]
	fn test_invalid_filters() {
		assert!(parse_criteria(json!({ "$where": "x" }).as_object().expect("object")).is_err());
		assert!(parse_criteria(json!({ "n": { "$near": 1 } }).as_object().expect("object")).is_err());
		assert!(parse_criteria(json!({ "$or": [] }).as_object().expect("object")).is_err());
		assert!(parse_criteria(json!({ "s": { "$regex": "(" } }).as_object().expect("object")).is_err());
	}

	#[test]
	fn test_compare_values_type_order() {
		let (null, one, s, arr, t) = (json!(null), json!(1), json!("a"), json!([1]), json!(true));
		assert_eq!(compare_values(None, Some(&null)), Ordering::Equal);
		assert_eq!(compare_values(Some(&null), Some(&one)), Ordering::Less);
		assert_eq!(compare_values(Some(&one), Some(&s)), Ordering::Less);
		assert_eq!(compare_values(Some(&s), Some(&arr)), Ordering::Less);
		assert_eq!(compare_values(Some(&arr), Some(&t)), Ordering::Less);
		assert_eq!(compare_values(Some(&json!(2.5)), Some(&json!(10))), Ordering::Less);
	}
}

// vim: ts=4
