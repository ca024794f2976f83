//! Rich text OT type (Quill delta)
//!
//! Documents and operations are both deltas: `{"ops": [...]}` where each op is
//! `{"insert": text|embed}`, `{"retain": n}` or `{"delete": n}`, optionally with
//! `attributes`. Lengths are counted in UTF-16 code units.

use serde_json::{Map, Value};

use super::Side;
use crate::prelude::*;

type Attributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Insert {
	Text(Vec<u16>),
	Embed(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum DeltaOp {
	Insert(Insert, Option<Attributes>),
	Retain(usize, Option<Attributes>),
	Delete(usize),
}

const INFINITY: usize = usize::MAX;

impl DeltaOp {
	fn len(&self) -> usize {
		match self {
			DeltaOp::Insert(Insert::Text(t), _) => t.len(),
			DeltaOp::Insert(Insert::Embed(_), _) => 1,
			DeltaOp::Retain(n, _) | DeltaOp::Delete(n) => *n,
		}
	}

	fn attributes(&self) -> Option<&Attributes> {
		match self {
			DeltaOp::Insert(_, a) | DeltaOp::Retain(_, a) => a.as_ref(),
			DeltaOp::Delete(_) => None,
		}
	}
}

fn invalid(msg: impl Into<String>) -> Error {
	Error::InvalidOp(msg.into())
}

fn parse_attributes(obj: &Map<String, Value>) -> RtResult<Option<Attributes>> {
	match obj.get("attributes") {
		None | Some(Value::Null) => Ok(None),
		Some(Value::Object(a)) if a.is_empty() => Ok(None),
		Some(Value::Object(a)) => Ok(Some(a.clone())),
		Some(_) => Err(invalid("delta attributes must be an object")),
	}
}

fn parse_length(v: &Value) -> RtResult<usize> {
	v.as_u64()
		.and_then(|n| usize::try_from(n).ok())
		.ok_or_else(|| invalid("delta length must be a non-negative integer"))
}

fn parse_op(value: &Value) -> RtResult<DeltaOp> {
	let obj = value.as_object().ok_or_else(|| invalid("delta op must be an object"))?;
	let attributes = parse_attributes(obj)?;
	if let Some(insert) = obj.get("insert") {
		let insert = match insert {
			Value::String(s) => Insert::Text(s.encode_utf16().collect()),
			Value::Object(_) => Insert::Embed(insert.clone()),
			_ => return Err(invalid("delta insert must be a string or an embed")),
		};
		Ok(DeltaOp::Insert(insert, attributes))
	} else if let Some(n) = obj.get("retain") {
		Ok(DeltaOp::Retain(parse_length(n)?, attributes))
	} else if let Some(n) = obj.get("delete") {
		Ok(DeltaOp::Delete(parse_length(n)?))
	} else {
		Err(invalid("unknown delta op"))
	}
}

fn op_to_value(op: &DeltaOp) -> RtResult<Value> {
	let mut obj = Map::new();
	match op {
		DeltaOp::Insert(Insert::Text(t), _) => {
			let text = String::from_utf16(t).map_err(|_| invalid("delta splits a surrogate pair"))?;
			obj.insert("insert".into(), Value::String(text));
		}
		DeltaOp::Insert(Insert::Embed(e), _) => {
			obj.insert("insert".into(), e.clone());
		}
		DeltaOp::Retain(n, _) => {
			obj.insert("retain".into(), Value::from(*n));
		}
		DeltaOp::Delete(n) => {
			obj.insert("delete".into(), Value::from(*n));
		}
	}
	if let Some(a) = op.attributes() {
		obj.insert("attributes".into(), Value::Object(a.clone()));
	}
	Ok(Value::Object(obj))
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Delta {
	ops: Vec<DeltaOp>,
}

impl Delta {
	fn parse(value: &Value) -> RtResult<Self> {
		let items = match value {
			Value::Array(items) => items,
			Value::Object(obj) => match obj.get("ops") {
				Some(Value::Array(items)) => items,
				None => return Ok(Delta::default()),
				Some(_) => return Err(invalid("delta 'ops' must be a list")),
			},
			Value::Null => return Ok(Delta::default()),
			_ => return Err(invalid("delta must be an object or a list")),
		};
		let mut delta = Delta::default();
		for item in items {
			delta.push(parse_op(item)?);
		}
		Ok(delta)
	}

	fn to_value(&self) -> RtResult<Value> {
		let ops = self.ops.iter().map(op_to_value).collect::<RtResult<Vec<_>>>()?;
		Ok(Value::Object(Map::from_iter([("ops".to_string(), Value::Array(ops))])))
	}

	fn push(&mut self, op: DeltaOp) {
		if op.len() == 0 && !matches!(op, DeltaOp::Insert(Insert::Embed(_), _)) {
			return;
		}
		let mut index = self.ops.len();
		if let Some(last) = self.ops.last_mut() {
			if let (DeltaOp::Delete(n), DeltaOp::Delete(m)) = (&mut *last, &op) {
				*n += m;
				return;
			}
			// inserts go before a trailing delete at the same position
			if matches!(last, DeltaOp::Delete(_)) && matches!(op, DeltaOp::Insert(..)) {
				index -= 1;
				if index == 0 {
					self.ops.insert(0, op);
					return;
				}
			}
		}
		if let Some(prev) = index.checked_sub(1).and_then(|i| self.ops.get_mut(i))
			&& prev.attributes() == op.attributes()
		{
			match (prev, &op) {
				(DeltaOp::Insert(Insert::Text(a), _), DeltaOp::Insert(Insert::Text(b), _)) => {
					a.extend_from_slice(b);
					return;
				}
				(DeltaOp::Retain(a, _), DeltaOp::Retain(b, _)) => {
					*a = a.saturating_add(*b);
					return;
				}
				_ => {}
			}
		}
		self.ops.insert(index, op);
	}

	fn retain(&mut self, len: usize, attributes: Option<Attributes>) {
		self.push(DeltaOp::Retain(len, attributes));
	}

	fn chop(mut self) -> Self {
		if let Some(DeltaOp::Retain(_, None)) = self.ops.last() {
			self.ops.pop();
		}
		self
	}

	fn is_document(&self) -> bool {
		self.ops.iter().all(|op| matches!(op, DeltaOp::Insert(..)))
	}

	fn compose(&self, other: &Delta) -> Delta {
		let mut this_iter = OpIter::new(&self.ops);
		let mut other_iter = OpIter::new(&other.ops);
		let mut delta = Delta::default();
		while this_iter.has_next() || other_iter.has_next() {
			if other_iter.peek_is_insert() {
				delta.push(other_iter.next(INFINITY));
			} else if this_iter.peek_is_delete() {
				delta.push(this_iter.next(INFINITY));
			} else {
				let len = this_iter.peek_len().min(other_iter.peek_len());
				let this_op = this_iter.next(len);
				let other_op = other_iter.next(len);
				match other_op {
					DeltaOp::Retain(_, other_attrs) => {
						let keep_null = matches!(this_op, DeltaOp::Retain(..));
						let attributes = compose_attributes(this_op.attributes(), other_attrs.as_ref(), keep_null);
						match this_op {
							DeltaOp::Retain(..) => delta.push(DeltaOp::Retain(len, attributes)),
							DeltaOp::Insert(insert, _) => delta.push(DeltaOp::Insert(insert, attributes)),
							DeltaOp::Delete(_) => {}
						}
					}
					DeltaOp::Delete(_) if matches!(this_op, DeltaOp::Retain(..)) => delta.push(other_op),
					// deleting our insert cancels both
					_ => {}
				}
			}
		}
		delta.chop()
	}

	/// Transform `other` against `self`; with `priority`, `self` happened first
	fn transform(&self, other: &Delta, priority: bool) -> Delta {
		let mut this_iter = OpIter::new(&self.ops);
		let mut other_iter = OpIter::new(&other.ops);
		let mut delta = Delta::default();
		while this_iter.has_next() || other_iter.has_next() {
			if this_iter.peek_is_insert() && (priority || !other_iter.peek_is_insert()) {
				let len = this_iter.next(INFINITY).len();
				delta.retain(len, None);
			} else if other_iter.peek_is_insert() {
				delta.push(other_iter.next(INFINITY));
			} else {
				let len = this_iter.peek_len().min(other_iter.peek_len());
				let this_op = this_iter.next(len);
				let other_op = other_iter.next(len);
				if matches!(this_op, DeltaOp::Delete(_)) {
					continue;
				} else if matches!(other_op, DeltaOp::Delete(_)) {
					delta.push(other_op);
				} else {
					let attributes = transform_attributes(this_op.attributes(), other_op.attributes(), priority);
					delta.retain(len, attributes);
				}
			}
		}
		delta.chop()
	}
}

fn compose_attributes(a: Option<&Attributes>, b: Option<&Attributes>, keep_null: bool) -> Option<Attributes> {
	let mut attributes = b.cloned().unwrap_or_default();
	if !keep_null {
		attributes.retain(|_, v| !v.is_null());
	}
	if let Some(a) = a {
		for (key, value) in a {
			if b.is_none_or(|b| !b.contains_key(key)) {
				attributes.insert(key.clone(), value.clone());
			}
		}
	}
	if attributes.is_empty() { None } else { Some(attributes) }
}

fn transform_attributes(a: Option<&Attributes>, b: Option<&Attributes>, priority: bool) -> Option<Attributes> {
	let Some(a) = a else {
		return b.cloned();
	};
	let b = b?;
	if !priority {
		return Some(b.clone());
	}
	let attributes: Attributes =
		b.iter().filter(|(key, _)| !a.contains_key(*key)).map(|(k, v)| (k.clone(), v.clone())).collect();
	if attributes.is_empty() { None } else { Some(attributes) }
}

struct OpIter<'a> {
	ops: &'a [DeltaOp],
	index: usize,
	offset: usize,
}

impl<'a> OpIter<'a> {
	fn new(ops: &'a [DeltaOp]) -> Self {
		Self { ops, index: 0, offset: 0 }
	}

	fn has_next(&self) -> bool {
		self.peek_len() < INFINITY
	}

	fn peek_len(&self) -> usize {
		self.ops.get(self.index).map_or(INFINITY, |op| op.len() - self.offset)
	}

	fn peek_is_insert(&self) -> bool {
		matches!(self.ops.get(self.index), Some(DeltaOp::Insert(..)))
	}

	fn peek_is_delete(&self) -> bool {
		matches!(self.ops.get(self.index), Some(DeltaOp::Delete(_)))
	}

	fn next(&mut self, len: usize) -> DeltaOp {
		let Some(op) = self.ops.get(self.index) else {
			return DeltaOp::Retain(INFINITY, None);
		};
		let offset = self.offset;
		let op_len = op.len();
		let len = if len >= op_len - offset {
			self.index += 1;
			self.offset = 0;
			op_len - offset
		} else {
			self.offset += len;
			len
		};
		match op {
			DeltaOp::Delete(_) => DeltaOp::Delete(len),
			DeltaOp::Retain(_, a) => DeltaOp::Retain(len, a.clone()),
			DeltaOp::Insert(Insert::Text(t), a) => {
				DeltaOp::Insert(Insert::Text(t[offset..offset + len].to_vec()), a.clone())
			}
			DeltaOp::Insert(Insert::Embed(e), a) => DeltaOp::Insert(Insert::Embed(e.clone()), a.clone()),
		}
	}
}

pub fn create(data: Option<Value>) -> RtResult<Value> {
	let delta = match data {
		Some(data) => Delta::parse(&data)?,
		None => Delta::default(),
	};
	if !delta.is_document() {
		return Err(invalid("rich text document may only contain inserts"));
	}
	delta.to_value()
}

pub fn apply(data: &Value, op: &Value) -> RtResult<Value> {
	let doc = Delta::parse(data)?;
	let result = doc.compose(&Delta::parse(op)?);
	if !result.is_document() {
		return Err(invalid("operation reaches past the end of the document"));
	}
	result.to_value()
}

pub fn compose(op1: &Value, op2: &Value) -> RtResult<Value> {
	Delta::parse(op1)?.compose(&Delta::parse(op2)?).to_value()
}

pub fn normalize(op: Value) -> RtResult<Value> {
	Delta::parse(&op)?.to_value()
}

pub fn transform(op: &Value, other: &Value, side: Side) -> RtResult<Value> {
	let op = Delta::parse(op)?;
	let other = Delta::parse(other)?;
	other.transform(&op, side == Side::Left).to_value()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_apply_insert_and_format() {
		let doc = json!({ "ops": [{ "insert": "Hello\n" }] });
		let op = json!({ "ops": [{ "retain": 5 }, { "insert": " world" }] });
		let doc = apply(&doc, &op).expect("apply");
		assert_eq!(doc, json!({ "ops": [{ "insert": "Hello world\n" }] }));

		let bold = json!({ "ops": [{ "retain": 5, "attributes": { "bold": true } }] });
		let doc = apply(&doc, &bold).expect("format");
		assert_eq!(
			doc,
			json!({ "ops": [
				{ "insert": "Hello", "attributes": { "bold": true } },
				{ "insert": " world\n" }
			] })
		);
	}

	#[test]
	fn test_apply_delete() {
		let doc = json!({ "ops": [{ "insert": "abcdef" }] });
		let doc = apply(&doc, &json!([{ "retain": 1 }, { "delete": 3 }])).expect("apply");
		assert_eq!(doc, json!({ "ops": [{ "insert": "aef" }] }));
	}

	#[test]
	fn test_apply_past_end_fails() {
		let doc = json!({ "ops": [{ "insert": "ab" }] });
		assert!(apply(&doc, &json!([{ "retain": 5, "attributes": { "bold": true } }])).is_err());
	}

	#[test]
	fn test_compose_removes_null_attributes_on_insert() {
		let a = json!([{ "insert": "x", "attributes": { "bold": true } }]);
		let b = json!([{ "retain": 1, "attributes": { "bold": null } }]);
		assert_eq!(compose(&a, &b).expect("compose"), json!({ "ops": [{ "insert": "x" }] }));
	}

	#[test]
	fn test_transform_concurrent_inserts_converge() {
		let doc = json!({ "ops": [{ "insert": "abc" }] });
		let left = json!([{ "retain": 1 }, { "insert": "X" }]);
		let right = json!([{ "retain": 1 }, { "insert": "Y" }, { "retain": 1 }, { "delete": 1 }]);
		let (l2, r2) = crate::ot::OtTypeId::RichText.transform_x(&left, &right).expect("transform");
		let a = apply(&apply(&doc, &left).expect("left"), &r2).expect("right'");
		let b = apply(&apply(&doc, &right).expect("right"), &l2).expect("left'");
		assert_eq!(a, b);
	}

	#[test]
	fn test_create_rejects_non_document() {
		assert!(create(Some(json!([{ "retain": 1 }]))).is_err());
		assert_eq!(create(None).expect("create"), json!({ "ops": [] }));
	}
}

// vim: ts=4
