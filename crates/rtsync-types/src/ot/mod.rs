//! Operational transform document types
//!
//! The `type` field of a snapshot selects one of a closed set of OT algebras.
//! Every algebra provides the same interface:
//!
//! - `create(data)` - initial document content
//! - `apply(data, op)` - document after applying an operation
//! - `compose(op1, op2)` - single operation equivalent to `op1` then `op2`
//! - `normalize(op)` - canonical form of an operation
//! - `transform(op, other, side)` - `op` rewritten to apply after `other`
//!
//! Types are resolved by name through a static table at document load time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::prelude::*;

pub mod json0;
pub mod rich_text;

/// Tie-break side for concurrent operations at the same position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Left,
	Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtTypeId {
	#[serde(rename = "json0", alias = "http://sharejs.org/types/JSONv0")]
	Json0,
	#[serde(rename = "rich-text", alias = "http://sharejs.org/types/rich-text/v1")]
	RichText,
}

/// Registered OT types, keyed by name and URI
static REGISTRY: &[(&str, &str, OtTypeId)] = &[
	("json0", "http://sharejs.org/types/JSONv0", OtTypeId::Json0),
	("rich-text", "http://sharejs.org/types/rich-text/v1", OtTypeId::RichText),
];

impl OtTypeId {
	pub fn lookup(name: &str) -> RtResult<OtTypeId> {
		REGISTRY
			.iter()
			.find(|(n, uri, _)| *n == name || *uri == name)
			.map(|(_, _, id)| *id)
			.ok_or_else(|| Error::UnknownOtType(name.to_string()))
	}

	pub fn name(self) -> &'static str {
		match self {
			OtTypeId::Json0 => "json0",
			OtTypeId::RichText => "rich-text",
		}
	}

	pub fn create(self, data: Option<Value>) -> RtResult<Value> {
		match self {
			OtTypeId::Json0 => Ok(data.unwrap_or(Value::Null)),
			OtTypeId::RichText => rich_text::create(data),
		}
	}

	pub fn apply(self, data: &Value, op: &Value) -> RtResult<Value> {
		match self {
			OtTypeId::Json0 => json0::apply(data, op),
			OtTypeId::RichText => rich_text::apply(data, op),
		}
	}

	pub fn compose(self, op1: &Value, op2: &Value) -> RtResult<Value> {
		match self {
			OtTypeId::Json0 => json0::compose(op1, op2),
			OtTypeId::RichText => rich_text::compose(op1, op2),
		}
	}

	pub fn normalize(self, op: Value) -> RtResult<Value> {
		match self {
			OtTypeId::Json0 => json0::normalize(op),
			OtTypeId::RichText => rich_text::normalize(op),
		}
	}

	pub fn transform(self, op: &Value, other: &Value, side: Side) -> RtResult<Value> {
		match self {
			OtTypeId::Json0 => json0::transform(op, other, side),
			OtTypeId::RichText => rich_text::transform(op, other, side),
		}
	}

	/// Transform two concurrent operations against each other.
	///
	/// Returns `(left', right')` such that `apply(apply(d, left), right')`
	/// equals `apply(apply(d, right), left')`.
	pub fn transform_x(self, left: &Value, right: &Value) -> RtResult<(Value, Value)> {
		let left_t = self.transform(left, right, Side::Left)?;
		let right_t = self.transform(right, left, Side::Right)?;
		Ok((left_t, right_t))
	}
}

impl fmt::Display for OtTypeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lookup() {
		assert_eq!(OtTypeId::lookup("json0").ok(), Some(OtTypeId::Json0));
		assert_eq!(
			OtTypeId::lookup("http://sharejs.org/types/rich-text/v1").ok(),
			Some(OtTypeId::RichText)
		);
		assert!(matches!(OtTypeId::lookup("text0"), Err(Error::UnknownOtType(_))));
	}

	#[test]
	fn test_serde_name() {
		let v = serde_json::to_value(OtTypeId::RichText).expect("serialize");
		assert_eq!(v, Value::String("rich-text".into()));
		let t: OtTypeId =
			serde_json::from_value(Value::String("http://sharejs.org/types/JSONv0".into()))
				.expect("deserialize");
		assert_eq!(t, OtTypeId::Json0);
	}
}

// vim: ts=4
